//! StudyBuddy tutor backend
//!
//! (c) Softlandia 2025

use studybuddy_api::config::Settings;
use studybuddy_api::infrastructure::database::DatabaseConnection;
use studybuddy_api::infrastructure::embeddings::embedder_from_settings;
use studybuddy_api::infrastructure::groq::GroqClient;
use studybuddy_api::infrastructure::traits::ChatModel;
use studybuddy_api::{app, service_provider};

use axum::http::{HeaderValue, Method};
use di::Ref;
use log::info;
use tokio::runtime::{Builder, Runtime};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(web_server_task())
}

async fn web_server_task() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;

    let database = DatabaseConnection::connect(&settings.database_url).await?;
    tokio::fs::create_dir_all(&settings.upload_dir).await?;

    let chat_model: Ref<dyn ChatModel> = Ref::new(GroqClient::new(&settings)?);
    let embedder = embedder_from_settings(&settings).await?;
    info!(
        "Using chat model {} and embedder {} ({} dimensions).",
        chat_model.name(),
        embedder.name(),
        embedder.dimensions()
    );

    let origins = settings
        .cors_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()?;

    let provider = service_provider(settings.clone(), database, chat_model, embedder)?;

    // build our application with a route
    let app = app(provider, &settings).layer(
        CorsLayer::new()
            .allow_headers(Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_origin(origins),
    );

    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;
    info!("Shutting down...");

    Ok(())
}
