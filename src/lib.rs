//! StudyBuddy tutor backend - Library exports for testing
//!
//! (c) Softlandia 2025

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod infrastructure;

use crate::config::Settings;
use crate::core::assistant::TutorAnswerGenerator;
use crate::core::indexer::VectorStoreIndexer;
use crate::core::retriever::VectorStoreRetriever;
use crate::core::services::DbConversationService;
use crate::infrastructure::database::DatabaseConnection;
use crate::infrastructure::repositories::DbConversationRepository;
use crate::infrastructure::traits::{ChatModel, Embedder};
use crate::infrastructure::vector_index::VectorIndexStore;
use anyhow::anyhow;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use di::{Injectable, Ref, ServiceCollection, ServiceProvider, singleton_factory};
use di_axum::RouterServiceProviderExtensions;

/// Registers every service of the app. The chat model and embedder are
/// passed in so tests can substitute their own.
pub fn service_provider(
    settings: Settings,
    database: DatabaseConnection,
    chat_model: Ref<dyn ChatModel>,
    embedder: Ref<dyn Embedder>,
) -> anyhow::Result<ServiceProvider> {
    let settings = Ref::new(settings);
    let database = Ref::new(database);
    let indexes = Ref::new(VectorIndexStore::new());

    ServiceCollection::new()
        .add(singleton_factory(move |_| settings.clone()))
        .add(singleton_factory(move |_| database.clone()))
        .add(singleton_factory(move |_| chat_model.clone()))
        .add(singleton_factory(move |_| embedder.clone()))
        .add(singleton_factory(move |_| indexes.clone()))
        .add(DbConversationRepository::scoped())
        .add(DbConversationService::scoped())
        .add(VectorStoreIndexer::scoped())
        .add(VectorStoreRetriever::scoped())
        .add(TutorAnswerGenerator::scoped())
        .build_provider()
        .map_err(|e| anyhow!("invalid service configuration: {e:?}"))
}

/// The HTTP app, without transport-level layers such as CORS.
pub fn app(provider: ServiceProvider, settings: &Settings) -> Router {
    api::conversations::router()
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .with_provider(provider)
}
