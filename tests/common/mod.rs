//! Shared test fixtures: a scripted chat model, an app wired to an in-memory
//! database, and a hand-rolled multipart encoder.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use di::Ref;
use futures_util::stream;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use studybuddy_api::config::Settings;
use studybuddy_api::core::assistant::ChatMessage;
use studybuddy_api::error::{Error, Result};
use studybuddy_api::infrastructure::database::DatabaseConnection;
use studybuddy_api::infrastructure::embeddings::HashingEmbedder;
use studybuddy_api::infrastructure::traits::{ChatModel, Embedder, FragmentStream};
use studybuddy_api::{app, service_provider};

pub const BOUNDARY: &str = "studybuddy-test-boundary";

/// What the scripted model does when a completion is requested.
#[derive(Clone)]
pub enum Script {
    /// Streams the fragments, then ends.
    Answer(Vec<&'static str>),
    /// Streams the fragments, then fails.
    FailAfter(Vec<&'static str>),
    /// Refuses to open the stream `times` times with a transient error, then answers.
    Unavailable {
        times: usize,
        then: Vec<&'static str>,
    },
    /// Refuses every request outright.
    Rejected,
}

pub struct ScriptedModel {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn answering(fragments: Vec<&'static str>) -> Self {
        Self::new(Script::Answer(fragments))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Messages of the most recent request.
    pub fn last_request(&self) -> Vec<ChatMessage> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

fn fragments(parts: &[&'static str]) -> Vec<Result<String>> {
    parts.iter().map(|part| Ok(part.to_string())).collect()
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<FragmentStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(messages.to_vec());

        let items = match &self.script {
            Script::Answer(parts) => fragments(parts),
            Script::FailAfter(parts) => {
                let mut items = fragments(parts);
                items.push(Err(Error::transient_model("connection reset")));
                items
            }
            Script::Unavailable { times, then } => {
                if call < *times {
                    return Err(Error::transient_model("503 Service Unavailable"));
                }
                fragments(then)
            }
            Script::Rejected => return Err(Error::rejected_model("401 Unauthorized")),
        };

        Ok(Box::pin(stream::iter(items)))
    }
}

pub fn test_settings(upload_dir: &Path) -> Settings {
    Settings {
        upload_dir: upload_dir.to_path_buf(),
        model_max_retries: 2,
        model_retry_backoff_ms: 1,
        ..Settings::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub pool: SqlitePool,
    pub model: Ref<ScriptedModel>,
    pub settings: Settings,
}

pub async fn test_app(upload_dir: &Path, model: ScriptedModel) -> TestApp {
    let settings = test_settings(upload_dir);
    let database = DatabaseConnection::in_memory().await.unwrap();
    let pool = database.pool().clone();
    let model = Ref::new(model);
    let embedder: Ref<dyn Embedder> =
        Ref::new(HashingEmbedder::new(settings.embedding_dimensions));

    let provider = service_provider(
        settings.clone(),
        database,
        model.clone() as Ref<dyn ChatModel>,
        embedder,
    )
    .unwrap();

    TestApp {
        router: app(provider, &settings),
        pool,
        model,
        settings,
    }
}

/// Encodes text fields and files as `multipart/form-data` using [`BOUNDARY`].
pub fn multipart_body(fields: &[(&str, &str)], files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();

    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }

    for (filename, content) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// `(role, content)` of every stored message of a conversation, in order.
pub async fn stored_messages(pool: &SqlitePool, conversation_id: i64) -> Vec<(String, String)> {
    sqlx::query_as("SELECT role, content FROM messages WHERE conversation_id = ? ORDER BY id")
        .bind(conversation_id)
        .fetch_all(pool)
        .await
        .unwrap()
}

/// Polls until the conversation holds `count` messages.
pub async fn wait_for_messages(
    pool: &SqlitePool,
    conversation_id: i64,
    count: usize,
) -> Vec<(String, String)> {
    for _ in 0..200 {
        let messages = stored_messages(pool, conversation_id).await;
        if messages.len() >= count {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    stored_messages(pool, conversation_id).await
}
