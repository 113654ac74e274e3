//! Service settings, read from the environment (and `.env`) at start-up.

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Documents accepted per upload. Anything past this is ignored.
pub const MAX_DOCUMENTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Sentence-transformer model run locally through ONNX Runtime.
    Onnx,
    /// OpenAI-compatible embeddings endpoint.
    Remote,
}

impl FromStr for EmbeddingProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(EmbeddingProvider::Onnx),
            "remote" => Ok(EmbeddingProvider::Remote),
            other => Err(Error::Config(format!(
                "EMBEDDING_PROVIDER must be `onnx` or `remote`, got `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_address: String,
    pub cors_origins: Vec<String>,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,

    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub retrieval_top_k: usize,

    pub embedding_provider: EmbeddingProvider,
    pub embedding_url: String,
    pub embedding_model: String,
    /// Where the ONNX export and tokenizer of `embedding_model` are cached.
    pub embedding_model_dir: PathBuf,
    pub embedding_dimensions: usize,

    pub groq_api_key: Option<String>,
    pub groq_base_url: String,
    pub groq_model: String,
    pub model_temperature: f32,
    pub model_connect_timeout_secs: u64,
    /// Longest silence tolerated between two chunks of a response.
    pub model_timeout_secs: u64,
    pub model_max_retries: u32,
    pub model_retry_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://studybuddy.db?mode=rwc".to_owned(),
            bind_address: "0.0.0.0:8000".to_owned(),
            cors_origins: vec!["http://localhost:3000".to_owned()],
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 50 * 1024 * 1024,
            chunk_size: 1000,
            chunk_overlap: 200,
            retrieval_top_k: 3,
            embedding_provider: EmbeddingProvider::Onnx,
            embedding_url: "http://localhost:11434/v1".to_owned(),
            embedding_model: "sentence-transformers/all-MiniLM-L6-v2".to_owned(),
            embedding_model_dir: PathBuf::from("models/all-MiniLM-L6-v2"),
            embedding_dimensions: 384,
            groq_api_key: None,
            groq_base_url: "https://api.groq.com/openai/v1".to_owned(),
            groq_model: "groq/compound".to_owned(),
            model_temperature: 0.7,
            model_connect_timeout_secs: 10,
            model_timeout_secs: 120,
            model_max_retries: 2,
            model_retry_backoff_ms: 500,
        }
    }
}

impl Settings {
    /// Loads `.env` if present, then overlays every set variable on the defaults.
    pub fn from_env() -> Result<Settings> {
        dotenvy::dotenv().ok();

        let defaults = Settings::default();
        let settings = Settings {
            database_url: string_var("DATABASE_URL", defaults.database_url),
            bind_address: string_var("BIND_ADDRESS", defaults.bind_address),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            upload_dir: env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            max_upload_bytes: parsed_var("MAX_UPLOAD_BYTES", defaults.max_upload_bytes)?,
            chunk_size: parsed_var("CHUNK_SIZE", defaults.chunk_size)?,
            chunk_overlap: parsed_var("CHUNK_OVERLAP", defaults.chunk_overlap)?,
            retrieval_top_k: parsed_var("RETRIEVAL_TOP_K", defaults.retrieval_top_k)?,
            embedding_provider: parsed_var("EMBEDDING_PROVIDER", defaults.embedding_provider)?,
            embedding_url: string_var("EMBEDDING_URL", defaults.embedding_url),
            embedding_model: string_var("EMBEDDING_MODEL", defaults.embedding_model),
            embedding_model_dir: env::var("EMBEDDING_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.embedding_model_dir),
            embedding_dimensions: parsed_var(
                "EMBEDDING_DIMENSIONS",
                defaults.embedding_dimensions,
            )?,
            groq_api_key: env::var("GROQ_API_KEY").ok().filter(|key| !key.is_empty()),
            groq_base_url: string_var("GROQ_BASE_URL", defaults.groq_base_url),
            groq_model: string_var("GROQ_MODEL", defaults.groq_model),
            model_temperature: parsed_var("MODEL_TEMPERATURE", defaults.model_temperature)?,
            model_connect_timeout_secs: parsed_var(
                "MODEL_CONNECT_TIMEOUT_SECS",
                defaults.model_connect_timeout_secs,
            )?,
            model_timeout_secs: parsed_var("MODEL_TIMEOUT_SECS", defaults.model_timeout_secs)?,
            model_max_retries: parsed_var("MODEL_MAX_RETRIES", defaults.model_max_retries)?,
            model_retry_backoff_ms: parsed_var(
                "MODEL_RETRY_BACKOFF_MS",
                defaults.model_retry_backoff_ms,
            )?,
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("CHUNK_SIZE must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.retrieval_top_k == 0 {
            return Err(Error::Config("RETRIEVAL_TOP_K must be positive".into()));
        }
        if self.embedding_dimensions == 0 {
            return Err(Error::Config("EMBEDDING_DIMENSIONS must be positive".into()));
        }
        Ok(())
    }

    /// Directory holding the persisted index of one conversation.
    pub fn vector_dir(&self, conversation_id: i64) -> PathBuf {
        self.upload_dir.join(format!("vector_{conversation_id}"))
    }
}

fn string_var(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn parsed_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}
