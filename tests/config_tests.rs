//! Settings loading tests
//!
//! Tests are serialized because they mutate the process environment.

use serial_test::serial;
use std::path::PathBuf;
use studybuddy_api::config::{EmbeddingProvider, Settings};
use studybuddy_api::error::Error;

const KEYS: [&str; 8] = [
    "CHUNK_SIZE",
    "CHUNK_OVERLAP",
    "RETRIEVAL_TOP_K",
    "UPLOAD_DIR",
    "CORS_ORIGINS",
    "EMBEDDING_PROVIDER",
    "EMBEDDING_MODEL_DIR",
    "GROQ_API_KEY",
];

fn clear_env() {
    for key in KEYS {
        // SAFETY: tests touching the environment are serialized.
        unsafe { std::env::remove_var(key) };
    }
}

fn set_env(key: &str, value: &str) {
    // SAFETY: tests touching the environment are serialized.
    unsafe { std::env::set_var(key, value) };
}

#[test]
#[serial]
fn test_unset_variables_fall_back_to_defaults() {
    clear_env();

    let settings = Settings::from_env().unwrap();
    let defaults = Settings::default();
    assert_eq!(settings.chunk_size, defaults.chunk_size);
    assert_eq!(settings.retrieval_top_k, defaults.retrieval_top_k);
    assert_eq!(settings.embedding_provider, EmbeddingProvider::Onnx);
    assert!(settings.groq_api_key.is_none());
}

#[test]
#[serial]
fn test_variables_override_defaults() {
    clear_env();
    set_env("CHUNK_SIZE", "500");
    set_env("CHUNK_OVERLAP", "50");
    set_env("RETRIEVAL_TOP_K", " 5 ");
    set_env("UPLOAD_DIR", "/tmp/studybuddy");
    set_env("CORS_ORIGINS", "http://a.test, http://b.test,");
    set_env("EMBEDDING_PROVIDER", "remote");
    set_env("EMBEDDING_MODEL_DIR", "/opt/models/minilm");
    set_env("GROQ_API_KEY", "gsk_test");

    let settings = Settings::from_env().unwrap();
    clear_env();

    assert_eq!(settings.chunk_size, 500);
    assert_eq!(settings.chunk_overlap, 50);
    assert_eq!(settings.retrieval_top_k, 5);
    assert_eq!(settings.upload_dir, PathBuf::from("/tmp/studybuddy"));
    assert_eq!(settings.cors_origins, vec!["http://a.test", "http://b.test"]);
    assert_eq!(settings.embedding_provider, EmbeddingProvider::Remote);
    assert_eq!(settings.embedding_model_dir, PathBuf::from("/opt/models/minilm"));
    assert_eq!(settings.groq_api_key.as_deref(), Some("gsk_test"));
}

#[test]
#[serial]
fn test_unparsable_variable_is_config_error() {
    clear_env();
    set_env("CHUNK_SIZE", "a thousand");

    let result = Settings::from_env();
    clear_env();

    assert!(matches!(result, Err(Error::Config(message)) if message.contains("CHUNK_SIZE")));
}

#[test]
#[serial]
fn test_inconsistent_chunking_is_rejected() {
    clear_env();
    set_env("CHUNK_SIZE", "100");
    set_env("CHUNK_OVERLAP", "150");

    let result = Settings::from_env();
    clear_env();

    assert!(matches!(result, Err(Error::Config(_))));
}
