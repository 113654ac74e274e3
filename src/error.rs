//! Error taxonomy shared by every layer.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use log::error;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Conversation not found")]
    ConversationNotFound(i64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A document could not be read, parsed or is of an unsupported type.
    #[error("Failed to read document '{filename}': {message}")]
    BadUpload { filename: String, message: String },

    /// The hosted model failed. `retriable` separates transient failures
    /// (timeouts, rate limits, 5xx) from rejected requests.
    #[error("Model error: {message}")]
    Model { message: String, retriable: bool },

    /// Missing, corrupt or inconsistent vector index.
    #[error("Index error: {0}")]
    Index(String),

    /// The embedding model could not be loaded or run.
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn bad_upload(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadUpload {
            filename: filename.into(),
            message: message.into(),
        }
    }

    pub fn transient_model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
            retriable: true,
        }
    }

    pub fn rejected_model(message: impl Into<String>) -> Self {
        Self::Model {
            message: message.into(),
            retriable: false,
        }
    }

    /// Classifies a non-success upstream HTTP status.
    pub fn from_upstream_status(status: StatusCode, message: impl Into<String>) -> Self {
        let retriable = status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT;

        Self::Model {
            message: message.into(),
            retriable,
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Model { retriable: true, .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ConversationNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) | Error::BadUpload { .. } => StatusCode::BAD_REQUEST,
            Error::Model {
                retriable: true, ..
            } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Model {
                retriable: false, ..
            } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::ConversationNotFound(_) => "not_found",
            Error::InvalidRequest(_) => "invalid_request",
            Error::BadUpload { .. } => "bad_upload",
            Error::Model { .. } => "model_error",
            Error::Index(_) => "index_error",
            Error::Embedding(_) => "embedding_error",
            Error::Config(_) => "config_error",
            Error::Database(_) => "database_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Template(_) => "template_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let retriable = err.is_timeout()
            || err.is_connect()
            || err
                .status()
                .is_some_and(|status| status.is_server_error() || status.as_u16() == 429);

        Error::Model {
            message: err.to_string(),
            retriable,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!("{self}");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_maps_to_404() {
        let err = Error::ConversationNotFound(7);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "Conversation not found");
    }

    #[test]
    fn test_model_errors_split_by_retriability() {
        assert_eq!(
            Error::transient_model("rate limited").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::rejected_model("bad key").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert!(Error::transient_model("x").is_retriable());
        assert!(!Error::rejected_model("x").is_retriable());
        assert!(!Error::Index("x".into()).is_retriable());
    }

    #[test]
    fn test_upstream_status_classification() {
        assert!(Error::from_upstream_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_retriable());
        assert!(Error::from_upstream_status(StatusCode::BAD_GATEWAY, "down").is_retriable());
        assert!(!Error::from_upstream_status(StatusCode::UNAUTHORIZED, "bad key").is_retriable());
    }

    #[test]
    fn test_bad_upload_is_client_error() {
        let err = Error::bad_upload("notes.docx", "unsupported");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("notes.docx"));
    }
}
