//! Text extraction for uploaded documents.

use crate::error::{Error, Result};
use bytes::Bytes;

/// One uploaded file, as received from the client.
#[derive(Debug, Clone)]
pub struct UploadedDocument {
    pub filename: String,
    pub bytes: Bytes,
}

impl UploadedDocument {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    PlainText,
}

impl DocumentKind {
    pub fn from_filename(filename: &str) -> Option<DocumentKind> {
        let extension = filename.rsplit_once('.')?.1.to_ascii_lowercase();

        match extension.as_str() {
            "pdf" => Some(DocumentKind::Pdf),
            "txt" | "md" | "markdown" => Some(DocumentKind::PlainText),
            _ => None,
        }
    }
}

/// Extracts the full text of a document. Blocking; PDF parsing is CPU bound.
pub fn extract_text(filename: &str, data: &[u8]) -> Result<String> {
    match DocumentKind::from_filename(filename) {
        Some(DocumentKind::Pdf) => pdf_extract::extract_text_from_mem(data)
            .map_err(|e| Error::bad_upload(filename, e.to_string())),
        Some(DocumentKind::PlainText) => String::from_utf8(data.to_vec())
            .map_err(|_| Error::bad_upload(filename, "text is not valid UTF-8")),
        None => Err(Error::bad_upload(
            filename,
            "unsupported document type, expected .pdf, .txt or .md",
        )),
    }
}

/// Strips directories and anything unusual from a client supplied file name.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "document".to_owned()
    } else {
        cleaned.to_owned()
    }
}
