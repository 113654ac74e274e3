use crate::error::Error;
use crate::infrastructure::documents::UploadedDocument;
use async_trait::async_trait;
use axum::extract::{FromRequest, Multipart, Request};
use std::collections::HashMap;

pub mod conversations;

/// A `multipart/form-data` body: text fields by name, plus every attached file.
///
/// Empty file slots (no file name) are dropped.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub fields: HashMap<String, String>,
    pub documents: Vec<UploadedDocument>,
}

impl UploadForm {
    /// A non-blank text field, exactly as submitted.
    pub fn required(&self, name: &str) -> Result<String, Error> {
        self.fields
            .get(name)
            .filter(|value| !value.trim().is_empty())
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("form field `{name}` is required")))
    }
}

#[async_trait]
impl<S> FromRequest<S> for UploadForm
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Error> {
        let mut multipart = Multipart::from_request(req, state)
            .await
            .map_err(|e| Error::InvalidRequest(e.body_text()))?;

        let mut form = UploadForm::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| Error::InvalidRequest(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_owned();

            match field.file_name().map(str::to_owned) {
                Some(filename) => {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| Error::InvalidRequest(e.body_text()))?;
                    if !filename.trim().is_empty() {
                        form.documents.push(UploadedDocument::new(filename, bytes));
                    }
                }
                None => {
                    let value = field
                        .text()
                        .await
                        .map_err(|e| Error::InvalidRequest(e.body_text()))?;
                    form.fields.insert(name, value);
                }
            }
        }

        Ok(form)
    }
}
