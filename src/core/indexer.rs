//! Document ingestion: uploads are extracted, split, embedded and published
//! as the conversation's vector index. The raw files are kept next to it.

use crate::config::{MAX_DOCUMENTS, Settings};
use crate::core::splitter::RecursiveTextSplitter;
use crate::core::traits::DocumentIndexer;
use crate::error::{Error, Result};
use crate::infrastructure::documents::{UploadedDocument, extract_text, sanitize_filename};
use crate::infrastructure::traits::Embedder;
use crate::infrastructure::vector_index::{VectorIndex, VectorIndexStore};
use async_trait::async_trait;
use bytes::Bytes;
use di::{Ref, injectable};
use log::{debug, info, warn};
use tokio::time::Instant;

/// Chunks sent to the embedder per call.
pub const EMBED_BATCH_SIZE: usize = 32;

#[injectable(DocumentIndexer)]
pub struct VectorStoreIndexer {
    settings: Ref<Settings>,
    embedder: Ref<dyn Embedder>,
    indexes: Ref<VectorIndexStore>,
}

/// A document whose text has been read and split.
struct ParsedDocument {
    filename: String,
    bytes: Bytes,
    chunks: Vec<String>,
}

impl VectorStoreIndexer {
    pub fn new(
        settings: Ref<Settings>,
        embedder: Ref<dyn Embedder>,
        indexes: Ref<VectorIndexStore>,
    ) -> Self {
        Self {
            settings,
            embedder,
            indexes,
        }
    }

    fn upload_prefix(conversation_id: i64) -> String {
        format!("{conversation_id}_")
    }

    async fn embed_into(&self, index: &mut VectorIndex, documents: &[ParsedDocument]) -> Result<()> {
        let chunks: Vec<(&str, &String)> = documents
            .iter()
            .flat_map(|document| {
                document
                    .chunks
                    .iter()
                    .map(|chunk| (document.filename.as_str(), chunk))
            })
            .collect();

        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|(_, text)| (*text).clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(Error::Index(format!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }

            for ((source, text), vector) in batch.iter().zip(vectors) {
                index.insert(*source, text.as_str(), vector)?;
            }
        }
        Ok(())
    }

    /// Deletes stored uploads of a conversation, except those named in `keep`.
    async fn remove_uploads(&self, conversation_id: i64, keep: &[String]) -> Result<()> {
        let prefix = Self::upload_prefix(conversation_id);
        let mut entries = match tokio::fs::read_dir(&self.settings.upload_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let stale = name.starts_with(&prefix) && !keep.contains(&name);
            if stale && entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                debug!("removed stored upload {name}");
            }
        }
        Ok(())
    }

    /// Makes the stored uploads of a conversation exactly `documents`.
    async fn store_uploads(&self, conversation_id: i64, documents: &[ParsedDocument]) -> Result<()> {
        let prefix = Self::upload_prefix(conversation_id);
        let names: Vec<String> = documents
            .iter()
            .map(|document| format!("{prefix}{}", document.filename))
            .collect();

        self.remove_uploads(conversation_id, &names).await?;
        for (name, document) in names.iter().zip(documents) {
            tokio::fs::write(self.settings.upload_dir.join(name), &document.bytes).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentIndexer for VectorStoreIndexer {
    async fn build_index(
        &self,
        conversation_id: i64,
        documents: Vec<UploadedDocument>,
    ) -> Result<String> {
        let documents: Vec<UploadedDocument> = documents
            .into_iter()
            .filter(|document| !document.filename.trim().is_empty())
            .collect();
        if documents.len() > MAX_DOCUMENTS {
            warn!(
                "Conversation {conversation_id}: {} documents uploaded, only the first {MAX_DOCUMENTS} are indexed.",
                documents.len()
            );
        }
        let documents: Vec<UploadedDocument> = documents.into_iter().take(MAX_DOCUMENTS).collect();
        if documents.is_empty() {
            return Err(Error::InvalidRequest("no documents to index".into()));
        }

        let started = Instant::now();
        let splitter =
            RecursiveTextSplitter::new(self.settings.chunk_size, self.settings.chunk_overlap);

        // Every document must parse before anything on disk changes.
        let mut parsed = Vec::with_capacity(documents.len());
        for document in documents {
            let filename = sanitize_filename(&document.filename);
            let text = extract_blocking(filename.clone(), document.bytes.clone()).await?;
            let chunks = splitter.split(&text);
            debug!(
                "{filename}: {} characters in {} chunks",
                text.chars().count(),
                chunks.len()
            );

            parsed.push(ParsedDocument {
                filename,
                bytes: document.bytes,
                chunks,
            });
        }

        if parsed.iter().all(|document| document.chunks.is_empty()) {
            return Err(Error::bad_upload(
                "uploaded documents",
                "no extractable text found",
            ));
        }

        tokio::fs::create_dir_all(&self.settings.upload_dir).await?;
        let dir = self.settings.vector_dir(conversation_id);
        let mut index =
            VectorIndex::create(&dir, self.embedder.name(), self.embedder.dimensions())?;
        if let Err(e) = self.embed_into(&mut index, &parsed).await {
            if let Err(cleanup) = index.discard() {
                warn!("Abandoned index build in {} was not removed: {cleanup}", dir.display());
            }
            return Err(e);
        }

        let index = self.indexes.publish(index).await?;
        self.store_uploads(conversation_id, &parsed).await?;

        info!(
            "Indexed {} chunks from {} documents for conversation {conversation_id} in {:.2} seconds.",
            index.len(),
            parsed.len(),
            started.elapsed().as_secs_f32()
        );

        Ok(dir.to_string_lossy().into_owned())
    }

    async fn remove_index(&self, conversation_id: i64) -> Result<()> {
        self.indexes
            .remove(&self.settings.vector_dir(conversation_id))
            .await?;
        self.remove_uploads(conversation_id, &[]).await?;

        debug!("Removed stored documents of conversation {conversation_id}.");
        Ok(())
    }
}

async fn extract_blocking(filename: String, bytes: Bytes) -> Result<String> {
    let name = filename.clone();

    tokio::task::spawn_blocking(move || extract_text(&filename, &bytes))
        .await
        .map_err(|e| Error::bad_upload(name, format!("parser crashed: {e}")))?
}
