//! Similarity search over a conversation's persisted index.

use crate::core::traits::ContextRetriever;
use crate::error::{Error, Result};
use crate::infrastructure::traits::Embedder;
use crate::infrastructure::vector_index::VectorIndexStore;
use async_trait::async_trait;
use di::{Ref, injectable};
use log::debug;
use std::path::Path;
use std::sync::Arc;

#[injectable(ContextRetriever)]
pub struct VectorStoreRetriever {
    embedder: Ref<dyn Embedder>,
    indexes: Ref<VectorIndexStore>,
}

impl VectorStoreRetriever {
    pub fn new(embedder: Ref<dyn Embedder>, indexes: Ref<VectorIndexStore>) -> Self {
        Self { embedder, indexes }
    }
}

#[async_trait]
impl ContextRetriever for VectorStoreRetriever {
    async fn retrieve(&self, query: &str, handle: Option<&str>, k: usize) -> Result<String> {
        let Some(handle) = handle else {
            return Ok(String::new());
        };

        let index = self.indexes.open(Path::new(handle)).await?;
        if index.embedder() != self.embedder.name()
            || index.dimensions() != self.embedder.dimensions()
        {
            return Err(Error::Index(format!(
                "index at {handle} was built with {} ({} dimensions), current embedder is {} ({} dimensions)",
                index.embedder(),
                index.dimensions(),
                self.embedder.name(),
                self.embedder.dimensions()
            )));
        }

        let query_vector = self
            .embedder
            .embed(&[query.to_owned()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Index("embedder returned no vector for the query".into()))?;

        let searched = Arc::clone(&index);
        let hits = tokio::task::spawn_blocking(move || searched.search(query_vector, k))
            .await
            .map_err(|e| Error::Index(format!("search task failed: {e}")))??;
        debug!(
            "Retrieved {} of {} chunks from {handle}, best score {:.3}.",
            hits.len(),
            index.len(),
            hits.first().map(|hit| hit.score).unwrap_or_default()
        );

        Ok(hits
            .iter()
            .map(|hit| hit.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
