//! Persisted, per-conversation vector index on an HNSW graph.
//!
//! Every build writes a fresh `ruvector-core` database file into the
//! conversation's index directory, then atomically points `manifest.json` at
//! it. Readers only follow the manifest, so they never see a half-built
//! index. Database files the manifest no longer names are deleted after the
//! switch.

use crate::error::{Error, Result};
use chrono::Utc;
use log::debug;
use nalgebra::DVector;
use ruvector_core::types::{DbOptions, HnswConfig};
use ruvector_core::{DistanceMetric, SearchQuery, VectorDB, VectorEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

const STORE_PREFIX: &str = "chunks-";
const STORE_SUFFIX: &str = ".db";

const HNSW_M: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;
const HNSW_EF_SEARCH: usize = 100;
const HNSW_MAX_ELEMENTS: usize = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub source: String,
    pub text: String,
    /// Cosine similarity, in `[-1, 1]`.
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    embedder: String,
    dimensions: usize,
    /// File name of the database inside the index directory.
    store: String,
    chunks: usize,
}

pub struct VectorIndex {
    dir: PathBuf,
    manifest: Manifest,
    db: VectorDB,
}

impl VectorIndex {
    /// Starts a new, empty index in `dir`. Nothing is visible to readers
    /// until [`VectorIndex::commit`].
    pub fn create(dir: &Path, embedder: impl Into<String>, dimensions: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let store = format!(
            "{STORE_PREFIX}{}{STORE_SUFFIX}",
            Utc::now().format("%Y%m%d%H%M%S%9f")
        );
        let db = open_store(&dir.join(&store), dimensions)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest: Manifest {
                embedder: embedder.into(),
                dimensions,
                store,
                chunks: 0,
            },
            db,
        })
    }

    /// Opens the index the manifest in `dir` currently names.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::Index(format!("cannot read index at {}: {e}", dir.display())))?;
        let manifest: Manifest = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Index(format!("corrupt manifest at {}: {e}", path.display())))?;

        let store = dir.join(&manifest.store);
        if !store.is_file() {
            return Err(Error::Index(format!("missing index store {}", store.display())));
        }
        let db = open_store(&store, manifest.dimensions)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            manifest,
            db,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn embedder(&self) -> &str {
        &self.manifest.embedder
    }

    pub fn dimensions(&self) -> usize {
        self.manifest.dimensions
    }

    pub fn len(&self) -> usize {
        self.manifest.chunks
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.chunks == 0
    }

    /// Adds a chunk. A zero vector carries no direction and is skipped.
    pub fn insert(
        &mut self,
        source: impl Into<String>,
        text: impl Into<String>,
        vector: Vec<f32>,
    ) -> Result<()> {
        let Some(vector) = self.normalized(vector)? else {
            debug!("skipping chunk with a zero embedding");
            return Ok(());
        };

        let position = self.manifest.chunks;
        let metadata = HashMap::from([
            ("source".to_owned(), Value::from(source.into())),
            ("text".to_owned(), Value::from(text.into())),
            ("position".to_owned(), Value::from(position)),
        ]);

        self.db
            .insert(VectorEntry {
                id: Some(position.to_string()),
                vector,
                metadata: Some(metadata),
            })
            .map_err(|e| Error::Index(format!("insert failed: {e}")))?;
        self.manifest.chunks += 1;
        Ok(())
    }

    /// Returns up to `k` chunks closest to `query`, best first. Equal scores
    /// keep insertion order.
    pub fn search(&self, query: Vec<f32>, k: usize) -> Result<Vec<SearchHit>> {
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        let Some(query) = self.normalized(query)? else {
            return Ok(Vec::new());
        };

        let results = self
            .db
            .search(SearchQuery {
                vector: query,
                k,
                filter: None,
                ef_search: Some(k.max(HNSW_EF_SEARCH)),
            })
            .map_err(|e| Error::Index(format!("search failed: {e}")))?;

        let mut hits = results
            .into_iter()
            .map(|result| -> Result<(u64, SearchHit)> {
                let metadata = result.metadata.unwrap_or_default();
                let field = |name: &str| {
                    metadata
                        .get(name)
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                        .ok_or_else(|| Error::Index(format!("chunk {} has no {name}", result.id)))
                };
                let position = metadata
                    .get("position")
                    .and_then(Value::as_u64)
                    .unwrap_or(u64::MAX);

                // cosine distance back to similarity
                let hit = SearchHit {
                    source: field("source")?,
                    text: field("text")?,
                    score: 1.0 - result.score,
                };
                Ok((position, hit))
            })
            .collect::<Result<Vec<(u64, SearchHit)>>>()?;

        hits.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        Ok(hits.into_iter().map(|(_, hit)| hit).collect())
    }

    /// Publishes this index as the current one of its directory and deletes
    /// the stores of earlier builds.
    pub fn commit(&self) -> Result<()> {
        let bytes = serde_json::to_vec(&self.manifest)?;
        let mut file = NamedTempFile::new_in(&self.dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(self.dir.join(MANIFEST_FILE_NAME))
            .map_err(|e| Error::Io(e.error))?;

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let stale = name.starts_with(STORE_PREFIX)
                && name.ends_with(STORE_SUFFIX)
                && name != self.manifest.store;
            if stale {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => debug!("removed stale index store {name}"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Drops an uncommitted build and deletes its store.
    pub fn discard(self) -> Result<()> {
        let store = self.dir.join(&self.manifest.store);
        drop(self.db);

        match std::fs::remove_file(&store) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn normalized(&self, vector: Vec<f32>) -> Result<Option<Vec<f32>>> {
        if vector.len() != self.manifest.dimensions {
            return Err(Error::Index(format!(
                "expected a {}-dimensional vector, got {}",
                self.manifest.dimensions,
                vector.len()
            )));
        }

        let vector = DVector::from_vec(vector);
        let norm = vector.norm();
        if norm <= f32::EPSILON {
            return Ok(None);
        }
        let unit = vector / norm;
        Ok(Some(unit.as_slice().to_vec()))
    }
}

fn open_store(path: &Path, dimensions: usize) -> Result<VectorDB> {
    let mut options = DbOptions::default();
    options.dimensions = dimensions;
    options.distance_metric = DistanceMetric::Cosine;
    options.storage_path = path.to_string_lossy().into_owned();
    options.hnsw_config = Some(HnswConfig {
        m: HNSW_M,
        ef_construction: HNSW_EF_CONSTRUCTION,
        ef_search: HNSW_EF_SEARCH,
        max_elements: HNSW_MAX_ELEMENTS,
    });
    options.quantization = None;

    VectorDB::new(options)
        .map_err(|e| Error::Index(format!("cannot open index store {}: {e}", path.display())))
}

/// Open indexes shared by the indexer and the retriever.
///
/// Each index directory is opened once and reused, and a rebuild replaces
/// the cached handle in place.
#[derive(Default)]
pub struct VectorIndexStore {
    open: Mutex<HashMap<PathBuf, Arc<VectorIndex>>>,
}

impl VectorIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn open(&self, dir: &Path) -> Result<Arc<VectorIndex>> {
        if let Some(index) = self.lock()?.get(dir) {
            return Ok(Arc::clone(index));
        }

        let path = dir.to_path_buf();
        let index = tokio::task::spawn_blocking(move || VectorIndex::open(&path))
            .await
            .map_err(|e| Error::Internal(format!("index reader failed: {e}")))??;

        let mut open = self.lock()?;
        let index = open
            .entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(index));
        Ok(Arc::clone(index))
    }

    /// Commits a freshly built index and makes it the cached one.
    pub async fn publish(&self, index: VectorIndex) -> Result<Arc<VectorIndex>> {
        let index = tokio::task::spawn_blocking(move || -> Result<VectorIndex> {
            index.commit()?;
            Ok(index)
        })
        .await
        .map_err(|e| Error::Internal(format!("index writer failed: {e}")))??;

        let index = Arc::new(index);
        self.lock()?
            .insert(index.dir().to_path_buf(), Arc::clone(&index));
        Ok(index)
    }

    /// Forgets and deletes an index directory. A missing directory is not an error.
    pub async fn remove(&self, dir: &Path) -> Result<()> {
        self.lock()?.remove(dir);

        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("index directory {} already gone", dir.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<VectorIndex>>>> {
        self.open
            .lock()
            .map_err(|e| Error::Internal(format!("index cache poisoned: {e}")))
    }
}
