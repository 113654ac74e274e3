//! Embedding providers.
//!
//! The default is a sentence-transformer (all-MiniLM-L6-v2) run locally with
//! ONNX Runtime. An OpenAI-compatible endpoint can be used instead, and a
//! word-hashing embedder stands in for both in tests.

use crate::config::{EmbeddingProvider, Settings};
use crate::error::{Error, Result};
use crate::infrastructure::traits::Embedder;
use async_trait::async_trait;
use di::Ref;
use log::{info, warn};
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokenizers::Tokenizer;

/// Builds the embedder selected by `EMBEDDING_PROVIDER`.
pub async fn embedder_from_settings(settings: &Settings) -> Result<Ref<dyn Embedder>> {
    let embedder: Ref<dyn Embedder> = match settings.embedding_provider {
        EmbeddingProvider::Onnx => Ref::new(OnnxEmbedder::from_settings(settings).await?),
        EmbeddingProvider::Remote => Ref::new(RemoteEmbedder::new(settings)?),
    };

    Ok(embedder)
}

const MODEL_FILE_NAME: &str = "model.onnx";
const TOKENIZER_FILE_NAME: &str = "tokenizer.json";

/// Tokens per input the model attends to. Longer chunks are truncated.
const MAX_SEQUENCE_LENGTH: usize = 256;

/// Sentence-transformer embedder on ONNX Runtime.
///
/// Expects `model.onnx` and `tokenizer.json` in one directory. Token
/// embeddings are mean-pooled over the attention mask and L2-normalised.
pub struct OnnxEmbedder {
    model: Arc<OnnxModel>,
    name: String,
    dimensions: usize,
}

struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

impl OnnxEmbedder {
    /// Loads `EMBEDDING_MODEL` from `EMBEDDING_MODEL_DIR`, fetching missing
    /// files from the Hugging Face hub first.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let dir = settings.embedding_model_dir.clone();
        tokio::fs::create_dir_all(&dir).await?;

        for (remote, local) in [
            ("onnx/model.onnx", MODEL_FILE_NAME),
            ("tokenizer.json", TOKENIZER_FILE_NAME),
        ] {
            let path = dir.join(local);
            if !tokio::fs::try_exists(&path).await? {
                download_model_file(settings, remote, &path).await?;
            }
        }

        let name = settings.embedding_model.clone();
        let embedder = tokio::task::spawn_blocking(move || Self::from_directory(&dir, name))
            .await
            .map_err(|e| Error::Embedding(format!("model loader crashed: {e}")))??;

        if embedder.dimensions != settings.embedding_dimensions {
            warn!(
                "EMBEDDING_DIMENSIONS is {} but {} produces {}-dimensional vectors; using the model's.",
                settings.embedding_dimensions, embedder.name, embedder.dimensions
            );
        }
        Ok(embedder)
    }

    pub fn from_directory(dir: &Path, name: impl Into<String>) -> Result<Self> {
        let model_path = dir.join(MODEL_FILE_NAME);
        let tokenizer_path = dir.join(TOKENIZER_FILE_NAME);
        for path in [&model_path, &tokenizer_path] {
            if !path.exists() {
                return Err(Error::Embedding(format!("{} not found", path.display())));
            }
        }

        let session = Session::builder()
            .map_err(|e| Error::Embedding(format!("ONNX session builder: {e}")))?
            .with_intra_threads(1)
            .map_err(|e| Error::Embedding(format!("ONNX thread setup: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| Error::Embedding(format!("ONNX model load: {e}")))?;

        // output is [batch, tokens, hidden]
        let dimensions = session
            .outputs()
            .first()
            .and_then(|output| output.dtype().tensor_shape())
            .and_then(|shape| shape.last().copied())
            .filter(|hidden| *hidden > 0)
            .map(|hidden| hidden as usize)
            .unwrap_or(384);

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| Error::Embedding(format!("tokenizer load: {e}")))?;

        let name = name.into();
        info!("Loaded ONNX embedding model {name} ({dimensions} dimensions).");

        Ok(Self {
            model: Arc::new(OnnxModel {
                session: Mutex::new(session),
                tokenizer,
            }),
            name,
            dimensions,
        })
    }
}

impl OnnxModel {
    fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| Error::Embedding(format!("tokenization failed: {e}")))?;

        let rows = encodings.len();
        let tokens = encodings
            .iter()
            .map(|encoding| encoding.get_ids().len())
            .max()
            .unwrap_or(0)
            .clamp(1, MAX_SEQUENCE_LENGTH);

        let mut input_ids = Array2::<i64>::zeros((rows, tokens));
        let mut attention_mask = Array2::<i64>::zeros((rows, tokens));
        let mut token_type_ids = Array2::<i64>::zeros((rows, tokens));
        for (row, encoding) in encodings.iter().enumerate() {
            let columns = encoding
                .get_ids()
                .iter()
                .zip(encoding.get_attention_mask())
                .zip(encoding.get_type_ids())
                .take(tokens)
                .enumerate();
            for (column, ((id, mask), type_id)) in columns {
                input_ids[[row, column]] = i64::from(*id);
                attention_mask[[row, column]] = i64::from(*mask);
                token_type_ids[[row, column]] = i64::from(*type_id);
            }
        }

        let ids = TensorRef::from_array_view(&input_ids)
            .map_err(|e| Error::Embedding(format!("input_ids tensor: {e}")))?;
        let mask = TensorRef::from_array_view(&attention_mask)
            .map_err(|e| Error::Embedding(format!("attention_mask tensor: {e}")))?;
        let types = TensorRef::from_array_view(&token_type_ids)
            .map_err(|e| Error::Embedding(format!("token_type_ids tensor: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| Error::Embedding(format!("session lock poisoned: {e}")))?;
        let outputs = session
            .run(ort::inputs![ids, mask, types])
            .map_err(|e| Error::Embedding(format!("ONNX inference failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Embedding(format!("ONNX output: {e}")))?;
        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        let &[output_rows, output_tokens, hidden] = dims.as_slice() else {
            return Err(Error::Embedding(format!(
                "unexpected ONNX output shape {dims:?}"
            )));
        };
        if output_rows != rows || output_tokens != tokens || data.len() != rows * tokens * hidden {
            return Err(Error::Embedding(format!(
                "ONNX output shape {dims:?} does not match a {rows}x{tokens} input"
            )));
        }

        Ok(mean_pool(data, &attention_mask, hidden))
    }
}

/// Averages the token vectors each mask row selects, then L2-normalises.
///
/// `hidden_states` is `[rows, tokens, hidden]` flattened in row-major order.
fn mean_pool(hidden_states: &[f32], attention_mask: &Array2<i64>, hidden: usize) -> Vec<Vec<f32>> {
    let (rows, tokens) = attention_mask.dim();

    (0..rows)
        .map(|row| {
            let mut pooled = vec![0.0f32; hidden];
            let mut count = 0.0f32;

            for token in 0..tokens {
                if attention_mask[[row, token]] > 0 {
                    let offset = (row * tokens + token) * hidden;
                    for (value, state) in pooled.iter_mut().zip(&hidden_states[offset..offset + hidden]) {
                        *value += state;
                    }
                    count += 1.0;
                }
            }

            if count > 0.0 {
                pooled.iter_mut().for_each(|value| *value /= count);
            }
            let norm = pooled.iter().map(|value| value * value).sum::<f32>().sqrt();
            if norm > 0.0 {
                pooled.iter_mut().for_each(|value| *value /= norm);
            }
            pooled
        })
        .collect()
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // inference is CPU-bound
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed_batch(texts))
            .await
            .map_err(|e| Error::Embedding(format!("embedding task crashed: {e}")))?
    }
}

async fn download_model_file(settings: &Settings, remote: &str, path: &Path) -> Result<()> {
    let url = format!(
        "https://huggingface.co/{}/resolve/main/{remote}",
        settings.embedding_model
    );
    info!("Downloading {url}");

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(settings.model_connect_timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::Embedding(format!("download of {url} failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Embedding(format!(
            "download of {url} failed: HTTP {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Embedding(format!("download of {url} failed: {e}")))?;

    let path = path.to_path_buf();
    let size = bytes.len();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path.parent().unwrap_or(Path::new("."));
        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("model writer failed: {e}")))??;

    info!("Saved {size} bytes from {url}");
    Ok(())
}

/// Deterministic word-hashing embedder for tests.
///
/// Lower-cased unigrams and bigrams are FNV-1a hashed into buckets, so texts
/// sharing words land close together. It knows nothing of meaning.
pub struct HashingEmbedder {
    dimensions: usize,
}

const UNIGRAM_WEIGHT: f32 = 1.0;
const BIGRAM_WEIGHT: f32 = 0.5;

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
            .collect();

        for token in &tokens {
            self.accumulate(&mut vector, token.as_bytes(), UNIGRAM_WEIGHT);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.accumulate(&mut vector, bigram.as_bytes(), BIGRAM_WEIGHT);
        }

        vector
    }

    fn accumulate(&self, vector: &mut [f32], feature: &[u8], weight: f32) {
        let hash = fnv1a(feature);
        let bucket = (hash % self.dimensions as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes.iter().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing-v1"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct RemoteEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(settings: &Settings) -> Result<Self> {
        // responses are single JSON documents, so a total deadline fits here
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.model_connect_timeout_secs))
            .timeout(Duration::from_secs(settings.model_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.embedding_url.trim_end_matches('/').to_owned(),
            model: settings.embedding_model.clone(),
            dimensions: settings.embedding_dimensions,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::from_upstream_status(
                status,
                format!("embedding request failed: HTTP {status} - {body}"),
            ));
        }

        let mut data = response.json::<EmbeddingResponse>().await?.data;
        if data.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "embedding endpoint returned {} vectors for {} texts",
                data.len(),
                texts.len()
            )));
        }

        data.sort_by_key(|d| d.index);
        data.into_iter()
            .map(|d| {
                if d.embedding.len() == self.dimensions {
                    Ok(d.embedding)
                } else {
                    Err(Error::Embedding(format!(
                        "expected {}-dimensional embeddings, got {}",
                        self.dimensions,
                        d.embedding.len()
                    )))
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        dot / (norm_a * norm_b)
    }

    #[test]
    fn test_mean_pool_skips_padding() {
        // two rows of three tokens with hidden size 2; row 1 pads its last token
        let states = [
            1.0, 0.0, 3.0, 0.0, 5.0, 0.0, //
            0.0, 2.0, 0.0, 4.0, 9.0, 9.0,
        ];
        let mask = array![[1, 1, 1], [1, 1, 0]];

        let pooled = mean_pool(&states, &mask, 2);
        assert_eq!(pooled.len(), 2);
        assert_eq!(pooled[0], vec![1.0, 0.0]);
        assert_eq!(pooled[1], vec![0.0, 1.0]);
    }

    #[test]
    fn test_mean_pool_output_is_unit_length() {
        let states = [3.0, 4.0, 0.0, 0.0];
        let mask = array![[1, 0]];

        let pooled = mean_pool(&states, &mask, 2);
        let norm: f32 = pooled[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((pooled[0][0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_onnx_embedder_needs_model_files() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            OnnxEmbedder::from_directory(tmp.path(), "all-MiniLM-L6-v2"),
            Err(Error::Embedding(message)) if message.contains(MODEL_FILE_NAME)
        ));
    }

    #[test]
    fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(384);
        let a = embedder.embed_text("Newton's second law relates force and mass");
        let b = embedder.embed_text("Newton's second law relates force and mass");
        assert_eq!(a.len(), 384);
        assert_eq!(a, b);
    }

    #[test]
    fn test_hashing_embedder_ignores_case_and_punctuation() {
        let embedder = HashingEmbedder::new(64);
        assert_eq!(
            embedder.embed_text("Photosynthesis, in PLANTS!"),
            embedder.embed_text("photosynthesis in plants")
        );
    }

    #[test]
    fn test_shared_words_score_higher() {
        let embedder = HashingEmbedder::new(384);
        let query = embedder.embed_text("what is the mitochondria");
        let related = embedder.embed_text("The mitochondria is the powerhouse of the cell");
        let unrelated = embedder.embed_text("Rome was founded on seven hills");
        assert!(cosine(&query, &related) > cosine(&query, &unrelated));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let embedder = HashingEmbedder::new(16);
        assert!(embedder.embed_text("  ...  ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_remote_embedder_short_circuits_empty_batch() {
        let embedder = RemoteEmbedder::new(&Settings::default()).unwrap();
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
        assert_eq!(embedder.name(), "sentence-transformers/all-MiniLM-L6-v2");
    }
}
