//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`DisabledEmbedder`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAiEmbedder`]** — calls an OpenAI-compatible embeddings API with retry and backoff.
//! - **[`OllamaEmbedder`]** — calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`** — runs models in-process via fastembed (feature `local-models`).
//! - **[`HashEmbedder`]** — deterministic feature-hashing vectors; no model, no network.
//!   Used for offline evaluation runs and tests where ranking behavior matters
//!   but model quality does not.
//!
//! The embedding dimension D is fixed per deployment and checked against
//! the store on every write and query.
//!
//! # Retry strategy
//!
//! HTTP providers use exponential backoff for transient errors:
//! - HTTP 429 and 5xx → retry
//! - other 4xx → fail immediately
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::config::EmbeddingConfig;
use crate::error::ModelError;

/// Boundary to the external embedding model. Pure: deterministic for a
/// fixed model version.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"bge-small-en-v1.5"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality D.
    fn dims(&self) -> usize;

    /// Embeds a batch of texts, one vector per input, in order.
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;

    /// Embeds a single text (e.g. a search query).
    async fn encode(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let mut out = self.encode_batch(&[text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| ModelError::Malformed("empty embedding response".into()))
    }
}

/// Builds the configured [`Embedder`].
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>, ModelError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledEmbedder)),
        "openai" => Ok(Box::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Box::new(OllamaEmbedder::new(config))),
        "hashed" => Ok(Box::new(HashEmbedder::new(config.dims))),
        #[cfg(feature = "local-models")]
        "local" => Ok(Box::new(local::LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-models"))]
        "local" => Err(ModelError::Unavailable(
            "local embedding provider requires --features local-models".into(),
        )),
        other => Err(ModelError::Unavailable(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Disabled ============

/// A no-op provider that always errors. Vector strategies are skipped
/// when this is configured.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn encode_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Err(ModelError::Disabled)
    }
}

// ============ OpenAI-compatible ============

/// Calls `POST {url}/v1/embeddings` with the configured model. Requires
/// the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    url: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ModelError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ModelError::Unavailable("embedding.model required for openai".into()))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(ModelError::Unavailable(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }
        Ok(Self {
            model,
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ModelError::Unavailable("OPENAI_API_KEY not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let url = format!("{}/v1/embeddings", self.url.trim_end_matches('/'));

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }
            let resp = client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
                .send()
                .await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| ModelError::Malformed(e.to_string()))?;
                        return parse_openai_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(ModelError::Unavailable(format!(
                            "embeddings API error {}",
                            status
                        )));
                        continue;
                    }
                    return Err(ModelError::Unavailable(format!(
                        "embeddings API error {}",
                        status
                    )));
                }
                Err(e) if e.is_timeout() => {
                    last_err = Some(ModelError::Timeout(self.timeout_secs));
                    continue;
                }
                Err(e) => {
                    last_err = Some(ModelError::Unavailable(e.to_string()));
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ModelError::Unavailable("embedding failed".into())))
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ModelError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ModelError::Malformed("missing data array".into()))?;
    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ModelError::Malformed("missing embedding".into()))?;
        embeddings.push(
            embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(embeddings)
}

// ============ Ollama ============

/// Calls `POST /api/embed` on a local Ollama instance
/// (default `http://localhost:11434`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            dims: config.dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        let body = serde_json::json!({ "model": self.model, "input": texts });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1).min(5))).await;
            }
            let resp = client
                .post(format!("{}/api/embed", self.url))
                .json(&body)
                .send()
                .await;
            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| ModelError::Malformed(e.to_string()))?;
                        let embeddings = json
                            .get("embeddings")
                            .and_then(|e| e.as_array())
                            .ok_or_else(|| {
                                ModelError::Malformed("missing embeddings array".into())
                            })?;
                        let mut out = Vec::with_capacity(embeddings.len());
                        for e in embeddings {
                            let v = e
                                .as_array()
                                .ok_or_else(|| {
                                    ModelError::Malformed("embedding is not an array".into())
                                })?
                                .iter()
                                .map(|x| x.as_f64().unwrap_or(0.0) as f32)
                                .collect();
                            out.push(v);
                        }
                        return Ok(out);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(ModelError::Unavailable(format!(
                            "ollama error {}",
                            status
                        )));
                        continue;
                    }
                    return Err(ModelError::Unavailable(format!("ollama error {}", status)));
                }
                Err(e) => {
                    last_err = Some(ModelError::Unavailable(format!(
                        "ollama connection error (is it running at {}?): {}",
                        self.url, e
                    )));
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ModelError::Unavailable("ollama failed".into())))
    }
}

// ============ Hashed (offline) ============

/// Deterministic feature-hashing embedder: each lowercase token is hashed
/// into one of D buckets and the bucket counts are L2-normalized. Shared
/// tokens produce correlated vectors, which is enough for offline
/// evaluation of ranking behavior and for tests; it is not a semantic
/// model.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.len() < 2 {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dims;
            vec[bucket] += 1.0;
        }
        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in &mut vec {
                *x /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Local (fastembed) ============

#[cfg(feature = "local-models")]
mod local {
    use super::*;

    /// Runs an embedding model in-process via fastembed. Models download
    /// on first use and are cached; afterwards no network is needed.
    pub struct LocalEmbedder {
        model_name: String,
        dims: usize,
        batch_size: usize,
    }

    impl LocalEmbedder {
        pub fn new(config: &EmbeddingConfig) -> Result<Self, ModelError> {
            let model_name = config
                .model
                .clone()
                .unwrap_or_else(|| "bge-small-en-v1.5".to_string());
            Ok(Self {
                model_name,
                dims: config.dims,
                batch_size: config.batch_size,
            })
        }

        fn fastembed_model(&self) -> Result<fastembed::EmbeddingModel, ModelError> {
            match self.model_name.as_str() {
                "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
                "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
                "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
                other => Err(ModelError::Unavailable(format!(
                    "unknown local embedding model: {}",
                    other
                ))),
            }
        }
    }

    #[async_trait]
    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }
        fn dims(&self) -> usize {
            self.dims
        }

        async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
            let model = self.fastembed_model()?;
            let batch_size = self.batch_size;
            let texts = texts.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut embedder = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model),
                )
                .map_err(|e| ModelError::Unavailable(e.to_string()))?;
                embedder
                    .embed(texts, Some(batch_size))
                    .map_err(|e| ModelError::Malformed(e.to_string()))
            })
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?
        }
    }
}

// ============ BLOB helpers ============

/// Encodes a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decodes a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[tokio::test]
    async fn hashed_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.encode("minimum balance requirement").await.unwrap();
        let b = embedder.encode("minimum balance requirement").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn hashed_embedder_similar_texts_correlate() {
        let embedder = HashEmbedder::new(128);
        let q = embedder.encode("interest rate swap").await.unwrap();
        let close = embedder
            .encode("the interest rate swap product")
            .await
            .unwrap();
        let far = embedder.encode("zebra giraffe elephant").await.unwrap();
        let sim_close = crate::store::cosine_similarity(&q, &close);
        let sim_far = crate::store::cosine_similarity(&q, &far);
        assert!(sim_close > sim_far);
    }

    #[tokio::test]
    async fn hashed_embedder_unit_norm() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.encode("some words here").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn disabled_embedder_errors() {
        let e = DisabledEmbedder;
        assert!(matches!(
            e.encode("anything").await.unwrap_err(),
            ModelError::Disabled
        ));
    }

    #[test]
    fn create_rejects_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "sbert".into(),
            ..Default::default()
        };
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn parse_openai_shape() {
        let json = serde_json::json!({
            "data": [
                { "embedding": [0.1, 0.2] },
                { "embedding": [0.3, 0.4] }
            ]
        });
        let out = parse_openai_response(&json).unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[1][0] - 0.3).abs() < 1e-6);
    }
}
