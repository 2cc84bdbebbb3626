//! Cross-encoder reranker abstraction.
//!
//! The [`Reranker`] scores `(query, passage)` pairs with an opaque scalar;
//! the fusion layer makes no assumption about its range. Failure is
//! recovered by the caller: candidates fall back to a neutral
//! `rerank_score` of 0.5 and the result is flagged in signals.
//!
//! Implementations:
//! - **[`DisabledReranker`]** — always errors; fusion then runs without rerank.
//! - **[`HttpReranker`]** — posts pairs to a serving endpoint
//!   (`{"pairs": [[query, passage], ...]}` → `{"scores": [...]}`).
//! - **`LocalReranker`** — runs a cross-encoder in-process via fastembed
//!   (feature `local-models`).

use std::time::Duration;

use async_trait::async_trait;

use crate::config::RerankConfig;
use crate::error::ModelError;

/// Neutral score assigned when the cross-encoder call fails.
pub const NEUTRAL_RERANK_SCORE: f64 = 0.5;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn model_name(&self) -> &str;

    /// Scores each `(query, passage)` pair. Output length equals input
    /// length, in order. The scalar is not required to be bounded or a
    /// probability.
    async fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, ModelError>;
}

/// Builds the configured [`Reranker`].
pub fn create_reranker(config: &RerankConfig) -> Result<Box<dyn Reranker>, ModelError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledReranker)),
        "http" => Ok(Box::new(HttpReranker::new(config)?)),
        #[cfg(feature = "local-models")]
        "local" => Ok(Box::new(local::LocalReranker::new(config))),
        #[cfg(not(feature = "local-models"))]
        "local" => Err(ModelError::Unavailable(
            "local rerank provider requires --features local-models".into(),
        )),
        other => Err(ModelError::Unavailable(format!(
            "unknown rerank provider: {}",
            other
        ))),
    }
}

pub struct DisabledReranker;

#[async_trait]
impl Reranker for DisabledReranker {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn score_pairs(&self, _pairs: &[(String, String)]) -> Result<Vec<f32>, ModelError> {
        Err(ModelError::Disabled)
    }
}

/// Posts pairs to a cross-encoder serving endpoint.
pub struct HttpReranker {
    model: String,
    url: String,
    timeout_secs: u64,
}

impl HttpReranker {
    pub fn new(config: &RerankConfig) -> Result<Self, ModelError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| ModelError::Unavailable("rerank.url required for http".into()))?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "cross-encoder".to_string()),
            url,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        let body = serde_json::json!({
            "model": self.model,
            "pairs": pairs.iter().map(|(q, p)| vec![q.clone(), p.clone()]).collect::<Vec<_>>(),
        });
        let response = client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.timeout_secs)
                } else {
                    ModelError::Unavailable(e.to_string())
                }
            })?;
        if !response.status().is_success() {
            return Err(ModelError::Unavailable(format!(
                "rerank endpoint error {}",
                response.status()
            )));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::Malformed(e.to_string()))?;
        let scores = json
            .get("scores")
            .and_then(|s| s.as_array())
            .ok_or_else(|| ModelError::Malformed("missing scores array".into()))?;
        if scores.len() != pairs.len() {
            return Err(ModelError::Malformed(format!(
                "expected {} scores, got {}",
                pairs.len(),
                scores.len()
            )));
        }
        Ok(scores
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect())
    }
}

#[cfg(feature = "local-models")]
mod local {
    use super::*;

    /// In-process cross-encoder via fastembed's rerank models.
    pub struct LocalReranker {
        model: String,
    }

    impl LocalReranker {
        pub fn new(config: &RerankConfig) -> Self {
            Self {
                model: config
                    .model
                    .clone()
                    .unwrap_or_else(|| "bge-reranker-base".to_string()),
            }
        }
    }

    #[async_trait]
    impl Reranker for LocalReranker {
        fn model_name(&self) -> &str {
            &self.model
        }

        async fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, ModelError> {
            let pairs = pairs.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut model = fastembed::TextRerank::try_new(fastembed::RerankInitOptions::new(
                    fastembed::RerankerModel::BGERerankerBase,
                ))
                .map_err(|e| ModelError::Unavailable(e.to_string()))?;
                let mut scores = vec![0.0f32; pairs.len()];
                // fastembed reranks one query against many documents; group
                // by query to preserve the pair contract.
                let mut by_query: std::collections::HashMap<&str, Vec<(usize, &str)>> =
                    std::collections::HashMap::new();
                for (i, (q, p)) in pairs.iter().enumerate() {
                    by_query.entry(q.as_str()).or_default().push((i, p.as_str()));
                }
                for (query, docs) in by_query {
                    let texts: Vec<&str> = docs.iter().map(|(_, p)| *p).collect();
                    let results = model
                        .rerank(query, texts, false, None)
                        .map_err(|e| ModelError::Malformed(e.to_string()))?;
                    for r in results {
                        scores[docs[r.index].0] = r.score;
                    }
                }
                Ok(scores)
            })
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?
        }
    }
}
