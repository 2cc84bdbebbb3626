//! Query engine facade.
//!
//! A long-lived [`QueryEngine`] owns the store, embedder, and reranker
//! clients (explicit context, no process globals) and is shared by
//! read-only query workers. For each request it dispatches to the chosen
//! strategy, applies rerank + fusion, and returns ranked [`SearchHit`]s
//! with citation fields. Citation prose is left to adapters.
//!
//! Requests carry an overall deadline. External calls inside a request
//! have their own soft deadlines; exceeding the rerank deadline yields a
//! partial result (rerank skipped, flagged in signals) rather than a
//! failure.

pub mod nl;
pub mod strategies;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::embedding::Embedder;
use crate::fusion::{self, FusionCandidate};
use crate::model::{Candidate, Query, SearchHit, Strategy};
use crate::rerank::Reranker;
use crate::store::{GraphStore, StoreStats};

/// One search request as received from the CLI or HTTP adapter.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub text: String,
    pub strategy: Strategy,
    pub top_k: Option<usize>,
    pub rerank: bool,
    pub division: Option<String>,
    pub category: Option<String>,
}

impl SearchRequest {
    pub fn new(text: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            text: text.into(),
            strategy,
            top_k: None,
            rerank: false,
            division: None,
            category: None,
        }
    }
}

pub struct QueryEngine {
    config: Config,
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Arc<dyn Reranker>,
}

impl QueryEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn GraphStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Arc<dyn Reranker>,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            reranker,
        }
    }

    pub fn store(&self) -> Arc<dyn GraphStore> {
        self.store.clone()
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats().await?)
    }

    /// Runs one search under the configured request deadline.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        let deadline = Duration::from_secs(self.config.retrieval.deadline_secs);
        match tokio::time::timeout(deadline, self.search_inner(request)).await {
            Ok(result) => result,
            Err(_) => bail!("search exceeded {}s deadline", deadline.as_secs()),
        }
    }

    async fn search_inner(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        if request.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let top_k = request.top_k.unwrap_or(self.config.retrieval.top_k).max(1);
        let rerank_requested = request.rerank && self.config.rerank.is_enabled();
        let fetch_k = if rerank_requested { top_k * 2 } else { top_k };
        let query = Query {
            text: request.text.clone(),
            division: request.division.clone(),
            category: request.category.clone(),
            top_k,
        };

        let store = self.store.as_ref();
        let candidates: Vec<Candidate> = match request.strategy {
            Strategy::Vector => {
                strategies::vector_strategy(store, self.embedder.as_ref(), &query, fetch_k)
                    .await
                    .context("vector strategy unavailable")?
            }
            Strategy::Keyword => strategies::keyword_strategy(store, &query).await?,
            Strategy::Graph => strategies::graph_strategy(store, &query).await?,
            Strategy::Hybrid => {
                strategies::hybrid_strategy(
                    store,
                    self.embedder.as_ref(),
                    &query,
                    self.config.retrieval.w_vector,
                    self.config.retrieval.w_keyword,
                    fetch_k,
                )
                .await?
            }
            Strategy::Community => {
                strategies::community_strategy(store, self.embedder.as_ref(), &query, fetch_k)
                    .await
                    .context("community strategy unavailable")?
            }
            Strategy::NlToGraph => {
                match nl::nl_to_graph_strategy(store, &query, &self.config.products).await? {
                    nl::NlOutcome::Synthetic(mut hits) => {
                        hits.truncate(top_k);
                        return Ok(hits);
                    }
                    nl::NlOutcome::Candidates { candidates, .. } => candidates,
                    nl::NlOutcome::Fallback => {
                        let mut fallback = strategies::keyword_strategy(store, &query).await?;
                        for c in &mut fallback {
                            c.provenance = Strategy::NlToGraph;
                            c.signals.query_type = Some("generic_keyword".to_string());
                        }
                        fallback
                    }
                }
            }
        };

        let deduped = fusion::dedup_candidates(candidates);
        let fusion_candidates = self.load_fusion_candidates(deduped).await?;
        let reranker: Option<&dyn Reranker> = if rerank_requested {
            Some(self.reranker.as_ref())
        } else {
            None
        };
        let fused = fusion::rerank_and_fuse(
            &request.text,
            fusion_candidates,
            reranker,
            Duration::from_secs(self.config.rerank.timeout_secs),
            &self.config.fusion,
            &self.config.products,
            top_k,
        )
        .await;

        let mut hits = Vec::with_capacity(fused.len());
        for f in fused {
            let entities = self.chunk_entity_texts(&f.chunk.id).await?;
            hits.push(SearchHit {
                chunk_id: f.chunk.id.clone(),
                text: f.chunk.text.clone(),
                score: f.final_score,
                rerank_score: f.rerank_score,
                document_id: f.chunk.document_id.clone(),
                page_num: f.chunk.page_num,
                entities,
                strategy: request.strategy,
                signals: f.candidate.signals,
            });
        }
        Ok(hits)
    }

    async fn load_fusion_candidates(
        &self,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<FusionCandidate>> {
        let mut out = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(chunk) = self.store.get_chunk(&candidate.chunk_id).await? else {
                tracing::warn!(chunk_id = %candidate.chunk_id, "candidate chunk vanished, dropping");
                continue;
            };
            let filename = self
                .store
                .get_document(&chunk.document_id)
                .await?
                .map(|d| d.filename)
                .unwrap_or_default();
            out.push(FusionCandidate {
                candidate,
                chunk,
                filename,
            });
        }
        Ok(out)
    }

    async fn chunk_entity_texts(&self, chunk_id: &str) -> Result<Vec<String>> {
        let ids = self
            .store
            .entities_in_chunks(std::slice::from_ref(&chunk_id.to_string()))
            .await?;
        let mut texts = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(entity) = self.store.get_entity(id).await? {
                texts.push(entity.text);
            }
        }
        texts.sort();
        Ok(texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, StoreConfig};
    use crate::embedding::HashEmbedder;
    use crate::model::{Chunk, ChunkType, Document};
    use crate::rerank::DisabledReranker;
    use crate::store::memory::MemoryStore;

    const DIMS: usize = 64;

    fn config() -> Config {
        Config {
            store: StoreConfig {
                backend: "memory".into(),
                path: "unused".into(),
            },
            chunking: Default::default(),
            embedding: crate::config::EmbeddingConfig {
                provider: "hashed".into(),
                dims: DIMS,
                ..Default::default()
            },
            rerank: Default::default(),
            fusion: Default::default(),
            retrieval: Default::default(),
            community: Default::default(),
            ingest: Default::default(),
            server: ServerConfig {
                bind: "127.0.0.1:0".into(),
            },
            hierarchy: Default::default(),
            products: Default::default(),
        }
    }

    async fn seed_corpus(store: &MemoryStore, embedder: &HashEmbedder) {
        for (doc_id, texts) in [
            (
                "term-deposit-pds",
                vec![
                    "a term deposit requires a minimum balance of 1000 at opening",
                    "interest on the term deposit accrues daily",
                ],
            ),
            (
                "fx-option-pds",
                vec![
                    "a foreign exchange option means the right to exchange currency",
                    "option premium is payable upfront",
                ],
            ),
        ] {
            store
                .upsert_document(&Document {
                    id: doc_id.into(),
                    filename: format!("{}.pdf", doc_id),
                    page_count: 1,
                    processed_date: chrono::Utc::now(),
                    title: None,
                    category: None,
                    division: None,
                    doc_category: None,
                    products: vec![],
                })
                .await
                .unwrap();
            let mut chunks = Vec::new();
            for (i, text) in texts.iter().enumerate() {
                let embedding = embedder.encode(text).await.unwrap();
                chunks.push(Chunk {
                    id: Chunk::make_id(doc_id, 1, i as u32),
                    document_id: doc_id.into(),
                    page_num: 1,
                    chunk_index: i as u32,
                    text: text.to_string(),
                    token_count: text.split_whitespace().count() as u32,
                    embedding: Some(embedding),
                    semantic_density: crate::chunker::semantic_density(text),
                    chunk_type: ChunkType::Content,
                    has_definitions: false,
                    has_examples: false,
                    has_lists: false,
                    keywords: crate::chunker::extract_keywords(&text.to_lowercase()),
                    division: None,
                    doc_category: None,
                });
            }
            store.replace_document_chunks(doc_id, &chunks).await.unwrap();
        }
    }

    fn engine(store: MemoryStore) -> QueryEngine {
        QueryEngine::new(
            config(),
            Arc::new(store),
            Arc::new(HashEmbedder::new(DIMS)),
            Arc::new(DisabledReranker),
        )
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty() {
        let engine = engine(MemoryStore::new(DIMS));
        let hits = engine
            .search(&SearchRequest::new("anything", Strategy::Vector))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn empty_query_returns_empty() {
        let engine = engine(MemoryStore::new(DIMS));
        let hits = engine
            .search(&SearchRequest::new("   ", Strategy::Hybrid))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn hybrid_finds_exact_phrase_in_top_results() {
        let store = MemoryStore::new(DIMS);
        let embedder = HashEmbedder::new(DIMS);
        seed_corpus(&store, &embedder).await;
        let engine = engine(store);
        let hits = engine
            .search(&SearchRequest::new("minimum balance", Strategy::Hybrid))
            .await
            .unwrap();
        assert!(!hits.is_empty());
        let top3: Vec<&str> = hits.iter().take(3).map(|h| h.chunk_id.as_str()).collect();
        assert!(top3.contains(&"term-deposit-pds_p1_c0"));
    }

    #[tokio::test]
    async fn hybrid_top1_satisfies_admission_rule() {
        let store = MemoryStore::new(DIMS);
        let embedder = HashEmbedder::new(DIMS);
        seed_corpus(&store, &embedder).await;
        let engine = engine(store);
        let hits = engine
            .search(&SearchRequest::new("term deposit interest", Strategy::Hybrid))
            .await
            .unwrap();
        let top = &hits[0];
        let cosine = top.signals.cosine.unwrap_or(0.0);
        let kw = top.signals.keyword_matches.unwrap_or(0);
        assert!(cosine >= 0.5 || kw >= 1);
    }

    #[tokio::test]
    async fn nl_count_documents_reports_count() {
        let store = MemoryStore::new(DIMS);
        let embedder = HashEmbedder::new(DIMS);
        seed_corpus(&store, &embedder).await;
        let engine = engine(store);
        let hits = engine
            .search(&SearchRequest::new(
                "how many documents are there",
                Strategy::NlToGraph,
            ))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].signals.query_type.as_deref(), Some("count_documents"));
        assert!(hits[0].text.contains("2 documents"));
    }

    #[tokio::test]
    async fn search_results_carry_citations() {
        let store = MemoryStore::new(DIMS);
        let embedder = HashEmbedder::new(DIMS);
        seed_corpus(&store, &embedder).await;
        let engine = engine(store);
        let hits = engine
            .search(&SearchRequest::new("option premium", Strategy::Keyword))
            .await
            .unwrap();
        let top = &hits[0];
        assert_eq!(top.document_id, "fx-option-pds");
        assert_eq!(top.page_num, 1);
        assert!(top.citation().contains("fx-option-pds, p.1"));
    }

    #[tokio::test]
    async fn repeated_searches_are_stable() {
        let store = MemoryStore::new(DIMS);
        let embedder = HashEmbedder::new(DIMS);
        seed_corpus(&store, &embedder).await;
        let engine = engine(store);
        let request = SearchRequest::new("term deposit minimum balance", Strategy::Hybrid);
        let first: Vec<String> = engine
            .search(&request)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.chunk_id)
            .collect();
        let second: Vec<String> = engine
            .search(&request)
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.chunk_id)
            .collect();
        assert_eq!(first, second);
    }
}
