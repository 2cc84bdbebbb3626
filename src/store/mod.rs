//! Storage abstraction over the property graph.
//!
//! The [`GraphStore`] trait is the single typed interface to persistent
//! graph state, enabling pluggable backends: [`sqlite::SqliteStore`] for
//! durable storage and [`memory::MemoryStore`] for tests and ephemeral
//! runs.
//!
//! The contract for vector search is cosine ordering plus the
//! [`SearchFilter`] semantics; an implementation may back it with a
//! brute-force scan, an ANN library, or a native vector index.
//!
//! # Failure semantics
//!
//! Operations fail with [`StoreError::Transient`] (callers retry via
//! [`with_retries`]) or [`StoreError::Permanent`] (surfaced). Vector
//! operations fail with [`StoreError::DimensionMismatch`] when the query
//! vector's length disagrees with the corpus dimension.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{Chunk, Document, Entity, EntityType};

pub type StoreResult<T> = Result<T, StoreError>;

/// Restricts a vector search to a slice of the corpus.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub division: Option<String>,
    pub category: Option<String>,
    /// Only chunks containing at least one entity in these communities.
    pub communities: Option<Vec<i64>>,
    /// Only chunks whose keyword list contains this word.
    pub keyword: Option<String>,
}

impl SearchFilter {
    pub fn is_empty(&self) -> bool {
        self.division.is_none()
            && self.category.is_none()
            && self.communities.is_none()
            && self.keyword.is_none()
    }
}

/// Match mode for [`GraphStore::keyword_chunks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordMode {
    Any,
    All,
}

/// An undirected Entity–Entity co-occurrence edge. `a < b` lexically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedEdge {
    pub a: String,
    pub b: String,
    pub strength: u32,
}

/// Introspection report used by `dg stats --schema` and the NL strategy.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaSnapshot {
    pub labels: Vec<String>,
    pub edge_types: Vec<String>,
    pub properties: BTreeMap<String, Vec<String>>,
    pub constraints: Vec<String>,
    pub indexes: Vec<String>,
}

/// Corpus-level counters for `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
    pub entities: u64,
    pub related_edges: u64,
    pub communities: u64,
    pub bridge_nodes: u64,
    pub avg_community_size: f64,
}

/// Full graph export: nodes and edges with typed property values,
/// embeddings as fixed-length float arrays with a recorded dimension.
/// Restore is a straight re-import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// ISO-8601 UTC.
    pub exported_at: String,
    pub embedding_dims: usize,
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
    pub entities: Vec<Entity>,
    /// (chunk_id, entity_id) pairs.
    pub chunk_entities: Vec<(String, String)>,
    pub related_to: Vec<RelatedEdge>,
}

/// Abstract property-graph backend.
///
/// Write operations are used by ingestion and the community detector;
/// query paths are read-only. `replace_document_chunks` is atomic per
/// document: either the new chunk set fully replaces the old or nothing
/// changes.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// The uniform embedding dimension D this store was opened with.
    fn dims(&self) -> usize;

    // ---- writes (ingestion) ----

    async fn upsert_document(&self, doc: &Document) -> StoreResult<()>;

    /// Atomically replaces the full chunk set of a document.
    async fn replace_document_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> StoreResult<()>;

    /// Inserts the entity or bumps its occurrence count. Returns the
    /// entity id. Canonical text is unique.
    async fn upsert_entity(&self, text: &str, entity_type: EntityType) -> StoreResult<String>;

    async fn link_chunk_entity(&self, chunk_id: &str, entity_id: &str) -> StoreResult<()>;

    /// Single-shot aggregation: materializes RELATED_TO edges from chunk
    /// co-occurrence with strength > `min_strength`. Replaces any prior
    /// edge set. Returns the number of edges written.
    async fn build_related_to(&self, min_strength: u32) -> StoreResult<u64>;

    /// Writes community enrichment onto an entity in place. Idempotent;
    /// re-running detection overwrites prior assignments.
    async fn set_entity_community(
        &self,
        entity_id: &str,
        community_id: i64,
        centrality: f64,
        is_bridge: bool,
    ) -> StoreResult<()>;

    // ---- reads (query paths) ----

    /// Top-k chunks by cosine similarity against stored embeddings.
    /// Chunks without an embedding are excluded.
    async fn vector_topk(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Chunks whose text contains the given keywords as case-insensitive
    /// substrings.
    async fn keyword_chunks(
        &self,
        keywords: &[String],
        mode: KeywordMode,
        limit: usize,
    ) -> StoreResult<Vec<String>>;

    async fn chunks_by_entities(&self, entity_ids: &[String]) -> StoreResult<Vec<String>>;

    async fn entities_in_chunks(&self, chunk_ids: &[String]) -> StoreResult<Vec<String>>;

    /// RELATED_TO neighbors of an entity with edge strengths.
    async fn neighbors(&self, entity_id: &str) -> StoreResult<Vec<(String, u32)>>;

    /// Distinct community ids over the given entities.
    async fn communities_of(&self, entity_ids: &[String]) -> StoreResult<Vec<i64>>;

    /// The full RELATED_TO edge set (community detector input).
    async fn related_edges(&self) -> StoreResult<Vec<RelatedEdge>>;

    async fn get_document(&self, id: &str) -> StoreResult<Option<Document>>;

    async fn get_chunk(&self, id: &str) -> StoreResult<Option<Chunk>>;

    async fn list_documents(&self) -> StoreResult<Vec<Document>>;

    /// All chunks of a document, ordered by chunk index.
    async fn document_chunks(&self, doc_id: &str) -> StoreResult<Vec<Chunk>>;

    /// The chunks adjacent to the given chunk within its document
    /// (indices are dense, so adjacency is index ± 1).
    async fn adjacent_chunks(&self, chunk_id: &str) -> StoreResult<Vec<Chunk>>;

    async fn all_entities(&self) -> StoreResult<Vec<Entity>>;

    async fn get_entity(&self, id: &str) -> StoreResult<Option<Entity>>;

    /// Entities whose canonical text occurs as a substring of `text`
    /// (lowercased). Used to identify entities mentioned in a query.
    async fn entities_matching_text(&self, text: &str) -> StoreResult<Vec<Entity>>;

    async fn stats(&self) -> StoreResult<StoreStats>;

    async fn schema_snapshot(&self) -> StoreResult<SchemaSnapshot>;

    // ---- backup / restore ----

    async fn export_snapshot(&self) -> StoreResult<Snapshot>;

    async fn import_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()>;

    /// Removes all nodes and edges.
    async fn wipe(&self) -> StoreResult<()>;
}

/// Runs a store operation, retrying transient failures up to
/// `max_retries` times with exponential backoff.
pub async fn with_retries<T, F, Fut>(max_retries: u32, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < max_retries => {
                let delay = Duration::from_millis(200u64 << attempt.min(5));
                tracing::warn!(attempt, error = %e, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Shared helper: checks a query vector against the store dimension.
pub(crate) fn check_dims(expected: usize, query: &[f32]) -> StoreResult<()> {
    if query.len() != expected {
        return Err(StoreError::DimensionMismatch {
            expected,
            got: query.len(),
        });
    }
    Ok(())
}

/// Cosine similarity between two equal-length vectors. Returns 0.0 for
/// empty input or a zero-magnitude side.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f64::EPSILON {
        return 0.0;
    }
    dot / denom
}
