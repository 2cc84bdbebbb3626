//! Core data model: the node kinds and query/result types that flow
//! through ingestion and retrieval.
//!
//! Four node kinds form the graph schema: [`Document`], [`Chunk`],
//! [`Entity`], and the config-driven hierarchy taxonomy. Query-side types
//! ([`Query`], [`Candidate`], [`Signals`], [`SearchHit`]) are shared by
//! every retrieval strategy so fusion reads typed fields rather than map
//! keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One source PDF. Created at ingestion, immutable thereafter;
/// re-ingesting the same id replaces the document and all its chunks
/// atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier derived from the filename stem.
    pub id: String,
    pub filename: String,
    pub page_count: u32,
    pub processed_date: DateTime<Utc>,
    pub title: Option<String>,
    /// Free-form surface tag assigned at ingest (from the inventory).
    pub category: Option<String>,
    /// Division code from the hierarchy classifier; empty on low confidence.
    pub division: Option<String>,
    /// Category within the division; empty on low confidence.
    pub doc_category: Option<String>,
    /// Product names the classifier matched in this document.
    pub products: Vec<String>,
}

/// Closed tag set for chunk classification. Precedence when several
/// marker sets match: definition > example > requirement > procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Definition,
    Example,
    Requirement,
    Procedure,
    Content,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Definition => "definition",
            ChunkType::Example => "example",
            ChunkType::Requirement => "requirement",
            ChunkType::Procedure => "procedure",
            ChunkType::Content => "content",
        }
    }
}

/// A contiguous slice of one page of one document; the atomic unit of
/// retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}_p{page_num}_c{chunk_index}`.
    pub id: String,
    pub document_id: String,
    /// 1-based page number. Chunks never cross page boundaries.
    pub page_num: u32,
    /// 0-based index within the document, dense.
    pub chunk_index: u32,
    pub text: String,
    pub token_count: u32,
    /// Dense embedding of dimension D, or absent (chunk is then excluded
    /// from vector strategies).
    pub embedding: Option<Vec<f32>>,
    /// Deterministic score in [0,1]; see `chunker::semantic_density`.
    pub semantic_density: f64,
    pub chunk_type: ChunkType,
    pub has_definitions: bool,
    pub has_examples: bool,
    pub has_lists: bool,
    /// Lowercased, deduplicated tokens of length > 2, stopwords removed.
    pub keywords: Vec<String>,
    /// Denormalized from the owning document for query-time filtering.
    pub division: Option<String>,
    pub doc_category: Option<String>,
}

impl Chunk {
    /// Builds the canonical chunk identifier.
    pub fn make_id(document_id: &str, page_num: u32, chunk_index: u32) -> String {
        format!("{}_p{}_c{}", document_id, page_num, chunk_index)
    }
}

/// Closed tag set for entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Product,
    Institution,
    Amount,
    Term,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Institution => "institution",
            EntityType::Amount => "amount",
            EntityType::Term => "term",
            EntityType::Other => "other",
        }
    }
}

/// A surface mention normalized across occurrences. Canonical text is
/// lowercased and trimmed; unique across the corpus. Community fields are
/// written in place by the detector and overwritten on every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub text: String,
    pub entity_type: EntityType,
    pub occurrence_count: u64,
    pub community_id: Option<i64>,
    /// Degree centrality within the entity's community, in [0,1].
    pub degree_centrality: Option<f64>,
    pub is_bridge_node: bool,
}

/// One entry of the ingest inventory: a local PDF plus its surface
/// metadata. Discovery and download happen upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub path: String,
    pub filename: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Informational only.
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InventoryEntry {
    /// The document identifier for this entry: the filename stem.
    pub fn document_id(&self) -> String {
        self.filename
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| self.filename.clone())
    }
}

// ============ Query-side types ============

/// Retrieval strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Vector,
    Keyword,
    Graph,
    Hybrid,
    Community,
    NlToGraph,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Vector => "vector",
            Strategy::Keyword => "keyword",
            Strategy::Graph => "graph",
            Strategy::Hybrid => "hybrid",
            Strategy::Community => "community",
            Strategy::NlToGraph => "nl_to_graph",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vector" => Some(Strategy::Vector),
            "keyword" => Some(Strategy::Keyword),
            "graph" => Some(Strategy::Graph),
            "hybrid" => Some(Strategy::Hybrid),
            "community" => Some(Strategy::Community),
            "nl_to_graph" | "nl" => Some(Strategy::NlToGraph),
            _ => None,
        }
    }
}

/// Shared input for every retrieval strategy.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub division: Option<String>,
    pub category: Option<String>,
    pub top_k: usize,
}

impl Query {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            division: None,
            category: None,
            top_k,
        }
    }
}

/// Per-candidate signals. A closed struct rather than an open map: each
/// strategy fills the fields it produces and fusion reads fields directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signals {
    pub cosine: Option<f64>,
    pub keyword_matches: Option<u32>,
    pub query_keyword_count: Option<u32>,
    pub entity_matches: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_entities: Vec<String>,
    /// Number of distinct query communities represented in the chunk.
    pub community_coverage: Option<u32>,
    /// Mean degree centrality of the chunk's matched entities.
    pub avg_centrality: Option<f64>,
    /// Template class matched by the NL-to-graph strategy.
    pub query_type: Option<String>,
    pub matched_template: Option<String>,
    /// Set when reranking was requested but skipped (timeout or failure).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rerank_skipped: bool,
}

impl Signals {
    /// Merges `other` into `self`: union of present fields, numeric
    /// conflicts keep the maximum.
    pub fn merge(&mut self, other: &Signals) {
        fn max_opt<T: Copy + PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(x), Some(y)) => Some(if y > x { y } else { x }),
                (x, None) => x,
                (None, y) => y,
            }
        }
        self.cosine = max_opt(self.cosine, other.cosine);
        self.keyword_matches = max_opt(self.keyword_matches, other.keyword_matches);
        self.query_keyword_count = max_opt(self.query_keyword_count, other.query_keyword_count);
        self.entity_matches = max_opt(self.entity_matches, other.entity_matches);
        self.community_coverage = max_opt(self.community_coverage, other.community_coverage);
        self.avg_centrality = max_opt(self.avg_centrality, other.avg_centrality);
        for e in &other.matched_entities {
            if !self.matched_entities.contains(e) {
                self.matched_entities.push(e.clone());
            }
        }
        if self.query_type.is_none() {
            self.query_type = other.query_type.clone();
        }
        if self.matched_template.is_none() {
            self.matched_template = other.matched_template.clone();
        }
        self.rerank_skipped |= other.rerank_skipped;
    }
}

/// A scored chunk produced by one strategy, before fusion.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub base_score: f64,
    /// Which strategy produced this candidate.
    pub provenance: Strategy,
    pub signals: Signals,
}

/// Final ranked result returned by the query engine. Citation formatting
/// is derived from this by external adapters; the engine never builds
/// prose.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub rerank_score: Option<f64>,
    pub document_id: String,
    pub page_num: u32,
    pub entities: Vec<String>,
    pub strategy: Strategy,
    pub signals: Signals,
}

impl SearchHit {
    /// `document, p.page (chunk id)` — the canonical citation string.
    pub fn citation(&self) -> String {
        format!("{}, p.{} ({})", self.document_id, self.page_num, self.chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_format() {
        assert_eq!(Chunk::make_id("td-pds", 3, 7), "td-pds_p3_c7");
    }

    #[test]
    fn inventory_document_id_strips_extension() {
        let e = InventoryEntry {
            path: "/data/FX_Option_PDS.pdf".into(),
            filename: "FX_Option_PDS.pdf".into(),
            category: None,
            source_url: None,
            metadata: serde_json::Value::Null,
        };
        assert_eq!(e.document_id(), "FX_Option_PDS");
    }

    #[test]
    fn strategy_parse_round_trip() {
        for s in [
            Strategy::Vector,
            Strategy::Keyword,
            Strategy::Graph,
            Strategy::Hybrid,
            Strategy::Community,
            Strategy::NlToGraph,
        ] {
            assert_eq!(Strategy::parse(s.as_str()), Some(s));
        }
        assert_eq!(Strategy::parse("bm25"), None);
    }

    #[test]
    fn signals_merge_keeps_numeric_max() {
        let mut a = Signals {
            cosine: Some(0.4),
            keyword_matches: Some(1),
            ..Default::default()
        };
        let b = Signals {
            cosine: Some(0.7),
            keyword_matches: None,
            matched_entities: vec!["swap".into()],
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.cosine, Some(0.7));
        assert_eq!(a.keyword_matches, Some(1));
        assert_eq!(a.matched_entities, vec!["swap".to_string()]);
    }
}
