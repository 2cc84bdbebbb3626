//! Reranking and score fusion.
//!
//! Turns candidates from one or more strategies into a final ranked list
//! through a deterministic pipeline: dedup by chunk id (signal union,
//! numeric max), cross-encode, additive boosts, weighted fusion, stable
//! sort. Given the same candidate list and the same model outputs, the
//! ordering is identical across invocations.
//!
//! Boosts are small and bounded:
//! - keyword: query-token overlap with chunk text (cap 0.2) and with the
//!   document filename (cap 0.15);
//! - type: the query's detected type against the chunk's type or flags
//!   (0.15–0.2);
//! - metadata: semantic-density bands (> 0.5 → +0.1, > 0.3 → +0.05) plus
//!   a product bonus when a product abbreviation in the query matches
//!   chunk text.
//!
//! Fusion: `final = w_rerank·rerank + w_base·base + w_keyword·keyword +
//! w_metadata·(type + metadata)` with configurable weights summing to 1.
//! A failed or timed-out cross-encoder call degrades every candidate to a
//! neutral rerank score and flags `rerank_skipped` in signals.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::chunker::{self, QueryType};
use crate::config::FusionConfig;
use crate::model::{Candidate, Chunk, ChunkType};
use crate::rerank::{Reranker, NEUTRAL_RERANK_SCORE};

/// A candidate joined with the stored chunk and its document filename,
/// ready for boosting.
#[derive(Debug, Clone)]
pub struct FusionCandidate {
    pub candidate: Candidate,
    pub chunk: Chunk,
    pub filename: String,
}

/// A fully scored candidate after fusion.
#[derive(Debug, Clone)]
pub struct FusedCandidate {
    pub candidate: Candidate,
    pub chunk: Chunk,
    pub rerank_score: Option<f64>,
    pub final_score: f64,
}

/// Merges duplicate chunk ids: signals union (numeric max), base score
/// max, first provenance kept. Order of first appearance is preserved.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: BTreeMap<String, Candidate> = BTreeMap::new();
    for c in candidates {
        match merged.get_mut(&c.chunk_id) {
            Some(existing) => {
                existing.signals.merge(&c.signals);
                if c.base_score > existing.base_score {
                    existing.base_score = c.base_score;
                }
            }
            None => {
                order.push(c.chunk_id.clone());
                merged.insert(c.chunk_id.clone(), c);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|id| merged.remove(&id))
        .collect()
}

/// Query-token overlap boosts. Text overlap caps at 0.2, filename overlap
/// at 0.15.
pub fn keyword_boost(query: &str, chunk_text: &str, filename: &str) -> f64 {
    let keywords = chunker::extract_keywords(&query.to_lowercase());
    if keywords.is_empty() {
        return 0.0;
    }
    let text_lower = chunk_text.to_lowercase();
    let filename_lower = filename.to_lowercase();
    let text_hits = keywords.iter().filter(|k| text_lower.contains(k.as_str())).count();
    let file_hits = keywords
        .iter()
        .filter(|k| filename_lower.contains(k.as_str()))
        .count();
    let text_part = 0.2 * text_hits as f64 / keywords.len() as f64;
    let file_part = 0.15 * file_hits as f64 / keywords.len() as f64;
    text_part.min(0.2) + file_part.min(0.15)
}

/// Boost when the detected query type lines up with the chunk.
pub fn type_boost(query_type: QueryType, chunk: &Chunk) -> f64 {
    let exact = match query_type {
        QueryType::Definition => chunk.chunk_type == ChunkType::Definition,
        QueryType::Example => chunk.chunk_type == ChunkType::Example,
        QueryType::Requirement => chunk.chunk_type == ChunkType::Requirement,
        QueryType::Procedure => chunk.chunk_type == ChunkType::Procedure,
        QueryType::Comparison | QueryType::General => false,
    };
    if exact {
        return 0.2;
    }
    let flag = match query_type {
        QueryType::Definition => chunk.has_definitions,
        QueryType::Example | QueryType::Comparison => chunk.has_examples,
        QueryType::Requirement => chunk.has_lists,
        _ => false,
    };
    if flag {
        0.15
    } else {
        0.0
    }
}

/// Density bands plus the product-abbreviation bonus.
pub fn metadata_boost(
    query: &str,
    chunk: &Chunk,
    products: &BTreeMap<String, String>,
) -> f64 {
    let mut boost = if chunk.semantic_density > 0.5 {
        0.1
    } else if chunk.semantic_density > 0.3 {
        0.05
    } else {
        0.0
    };
    let query_lower = query.to_lowercase();
    let text_lower = chunk.text.to_lowercase();
    for (abbrev, canonical) in products {
        let in_query = query_lower.contains(abbrev.as_str()) || query_lower.contains(canonical.as_str());
        let in_chunk = text_lower.contains(abbrev.as_str()) || text_lower.contains(canonical.as_str());
        if in_query && in_chunk {
            boost += 0.1;
            break;
        }
    }
    boost
}

/// Cross-encodes, boosts, fuses, and sorts. `reranker` of `None` means
/// reranking was not requested; scores then fuse with a zero rerank
/// component and no skip flag.
pub async fn rerank_and_fuse(
    query: &str,
    mut candidates: Vec<FusionCandidate>,
    reranker: Option<&dyn Reranker>,
    rerank_deadline: Duration,
    weights: &FusionConfig,
    products: &BTreeMap<String, String>,
    top_k: usize,
) -> Vec<FusedCandidate> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut rerank_scores: Option<Vec<f64>> = None;
    let mut rerank_skipped = false;
    if let Some(reranker) = reranker {
        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (query.to_string(), c.chunk.text.clone()))
            .collect();
        match tokio::time::timeout(rerank_deadline, reranker.score_pairs(&pairs)).await {
            Ok(Ok(scores)) => {
                rerank_scores = Some(scores.into_iter().map(f64::from).collect());
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "rerank failed, falling back to neutral scores");
                rerank_scores = Some(vec![NEUTRAL_RERANK_SCORE; candidates.len()]);
                rerank_skipped = true;
            }
            Err(_) => {
                tracing::warn!("rerank timed out, falling back to neutral scores");
                rerank_scores = Some(vec![NEUTRAL_RERANK_SCORE; candidates.len()]);
                rerank_skipped = true;
            }
        }
    }

    let query_type = chunker::detect_query_type(query);
    let mut fused: Vec<FusedCandidate> = candidates
        .drain(..)
        .enumerate()
        .map(|(i, fc)| {
            let rerank_score = rerank_scores.as_ref().map(|s| s[i]);
            let kw = keyword_boost(query, &fc.chunk.text, &fc.filename);
            let ty = type_boost(query_type, &fc.chunk);
            let meta = metadata_boost(query, &fc.chunk, products);
            let final_score = weights.w_rerank * rerank_score.unwrap_or(0.0)
                + weights.w_base * fc.candidate.base_score
                + weights.w_keyword * kw
                + weights.w_metadata * (ty + meta);
            let mut candidate = fc.candidate;
            candidate.signals.rerank_skipped |= rerank_skipped;
            FusedCandidate {
                candidate,
                chunk: fc.chunk,
                rerank_score,
                final_score,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    fused.truncate(top_k);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Signals, Strategy};

    fn chunk(id: &str, text: &str, density: f64, chunk_type: ChunkType) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: "doc".into(),
            page_num: 1,
            chunk_index: 0,
            text: text.to_string(),
            token_count: text.split_whitespace().count() as u32,
            embedding: None,
            semantic_density: density,
            chunk_type,
            has_definitions: chunk_type == ChunkType::Definition,
            has_examples: chunk_type == ChunkType::Example,
            has_lists: false,
            keywords: vec![],
            division: None,
            doc_category: None,
        }
    }

    fn candidate(chunk_id: &str, base: f64) -> Candidate {
        Candidate {
            chunk_id: chunk_id.to_string(),
            base_score: base,
            provenance: Strategy::Vector,
            signals: Signals {
                cosine: Some(base),
                ..Default::default()
            },
        }
    }

    #[test]
    fn dedup_keeps_max_base_and_merges_signals() {
        let mut a = candidate("c1", 0.4);
        a.signals.keyword_matches = Some(2);
        let b = candidate("c1", 0.7);
        let out = dedup_candidates(vec![a, b, candidate("c2", 0.1)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].chunk_id, "c1");
        assert!((out[0].base_score - 0.7).abs() < 1e-9);
        assert_eq!(out[0].signals.keyword_matches, Some(2));
    }

    #[test]
    fn keyword_boost_is_capped() {
        let boost = keyword_boost(
            "minimum balance term deposit",
            "minimum balance for a term deposit account",
            "term_deposit_minimum_balance.pdf",
        );
        assert!(boost <= 0.35 + 1e-9);
        assert!(boost > 0.3);
    }

    #[test]
    fn keyword_boost_zero_for_stopword_query() {
        assert_eq!(keyword_boost("the and for", "anything", "doc.pdf"), 0.0);
    }

    #[test]
    fn type_boost_prefers_exact_type_match() {
        let definition = chunk("c", "a swap means an agreement", 0.4, ChunkType::Definition);
        let content = chunk("c", "a swap means an agreement", 0.4, ChunkType::Content);
        let exact = type_boost(QueryType::Definition, &definition);
        let flag_only = type_boost(
            QueryType::Definition,
            &Chunk {
                has_definitions: true,
                ..content.clone()
            },
        );
        assert!((exact - 0.2).abs() < 1e-9);
        assert!((flag_only - 0.15).abs() < 1e-9);
        assert_eq!(type_boost(QueryType::Definition, &content), 0.0);
    }

    #[test]
    fn metadata_boost_bands_and_product_bonus() {
        let products: BTreeMap<String, String> =
            [("irs".to_string(), "interest rate swap".to_string())]
                .into_iter()
                .collect();
        let dense = chunk("c", "interest rate swap terms", 0.6, ChunkType::Content);
        let boost = metadata_boost("what is an irs", &dense, &products);
        assert!((boost - 0.2).abs() < 1e-9); // 0.1 density + 0.1 product
        let mid = chunk("c", "unrelated text", 0.4, ChunkType::Content);
        assert!((metadata_boost("query", &mid, &products) - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn fusion_without_reranker_orders_by_base_plus_boosts() {
        let products = BTreeMap::new();
        let weights = FusionConfig::default();
        let fused = rerank_and_fuse(
            "minimum balance",
            vec![
                FusionCandidate {
                    candidate: candidate("c1", 0.9),
                    chunk: chunk("c1", "unrelated prose entirely", 0.1, ChunkType::Content),
                    filename: "a.pdf".into(),
                },
                FusionCandidate {
                    candidate: candidate("c2", 0.85),
                    chunk: chunk(
                        "c2",
                        "the minimum balance is 1000",
                        0.6,
                        ChunkType::Requirement,
                    ),
                    filename: "b.pdf".into(),
                },
            ],
            None,
            Duration::from_secs(5),
            &weights,
            &products,
            5,
        )
        .await;
        // c2 wins: near-equal base, but keyword + type + density boosts.
        assert_eq!(fused[0].chunk.id, "c2");
        assert!(fused[0].rerank_score.is_none());
        assert!(!fused[0].candidate.signals.rerank_skipped);
    }

    #[tokio::test]
    async fn failed_rerank_degrades_to_neutral_and_flags() {
        let fused = rerank_and_fuse(
            "query",
            vec![FusionCandidate {
                candidate: candidate("c1", 0.5),
                chunk: chunk("c1", "text", 0.2, ChunkType::Content),
                filename: "a.pdf".into(),
            }],
            Some(&crate::rerank::DisabledReranker),
            Duration::from_secs(5),
            &FusionConfig::default(),
            &BTreeMap::new(),
            5,
        )
        .await;
        assert_eq!(fused[0].rerank_score, Some(NEUTRAL_RERANK_SCORE));
        assert!(fused[0].candidate.signals.rerank_skipped);
    }

    #[tokio::test]
    async fn fusion_is_monotone_in_dominance() {
        // B dominates A on base and all boosts; B must rank no worse.
        let products = BTreeMap::new();
        let fused = rerank_and_fuse(
            "minimum balance",
            vec![
                FusionCandidate {
                    candidate: candidate("a", 0.3),
                    chunk: chunk("a", "nothing relevant", 0.1, ChunkType::Content),
                    filename: "x.pdf".into(),
                },
                FusionCandidate {
                    candidate: candidate("b", 0.6),
                    chunk: chunk("b", "minimum balance rules", 0.6, ChunkType::Requirement),
                    filename: "minimum.pdf".into(),
                },
            ],
            None,
            Duration::from_secs(5),
            &FusionConfig::default(),
            &products,
            5,
        )
        .await;
        assert_eq!(fused[0].chunk.id, "b");
    }

    #[tokio::test]
    async fn fusion_is_deterministic() {
        let make = || {
            vec![
                FusionCandidate {
                    candidate: candidate("c1", 0.5),
                    chunk: chunk("c1", "same text", 0.4, ChunkType::Content),
                    filename: "a.pdf".into(),
                },
                FusionCandidate {
                    candidate: candidate("c2", 0.5),
                    chunk: chunk("c2", "same text", 0.4, ChunkType::Content),
                    filename: "a.pdf".into(),
                },
            ]
        };
        let first = rerank_and_fuse(
            "q",
            make(),
            None,
            Duration::from_secs(5),
            &FusionConfig::default(),
            &BTreeMap::new(),
            5,
        )
        .await;
        let second = rerank_and_fuse(
            "q",
            make(),
            None,
            Duration::from_secs(5),
            &FusionConfig::default(),
            &BTreeMap::new(),
            5,
        )
        .await;
        let ids = |v: &[FusedCandidate]| v.iter().map(|f| f.chunk.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        // Equal scores tie-break on chunk id ascending.
        assert_eq!(first[0].chunk.id, "c1");
    }
}
