//! The five scored retrieval strategies.
//!
//! Every strategy consumes the shared [`Query`] and produces ordered
//! [`Candidate`]s with typed signals; the engine fuses and reranks them
//! afterwards. Base scores are kept in [0, 1] across strategies (cosine,
//! normalized keyword overlap, normalized entity overlap) so fusion can
//! combine them without per-strategy rescaling.

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;

use crate::chunker;
use crate::embedding::Embedder;
use crate::error::ModelError;
use crate::model::{Candidate, Query, Signals, Strategy};
use crate::store::{GraphStore, KeywordMode, SearchFilter};

/// Pool size for keyword candidate collection before scoring.
const KEYWORD_POOL: usize = 200;

pub(crate) fn filter_from_query(query: &Query) -> SearchFilter {
    SearchFilter {
        division: query.division.clone(),
        category: query.category.clone(),
        communities: None,
        keyword: None,
    }
}

// ============ Vector ============

/// Cosine search over chunk embeddings. `fetch_k` is `2·top_k` when the
/// caller will rerank, else `top_k`.
pub async fn vector_strategy(
    store: &dyn GraphStore,
    embedder: &dyn Embedder,
    query: &Query,
    fetch_k: usize,
) -> Result<Vec<Candidate>, ModelError> {
    let vector = embedder.encode(&query.text).await?;
    let filter = filter_from_query(query);
    let hits = store
        .vector_topk(&vector, fetch_k, &filter)
        .await
        .map_err(|e| ModelError::Unavailable(e.to_string()))?;
    Ok(hits
        .into_iter()
        .map(|(chunk_id, cosine)| Candidate {
            chunk_id,
            base_score: cosine,
            provenance: Strategy::Vector,
            signals: Signals {
                cosine: Some(cosine),
                ..Default::default()
            },
        })
        .collect())
}

// ============ Keyword ============

/// Scores a chunk by the fraction of query keywords appearing as
/// case-insensitive substrings in its text.
pub async fn keyword_strategy(store: &dyn GraphStore, query: &Query) -> Result<Vec<Candidate>> {
    let keywords = chunker::extract_keywords(&query.text.to_lowercase());
    if keywords.is_empty() {
        return Ok(Vec::new());
    }
    let total = keywords.len() as u32;
    let pool = store
        .keyword_chunks(&keywords, KeywordMode::Any, KEYWORD_POOL)
        .await?;

    let mut candidates = Vec::new();
    for chunk_id in pool {
        let Some(chunk) = store.get_chunk(&chunk_id).await? else {
            continue;
        };
        if !passes_query_filter(query, chunk.division.as_deref(), chunk.doc_category.as_deref()) {
            continue;
        }
        let text = chunk.text.to_lowercase();
        let matches = keywords.iter().filter(|k| text.contains(k.as_str())).count() as u32;
        if matches == 0 {
            continue;
        }
        candidates.push(Candidate {
            chunk_id,
            base_score: f64::from(matches) / f64::from(total),
            provenance: Strategy::Keyword,
            signals: Signals {
                keyword_matches: Some(matches),
                query_keyword_count: Some(total),
                ..Default::default()
            },
        });
    }
    candidates.sort_by(|a, b| {
        b.base_score
            .partial_cmp(&a.base_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(query.top_k);
    Ok(candidates)
}

fn passes_query_filter(query: &Query, division: Option<&str>, category: Option<&str>) -> bool {
    if let Some(want) = &query.division {
        if division != Some(want.as_str()) {
            return false;
        }
    }
    if let Some(want) = &query.category {
        if category != Some(want.as_str()) {
            return false;
        }
    }
    true
}

// ============ Graph ============

/// Identifies entities mentioned in the query, expands to chunks
/// containing them, and scores by distinct matched entities. Ties break
/// by page number ascending.
pub async fn graph_strategy(store: &dyn GraphStore, query: &Query) -> Result<Vec<Candidate>> {
    let matched = store.entities_matching_text(&query.text).await?;
    if matched.is_empty() {
        return Ok(Vec::new());
    }
    let matched_ids: Vec<String> = matched.iter().map(|e| e.id.clone()).collect();
    let matched_texts: Vec<String> = matched.iter().map(|e| e.text.clone()).collect();
    let id_set: BTreeSet<&str> = matched_ids.iter().map(String::as_str).collect();

    let chunk_ids = store.chunks_by_entities(&matched_ids).await?;
    let mut scored: Vec<(Candidate, u32)> = Vec::new();
    for chunk_id in chunk_ids {
        let Some(chunk) = store.get_chunk(&chunk_id).await? else {
            continue;
        };
        if !passes_query_filter(query, chunk.division.as_deref(), chunk.doc_category.as_deref()) {
            continue;
        }
        let in_chunk = store.entities_in_chunks(std::slice::from_ref(&chunk_id)).await?;
        let hits = in_chunk.iter().filter(|id| id_set.contains(id.as_str())).count() as u32;
        if hits == 0 {
            continue;
        }
        let candidate = Candidate {
            chunk_id,
            base_score: f64::from(hits) / matched_ids.len() as f64,
            provenance: Strategy::Graph,
            signals: Signals {
                entity_matches: Some(hits),
                matched_entities: matched_texts.clone(),
                ..Default::default()
            },
        };
        scored.push((candidate, chunk.page_num));
    }
    scored.sort_by(|(a, page_a), (b, page_b)| {
        b.base_score
            .partial_cmp(&a.base_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| page_a.cmp(page_b))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    let mut out: Vec<Candidate> = scored.into_iter().map(|(c, _)| c).collect();
    out.truncate(query.top_k);
    Ok(out)
}

// ============ Hybrid ============

/// Linear combination of cosine and normalized keyword overlap with the
/// admission rule `cosine ≥ 0.5 OR keyword_matches ≥ 1`. Embedding
/// failure degrades to the keyword side only.
pub async fn hybrid_strategy(
    store: &dyn GraphStore,
    embedder: &dyn Embedder,
    query: &Query,
    w_vector: f64,
    w_keyword: f64,
    fetch_k: usize,
) -> Result<Vec<Candidate>> {
    let (vector_result, keyword_result) = tokio::join!(
        vector_strategy(store, embedder, query, fetch_k),
        keyword_strategy(store, query)
    );
    let vector_candidates = match vector_result {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "vector side of hybrid unavailable, keyword only");
            Vec::new()
        }
    };
    let keyword_candidates = keyword_result?;

    struct Partial {
        cosine: f64,
        keyword_matches: u32,
        query_keyword_count: u32,
        keyword_frac: f64,
    }
    let mut merged: HashMap<String, Partial> = HashMap::new();
    for c in &vector_candidates {
        merged
            .entry(c.chunk_id.clone())
            .or_insert(Partial {
                cosine: 0.0,
                keyword_matches: 0,
                query_keyword_count: 0,
                keyword_frac: 0.0,
            })
            .cosine = c.base_score;
    }
    for c in &keyword_candidates {
        let entry = merged.entry(c.chunk_id.clone()).or_insert(Partial {
            cosine: 0.0,
            keyword_matches: 0,
            query_keyword_count: 0,
            keyword_frac: 0.0,
        });
        entry.keyword_matches = c.signals.keyword_matches.unwrap_or(0);
        entry.query_keyword_count = c.signals.query_keyword_count.unwrap_or(0);
        entry.keyword_frac = c.base_score;
    }

    let mut candidates: Vec<Candidate> = merged
        .into_iter()
        .filter(|(_, p)| p.cosine >= 0.5 || p.keyword_matches >= 1)
        .map(|(chunk_id, p)| Candidate {
            chunk_id,
            base_score: w_vector * p.cosine + w_keyword * p.keyword_frac,
            provenance: Strategy::Hybrid,
            signals: Signals {
                cosine: Some(p.cosine),
                keyword_matches: Some(p.keyword_matches),
                query_keyword_count: Some(p.query_keyword_count),
                ..Default::default()
            },
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.base_score
            .partial_cmp(&a.base_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(fetch_k.max(query.top_k));
    Ok(candidates)
}

// ============ Community ============

/// Two-phase community-aware retrieval. Phase A restricts a vector search
/// to chunks touching the query entities' communities; phase B tops up
/// with bridge-node-bearing chunks from a global search when phase A
/// comes up short.
pub async fn community_strategy(
    store: &dyn GraphStore,
    embedder: &dyn Embedder,
    query: &Query,
    fetch_k: usize,
) -> Result<Vec<Candidate>, ModelError> {
    let matched = store
        .entities_matching_text(&query.text)
        .await
        .map_err(|e| ModelError::Unavailable(e.to_string()))?;
    let matched_ids: Vec<String> = matched.iter().map(|e| e.id.clone()).collect();
    let communities = store
        .communities_of(&matched_ids)
        .await
        .map_err(|e| ModelError::Unavailable(e.to_string()))?;

    if communities.is_empty() {
        // No community context; behave as a plain vector search.
        return vector_strategy(store, embedder, query, fetch_k).await;
    }

    let vector = embedder.encode(&query.text).await?;
    let mut filter = filter_from_query(query);
    filter.communities = Some(communities.clone());
    let phase_a = store
        .vector_topk(&vector, fetch_k, &filter)
        .await
        .map_err(|e| ModelError::Unavailable(e.to_string()))?;

    let mut candidates = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    for (chunk_id, cosine) in phase_a {
        let (coverage, avg_centrality) =
            community_signals(store, &chunk_id, &communities).await?;
        seen.insert(chunk_id.clone());
        candidates.push(Candidate {
            chunk_id,
            base_score: cosine,
            provenance: Strategy::Community,
            signals: Signals {
                cosine: Some(cosine),
                community_coverage: Some(coverage),
                avg_centrality: Some(avg_centrality),
                ..Default::default()
            },
        });
    }

    // Phase B: top up with bridge-node chunks from a global search.
    if candidates.len() < query.top_k {
        let global = store
            .vector_topk(&vector, fetch_k * 2, &filter_from_query(query))
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?;
        for (chunk_id, cosine) in global {
            if candidates.len() >= fetch_k.max(query.top_k) {
                break;
            }
            if seen.contains(&chunk_id) {
                continue;
            }
            if !chunk_has_bridge(store, &chunk_id).await? {
                continue;
            }
            seen.insert(chunk_id.clone());
            candidates.push(Candidate {
                chunk_id,
                base_score: cosine,
                provenance: Strategy::Community,
                signals: Signals {
                    cosine: Some(cosine),
                    community_coverage: Some(0),
                    ..Default::default()
                },
            });
        }
    }

    Ok(candidates)
}

async fn community_signals(
    store: &dyn GraphStore,
    chunk_id: &str,
    query_communities: &[i64],
) -> Result<(u32, f64), ModelError> {
    let entity_ids = store
        .entities_in_chunks(&[chunk_id.to_string()])
        .await
        .map_err(|e| ModelError::Unavailable(e.to_string()))?;
    let mut covered: BTreeSet<i64> = BTreeSet::new();
    let mut centralities: Vec<f64> = Vec::new();
    for id in &entity_ids {
        let Some(entity) = store
            .get_entity(id)
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?
        else {
            continue;
        };
        if let Some(community) = entity.community_id {
            if query_communities.contains(&community) {
                covered.insert(community);
                centralities.push(entity.degree_centrality.unwrap_or(0.0));
            }
        }
    }
    let avg = if centralities.is_empty() {
        0.0
    } else {
        centralities.iter().sum::<f64>() / centralities.len() as f64
    };
    Ok((covered.len() as u32, avg))
}

async fn chunk_has_bridge(store: &dyn GraphStore, chunk_id: &str) -> Result<bool, ModelError> {
    let entity_ids = store
        .entities_in_chunks(&[chunk_id.to_string()])
        .await
        .map_err(|e| ModelError::Unavailable(e.to_string()))?;
    for id in &entity_ids {
        if let Some(entity) = store
            .get_entity(id)
            .await
            .map_err(|e| ModelError::Unavailable(e.to_string()))?
        {
            if entity.is_bridge_node {
                return Ok(true);
            }
        }
    }
    Ok(false)
}
