//! In-memory [`GraphStore`] implementation for tests and ephemeral runs.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Vector search is
//! brute-force cosine over all stored embeddings; keyword search is a
//! linear substring scan. No lock is held across an await point.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Chunk, Document, Entity, EntityType};

use super::{
    check_dims, cosine_similarity, GraphStore, KeywordMode, RelatedEdge, SchemaSnapshot,
    SearchFilter, Snapshot, StoreResult, StoreStats,
};

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    /// Chunk ids per document, ordered by chunk index.
    doc_chunks: HashMap<String, Vec<String>>,
    entities: HashMap<String, Entity>,
    entity_by_text: HashMap<String, String>,
    /// (chunk_id, entity_id) pairs.
    chunk_entities: BTreeSet<(String, String)>,
    /// Key is (a, b) with a < b.
    related: HashMap<(String, String), u32>,
}

pub struct MemoryStore {
    dims: usize,
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn chunk_passes_filter(inner: &Inner, chunk: &Chunk, filter: &SearchFilter) -> bool {
    if let Some(div) = &filter.division {
        if chunk.division.as_deref() != Some(div.as_str()) {
            return false;
        }
    }
    if let Some(cat) = &filter.category {
        if chunk.doc_category.as_deref() != Some(cat.as_str()) {
            return false;
        }
    }
    if let Some(word) = &filter.keyword {
        let w = word.to_lowercase();
        if !chunk.keywords.iter().any(|k| k == &w) {
            return false;
        }
    }
    if let Some(communities) = &filter.communities {
        let mut hit = false;
        for (cid, eid) in &inner.chunk_entities {
            if cid != &chunk.id {
                continue;
            }
            if let Some(entity) = inner.entities.get(eid) {
                if let Some(comm) = entity.community_id {
                    if communities.contains(&comm) {
                        hit = true;
                        break;
                    }
                }
            }
        }
        if !hit {
            return false;
        }
    }
    true
}

#[async_trait]
impl GraphStore for MemoryStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert_document(&self, doc: &Document) -> StoreResult<()> {
        let mut inner = self.lock_write();
        inner.docs.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn replace_document_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> StoreResult<()> {
        for c in chunks {
            if let Some(v) = &c.embedding {
                check_dims(self.dims, v)?;
            }
        }
        let mut inner = self.lock_write();
        if let Some(old) = inner.doc_chunks.remove(doc_id) {
            for id in old {
                inner.chunks.remove(&id);
                inner.chunk_entities.retain(|(cid, _)| cid != &id);
            }
        }
        let mut ids = Vec::with_capacity(chunks.len());
        for c in chunks {
            ids.push(c.id.clone());
            inner.chunks.insert(c.id.clone(), c.clone());
        }
        inner.doc_chunks.insert(doc_id.to_string(), ids);
        Ok(())
    }

    async fn upsert_entity(&self, text: &str, entity_type: EntityType) -> StoreResult<String> {
        let canonical = text.trim().to_lowercase();
        if canonical.is_empty() {
            return Err(StoreError::Permanent("empty entity text".into()));
        }
        let mut inner = self.lock_write();
        if let Some(id) = inner.entity_by_text.get(&canonical).cloned() {
            if let Some(entity) = inner.entities.get_mut(&id) {
                entity.occurrence_count += 1;
            }
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        inner.entity_by_text.insert(canonical.clone(), id.clone());
        inner.entities.insert(
            id.clone(),
            Entity {
                id: id.clone(),
                text: canonical,
                entity_type,
                occurrence_count: 1,
                community_id: None,
                degree_centrality: None,
                is_bridge_node: false,
            },
        );
        Ok(id)
    }

    async fn link_chunk_entity(&self, chunk_id: &str, entity_id: &str) -> StoreResult<()> {
        let mut inner = self.lock_write();
        if !inner.chunks.contains_key(chunk_id) {
            return Err(StoreError::Permanent(format!(
                "unknown chunk: {}",
                chunk_id
            )));
        }
        inner
            .chunk_entities
            .insert((chunk_id.to_string(), entity_id.to_string()));
        Ok(())
    }

    async fn build_related_to(&self, min_strength: u32) -> StoreResult<u64> {
        let mut inner = self.lock_write();
        let mut per_chunk: HashMap<&str, Vec<&str>> = HashMap::new();
        for (cid, eid) in &inner.chunk_entities {
            per_chunk.entry(cid.as_str()).or_default().push(eid.as_str());
        }
        let mut counts: HashMap<(String, String), u32> = HashMap::new();
        for ids in per_chunk.values() {
            for i in 0..ids.len() {
                for j in (i + 1)..ids.len() {
                    let (a, b) = if ids[i] < ids[j] {
                        (ids[i], ids[j])
                    } else {
                        (ids[j], ids[i])
                    };
                    if a == b {
                        continue;
                    }
                    *counts.entry((a.to_string(), b.to_string())).or_insert(0) += 1;
                }
            }
        }
        counts.retain(|_, strength| *strength > min_strength);
        let written = counts.len() as u64;
        inner.related = counts;
        Ok(written)
    }

    async fn set_entity_community(
        &self,
        entity_id: &str,
        community_id: i64,
        centrality: f64,
        is_bridge: bool,
    ) -> StoreResult<()> {
        let mut inner = self.lock_write();
        let entity = inner
            .entities
            .get_mut(entity_id)
            .ok_or_else(|| StoreError::Permanent(format!("unknown entity: {}", entity_id)))?;
        entity.community_id = Some(community_id);
        entity.degree_centrality = Some(centrality);
        entity.is_bridge_node = is_bridge;
        Ok(())
    }

    async fn vector_topk(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> StoreResult<Vec<(String, f64)>> {
        check_dims(self.dims, query)?;
        let inner = self.lock_read();
        let mut scored: Vec<(String, f64)> = inner
            .chunks
            .values()
            .filter(|c| c.embedding.is_some())
            .filter(|c| chunk_passes_filter(&inner, c, filter))
            .map(|c| {
                let sim = cosine_similarity(query, c.embedding.as_ref().unwrap());
                (c.id.clone(), sim)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn keyword_chunks(
        &self,
        keywords: &[String],
        mode: KeywordMode,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let needles: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        let inner = self.lock_read();
        let mut ids: Vec<String> = inner
            .chunks
            .values()
            .filter(|c| {
                let text = c.text.to_lowercase();
                match mode {
                    KeywordMode::Any => needles.iter().any(|n| text.contains(n)),
                    KeywordMode::All => needles.iter().all(|n| text.contains(n)),
                }
            })
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    async fn chunks_by_entities(&self, entity_ids: &[String]) -> StoreResult<Vec<String>> {
        let inner = self.lock_read();
        let mut ids: Vec<String> = inner
            .chunk_entities
            .iter()
            .filter(|(_, eid)| entity_ids.contains(eid))
            .map(|(cid, _)| cid.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn entities_in_chunks(&self, chunk_ids: &[String]) -> StoreResult<Vec<String>> {
        let inner = self.lock_read();
        let mut ids: Vec<String> = inner
            .chunk_entities
            .iter()
            .filter(|(cid, _)| chunk_ids.contains(cid))
            .map(|(_, eid)| eid.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn neighbors(&self, entity_id: &str) -> StoreResult<Vec<(String, u32)>> {
        let inner = self.lock_read();
        let mut out = Vec::new();
        for ((a, b), strength) in &inner.related {
            if a == entity_id {
                out.push((b.clone(), *strength));
            } else if b == entity_id {
                out.push((a.clone(), *strength));
            }
        }
        out.sort_by(|x, y| y.1.cmp(&x.1).then_with(|| x.0.cmp(&y.0)));
        Ok(out)
    }

    async fn communities_of(&self, entity_ids: &[String]) -> StoreResult<Vec<i64>> {
        let inner = self.lock_read();
        let mut out: Vec<i64> = entity_ids
            .iter()
            .filter_map(|id| inner.entities.get(id))
            .filter_map(|e| e.community_id)
            .collect();
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    async fn related_edges(&self) -> StoreResult<Vec<RelatedEdge>> {
        let inner = self.lock_read();
        let mut edges: Vec<RelatedEdge> = inner
            .related
            .iter()
            .map(|((a, b), strength)| RelatedEdge {
                a: a.clone(),
                b: b.clone(),
                strength: *strength,
            })
            .collect();
        edges.sort_by(|x, y| x.a.cmp(&y.a).then_with(|| x.b.cmp(&y.b)));
        Ok(edges)
    }

    async fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.lock_read().docs.get(id).cloned())
    }

    async fn get_chunk(&self, id: &str) -> StoreResult<Option<Chunk>> {
        Ok(self.lock_read().chunks.get(id).cloned())
    }

    async fn list_documents(&self) -> StoreResult<Vec<Document>> {
        let inner = self.lock_read();
        let mut docs: Vec<Document> = inner.docs.values().cloned().collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn document_chunks(&self, doc_id: &str) -> StoreResult<Vec<Chunk>> {
        let inner = self.lock_read();
        let mut chunks: Vec<Chunk> = inner
            .doc_chunks
            .get(doc_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.chunks.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn adjacent_chunks(&self, chunk_id: &str) -> StoreResult<Vec<Chunk>> {
        let inner = self.lock_read();
        let Some(chunk) = inner.chunks.get(chunk_id) else {
            return Ok(Vec::new());
        };
        let out = inner
            .chunks
            .values()
            .filter(|c| {
                c.document_id == chunk.document_id
                    && (c.chunk_index + 1 == chunk.chunk_index
                        || c.chunk_index == chunk.chunk_index + 1)
            })
            .cloned()
            .collect();
        Ok(out)
    }

    async fn all_entities(&self) -> StoreResult<Vec<Entity>> {
        let inner = self.lock_read();
        let mut entities: Vec<Entity> = inner.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.text.cmp(&b.text));
        Ok(entities)
    }

    async fn get_entity(&self, id: &str) -> StoreResult<Option<Entity>> {
        Ok(self.lock_read().entities.get(id).cloned())
    }

    async fn entities_matching_text(&self, text: &str) -> StoreResult<Vec<Entity>> {
        let haystack = text.to_lowercase();
        let inner = self.lock_read();
        let mut out: Vec<Entity> = inner
            .entities
            .values()
            .filter(|e| e.text.len() > 2 && haystack.contains(&e.text))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.text.cmp(&b.text));
        Ok(out)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.lock_read();
        let embedded = inner.chunks.values().filter(|c| c.embedding.is_some()).count() as u64;
        let mut communities: Vec<i64> = inner
            .entities
            .values()
            .filter_map(|e| e.community_id)
            .collect();
        let assigned = communities.len() as u64;
        communities.sort_unstable();
        communities.dedup();
        let community_count = communities.len() as u64;
        let bridges = inner.entities.values().filter(|e| e.is_bridge_node).count() as u64;
        Ok(StoreStats {
            documents: inner.docs.len() as u64,
            chunks: inner.chunks.len() as u64,
            embedded_chunks: embedded,
            entities: inner.entities.len() as u64,
            related_edges: inner.related.len() as u64,
            communities: community_count,
            bridge_nodes: bridges,
            avg_community_size: if community_count > 0 {
                assigned as f64 / community_count as f64
            } else {
                0.0
            },
        })
    }

    async fn schema_snapshot(&self) -> StoreResult<SchemaSnapshot> {
        let mut properties = std::collections::BTreeMap::new();
        properties.insert(
            "Document".to_string(),
            vec![
                "id".into(),
                "filename".into(),
                "page_count".into(),
                "processed_date".into(),
                "title".into(),
                "category".into(),
                "division".into(),
                "doc_category".into(),
                "products".into(),
            ],
        );
        properties.insert(
            "Chunk".to_string(),
            vec![
                "id".into(),
                "document_id".into(),
                "page_num".into(),
                "chunk_index".into(),
                "text".into(),
                "token_count".into(),
                "embedding".into(),
                "semantic_density".into(),
                "chunk_type".into(),
                "keywords".into(),
            ],
        );
        properties.insert(
            "Entity".to_string(),
            vec![
                "id".into(),
                "text".into(),
                "entity_type".into(),
                "occurrence_count".into(),
                "community_id".into(),
                "degree_centrality".into(),
                "is_bridge_node".into(),
            ],
        );
        Ok(SchemaSnapshot {
            labels: vec!["Document".into(), "Chunk".into(), "Entity".into()],
            edge_types: vec![
                "HAS_CHUNK".into(),
                "CONTAINS_ENTITY".into(),
                "RELATED_TO".into(),
            ],
            properties,
            constraints: vec![
                "Chunk.id unique".into(),
                "Entity.text unique".into(),
                "Chunk.document_id references Document.id".into(),
            ],
            indexes: vec!["Chunk.embedding (cosine)".into()],
        })
    }

    async fn export_snapshot(&self) -> StoreResult<Snapshot> {
        let inner = self.lock_read();
        let mut documents: Vec<Document> = inner.docs.values().cloned().collect();
        documents.sort_by(|a, b| a.id.cmp(&b.id));
        let mut chunks: Vec<Chunk> = inner.chunks.values().cloned().collect();
        chunks.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then_with(|| a.chunk_index.cmp(&b.chunk_index))
        });
        let mut entities: Vec<Entity> = inner.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.text.cmp(&b.text));
        let chunk_entities: Vec<(String, String)> =
            inner.chunk_entities.iter().cloned().collect();
        let mut related_to: Vec<RelatedEdge> = inner
            .related
            .iter()
            .map(|((a, b), strength)| RelatedEdge {
                a: a.clone(),
                b: b.clone(),
                strength: *strength,
            })
            .collect();
        related_to.sort_by(|x, y| x.a.cmp(&y.a).then_with(|| x.b.cmp(&y.b)));
        Ok(Snapshot {
            exported_at: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            embedding_dims: self.dims,
            documents,
            chunks,
            entities,
            chunk_entities,
            related_to,
        })
    }

    async fn import_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        if snapshot.embedding_dims != self.dims {
            return Err(StoreError::DimensionMismatch {
                expected: self.dims,
                got: snapshot.embedding_dims,
            });
        }
        let mut inner = self.lock_write();
        *inner = Inner::default();
        for d in &snapshot.documents {
            inner.docs.insert(d.id.clone(), d.clone());
        }
        for c in &snapshot.chunks {
            inner
                .doc_chunks
                .entry(c.document_id.clone())
                .or_default()
                .push(c.id.clone());
            inner.chunks.insert(c.id.clone(), c.clone());
        }
        for e in &snapshot.entities {
            inner.entity_by_text.insert(e.text.clone(), e.id.clone());
            inner.entities.insert(e.id.clone(), e.clone());
        }
        for (cid, eid) in &snapshot.chunk_entities {
            inner.chunk_entities.insert((cid.clone(), eid.clone()));
        }
        for edge in &snapshot.related_to {
            inner
                .related
                .insert((edge.a.clone(), edge.b.clone()), edge.strength);
        }
        Ok(())
    }

    async fn wipe(&self) -> StoreResult<()> {
        *self.lock_write() = Inner::default();
        Ok(())
    }
}
