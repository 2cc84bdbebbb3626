//! SQLite-backed [`GraphStore`] implementation.
//!
//! Models the property graph as node tables (`documents`, `chunks`,
//! `entities`) and edge tables (`chunk_entities`, `related_to`).
//! Embeddings are stored as little-endian f32 BLOBs. The database runs in
//! WAL mode so reads proceed while the community detector holds its write
//! transaction. Vector search is a brute-force cosine scan over candidate
//! rows after SQL filtering; swap in an ANN index behind the same method
//! if the corpus outgrows it.
//!
//! Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`), run by
//! `dg init`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::StoreError;
use crate::model::{Chunk, ChunkType, Document, Entity, EntityType};

use super::{
    check_dims, cosine_similarity, GraphStore, KeywordMode, RelatedEdge, SchemaSnapshot,
    SearchFilter, Snapshot, StoreResult, StoreStats,
};

pub struct SqliteStore {
    pool: SqlitePool,
    dims: usize,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `path` and runs the
    /// idempotent migrations.
    pub async fn open(path: &std::path::Path, dims: usize) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Permanent(format!("create db dir: {}", e)))?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| StoreError::Permanent(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool, dims };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                processed_date TEXT NOT NULL,
                title TEXT,
                category TEXT,
                division TEXT,
                doc_category TEXT,
                products_json TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                page_num INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                embedding BLOB,
                semantic_density REAL NOT NULL,
                chunk_type TEXT NOT NULL,
                has_definitions INTEGER NOT NULL DEFAULT 0,
                has_examples INTEGER NOT NULL DEFAULT 0,
                has_lists INTEGER NOT NULL DEFAULT 0,
                keywords_json TEXT NOT NULL DEFAULT '[]',
                division TEXT,
                doc_category TEXT,
                UNIQUE(document_id, chunk_index),
                FOREIGN KEY (document_id) REFERENCES documents(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                occurrence_count INTEGER NOT NULL DEFAULT 1,
                community_id INTEGER,
                degree_centrality REAL,
                is_bridge_node INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_entities (
                chunk_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                PRIMARY KEY (chunk_id, entity_id),
                FOREIGN KEY (chunk_id) REFERENCES chunks(id),
                FOREIGN KEY (entity_id) REFERENCES entities(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS related_to (
                a_id TEXT NOT NULL,
                b_id TEXT NOT NULL,
                strength INTEGER NOT NULL,
                PRIMARY KEY (a_id, b_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_division ON chunks(division)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_community ON entities(community_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunk_entities_entity ON chunk_entities(entity_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Document> {
        let products_json: String = row.get("products_json");
        let products: Vec<String> = serde_json::from_str(&products_json)
            .map_err(|e| StoreError::Permanent(format!("corrupt products_json: {}", e)))?;
        let processed: String = row.get("processed_date");
        let processed_date = DateTime::parse_from_rfc3339(&processed)
            .map_err(|e| StoreError::Permanent(format!("corrupt processed_date: {}", e)))?
            .with_timezone(&Utc);
        Ok(Document {
            id: row.get("id"),
            filename: row.get("filename"),
            page_count: row.get::<i64, _>("page_count") as u32,
            processed_date,
            title: row.get("title"),
            category: row.get("category"),
            division: row.get("division"),
            doc_category: row.get("doc_category"),
            products,
        })
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> StoreResult<Chunk> {
        let keywords_json: String = row.get("keywords_json");
        let keywords: Vec<String> = serde_json::from_str(&keywords_json)
            .map_err(|e| StoreError::Permanent(format!("corrupt keywords_json: {}", e)))?;
        let chunk_type_str: String = row.get("chunk_type");
        let chunk_type = match chunk_type_str.as_str() {
            "definition" => ChunkType::Definition,
            "example" => ChunkType::Example,
            "requirement" => ChunkType::Requirement,
            "procedure" => ChunkType::Procedure,
            _ => ChunkType::Content,
        };
        let embedding: Option<Vec<u8>> = row.get("embedding");
        Ok(Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            page_num: row.get::<i64, _>("page_num") as u32,
            chunk_index: row.get::<i64, _>("chunk_index") as u32,
            text: row.get("text"),
            token_count: row.get::<i64, _>("token_count") as u32,
            embedding: embedding.map(|b| blob_to_vec(&b)),
            semantic_density: row.get("semantic_density"),
            chunk_type,
            has_definitions: row.get::<i64, _>("has_definitions") != 0,
            has_examples: row.get::<i64, _>("has_examples") != 0,
            has_lists: row.get::<i64, _>("has_lists") != 0,
            keywords,
            division: row.get("division"),
            doc_category: row.get("doc_category"),
        })
    }

    fn row_to_entity(row: &sqlx::sqlite::SqliteRow) -> Entity {
        let entity_type_str: String = row.get("entity_type");
        let entity_type = match entity_type_str.as_str() {
            "product" => EntityType::Product,
            "institution" => EntityType::Institution,
            "amount" => EntityType::Amount,
            "term" => EntityType::Term,
            _ => EntityType::Other,
        };
        Entity {
            id: row.get("id"),
            text: row.get("text"),
            entity_type,
            occurrence_count: row.get::<i64, _>("occurrence_count") as u64,
            community_id: row.get("community_id"),
            degree_centrality: row.get("degree_centrality"),
            is_bridge_node: row.get::<i64, _>("is_bridge_node") != 0,
        }
    }

    async fn insert_chunk_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        chunk: &Chunk,
    ) -> StoreResult<()> {
        let keywords_json = serde_json::to_string(&chunk.keywords)
            .map_err(|e| StoreError::Permanent(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, page_num, chunk_index, text, token_count,
                                embedding, semantic_density, chunk_type, has_definitions,
                                has_examples, has_lists, keywords_json, division, doc_category)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.page_num as i64)
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.text)
        .bind(chunk.token_count as i64)
        .bind(chunk.embedding.as_ref().map(|v| vec_to_blob(v)))
        .bind(chunk.semantic_density)
        .bind(chunk.chunk_type.as_str())
        .bind(chunk.has_definitions as i64)
        .bind(chunk.has_examples as i64)
        .bind(chunk.has_lists as i64)
        .bind(keywords_json)
        .bind(&chunk.division)
        .bind(&chunk.doc_category)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GraphStore for SqliteStore {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn upsert_document(&self, doc: &Document) -> StoreResult<()> {
        let products_json = serde_json::to_string(&doc.products)
            .map_err(|e| StoreError::Permanent(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, page_count, processed_date, title, category,
                                   division, doc_category, products_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                filename = excluded.filename,
                page_count = excluded.page_count,
                processed_date = excluded.processed_date,
                title = excluded.title,
                category = excluded.category,
                division = excluded.division,
                doc_category = excluded.doc_category,
                products_json = excluded.products_json
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(doc.page_count as i64)
        .bind(doc.processed_date.to_rfc3339())
        .bind(&doc.title)
        .bind(&doc.category)
        .bind(&doc.division)
        .bind(&doc.doc_category)
        .bind(products_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_document_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> StoreResult<()> {
        for c in chunks {
            if let Some(v) = &c.embedding {
                check_dims(self.dims, v)?;
            }
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunk_entities WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(doc_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            Self::insert_chunk_tx(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_entity(&self, text: &str, entity_type: EntityType) -> StoreResult<String> {
        let canonical = text.trim().to_lowercase();
        if canonical.is_empty() {
            return Err(StoreError::Permanent("empty entity text".into()));
        }
        let existing: Option<String> = sqlx::query_scalar("SELECT id FROM entities WHERE text = ?")
            .bind(&canonical)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(id) = existing {
            sqlx::query("UPDATE entities SET occurrence_count = occurrence_count + 1 WHERE id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await?;
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO entities (id, text, entity_type, occurrence_count) VALUES (?, ?, ?, 1)",
        )
        .bind(&id)
        .bind(&canonical)
        .bind(entity_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn link_chunk_entity(&self, chunk_id: &str, entity_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chunk_entities (chunk_id, entity_id) VALUES (?, ?) \
             ON CONFLICT(chunk_id, entity_id) DO NOTHING",
        )
        .bind(chunk_id)
        .bind(entity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn build_related_to(&self, min_strength: u32) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM related_to").execute(&mut *tx).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO related_to (a_id, b_id, strength)
            SELECT ce1.entity_id, ce2.entity_id, COUNT(*) AS strength
            FROM chunk_entities ce1
            JOIN chunk_entities ce2
              ON ce1.chunk_id = ce2.chunk_id AND ce1.entity_id < ce2.entity_id
            GROUP BY ce1.entity_id, ce2.entity_id
            HAVING COUNT(*) > ?
            "#,
        )
        .bind(min_strength as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn set_entity_community(
        &self,
        entity_id: &str,
        community_id: i64,
        centrality: f64,
        is_bridge: bool,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE entities SET community_id = ?, degree_centrality = ?, is_bridge_node = ? \
             WHERE id = ?",
        )
        .bind(community_id)
        .bind(centrality)
        .bind(is_bridge as i64)
        .bind(entity_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Permanent(format!(
                "unknown entity: {}",
                entity_id
            )));
        }
        Ok(())
    }

    async fn vector_topk(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> StoreResult<Vec<(String, f64)>> {
        check_dims(self.dims, query)?;

        let mut sql = String::from(
            "SELECT c.id, c.embedding FROM chunks c WHERE c.embedding IS NOT NULL",
        );
        if filter.division.is_some() {
            sql.push_str(" AND c.division = ?");
        }
        if filter.category.is_some() {
            sql.push_str(" AND c.doc_category = ?");
        }
        if let Some(communities) = &filter.communities {
            let placeholders = vec!["?"; communities.len().max(1)].join(", ");
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM chunk_entities ce \
                   JOIN entities e ON e.id = ce.entity_id \
                   WHERE ce.chunk_id = c.id AND e.community_id IN ({}))",
                placeholders
            ));
        }
        if filter.keyword.is_some() {
            sql.push_str(" AND instr(c.keywords_json, ?) > 0");
        }

        let mut q = sqlx::query(&sql);
        if let Some(div) = &filter.division {
            q = q.bind(div);
        }
        if let Some(cat) = &filter.category {
            q = q.bind(cat);
        }
        if let Some(communities) = &filter.communities {
            if communities.is_empty() {
                q = q.bind(-1i64);
            } else {
                for c in communities {
                    q = q.bind(c);
                }
            }
        }
        if let Some(word) = &filter.keyword {
            // keywords_json holds lowercase JSON strings.
            q = q.bind(format!("\"{}\"", word.to_lowercase()));
        }

        let rows = q.fetch_all(&self.pool).await?;
        let mut scored: Vec<(String, f64)> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = blob_to_vec(&blob);
                let sim = cosine_similarity(query, &vec);
                (row.get::<String, _>("id"), sim)
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
        let clause = match mode {
            KeywordMode::Any => vec!["instr(lower(text), ?) > 0"; keywords.len()].join(" OR "),
            KeywordMode::All => vec!["instr(lower(text), ?) > 0"; keywords.len()].join(" AND "),
        };
        let sql = format!(
            "SELECT id FROM chunks WHERE ({}) ORDER BY id LIMIT ?",
            clause
        );
        let mut q = sqlx::query_scalar::<_, String>(&sql);
        for kw in keywords {
            q = q.bind(kw.to_lowercase());
        }
        q = q.bind(limit as i64);
        Ok(q.fetch_all(&self.pool).await?)
    }

    async fn chunks_by_entities(&self, entity_ids: &[String]) -> StoreResult<Vec<String>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; entity_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT chunk_id FROM chunk_entities WHERE entity_id IN ({}) ORDER BY chunk_id",
            placeholders
        );
        let mut q = sqlx::query_scalar::<_, String>(&sql);
        for id in entity_ids {
            q = q.bind(id);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    async fn entities_in_chunks(&self, chunk_ids: &[String]) -> StoreResult<Vec<String>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; chunk_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT entity_id FROM chunk_entities WHERE chunk_id IN ({}) ORDER BY entity_id",
            placeholders
        );
        let mut q = sqlx::query_scalar::<_, String>(&sql);
        for id in chunk_ids {
            q = q.bind(id);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    async fn neighbors(&self, entity_id: &str) -> StoreResult<Vec<(String, u32)>> {
        let rows = sqlx::query(
            r#"
            SELECT CASE WHEN a_id = ? THEN b_id ELSE a_id END AS other, strength
            FROM related_to
            WHERE a_id = ? OR b_id = ?
            ORDER BY strength DESC, other
            "#,
        )
        .bind(entity_id)
        .bind(entity_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("other"), r.get::<i64, _>("strength") as u32))
            .collect())
    }

    async fn communities_of(&self, entity_ids: &[String]) -> StoreResult<Vec<i64>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; entity_ids.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT community_id FROM entities \
             WHERE id IN ({}) AND community_id IS NOT NULL ORDER BY community_id",
            placeholders
        );
        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        for id in entity_ids {
            q = q.bind(id);
        }
        Ok(q.fetch_all(&self.pool).await?)
    }

    async fn related_edges(&self) -> StoreResult<Vec<RelatedEdge>> {
        let rows = sqlx::query("SELECT a_id, b_id, strength FROM related_to ORDER BY a_id, b_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| RelatedEdge {
                a: r.get("a_id"),
                b: r.get("b_id"),
                strength: r.get::<i64, _>("strength") as u32,
            })
            .collect())
    }

    async fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_document(&r)).transpose()
    }

    async fn get_chunk(&self, id: &str) -> StoreResult<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_chunk(&r)).transpose()
    }

    async fn list_documents(&self) -> StoreResult<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_document).collect()
    }

    async fn document_chunks(&self, doc_id: &str) -> StoreResult<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
            .bind(doc_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn adjacent_chunks(&self, chunk_id: &str) -> StoreResult<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c2.* FROM chunks c1
            JOIN chunks c2 ON c2.document_id = c1.document_id
              AND (c2.chunk_index = c1.chunk_index - 1 OR c2.chunk_index = c1.chunk_index + 1)
            WHERE c1.id = ?
            ORDER BY c2.chunk_index
            "#,
        )
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_chunk).collect()
    }

    async fn all_entities(&self) -> StoreResult<Vec<Entity>> {
        let rows = sqlx::query("SELECT * FROM entities ORDER BY text")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(Self::row_to_entity).collect())
    }

    async fn get_entity(&self, id: &str) -> StoreResult<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_entity(&r)))
    }

    async fn entities_matching_text(&self, text: &str) -> StoreResult<Vec<Entity>> {
        let haystack = text.to_lowercase();
        // The entity table is small relative to chunks; scan it here
        // instead of pushing substring logic into SQL.
        let all = self.all_entities().await?;
        Ok(all
            .into_iter()
            .filter(|e| e.text.len() > 2 && haystack.contains(&e.text))
            .collect())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let entities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        let related: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM related_to")
            .fetch_one(&self.pool)
            .await?;
        let communities: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT community_id) FROM entities WHERE community_id IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        let assigned: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE community_id IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let bridges: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE is_bridge_node = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(StoreStats {
            documents: documents as u64,
            chunks: chunks as u64,
            embedded_chunks: embedded as u64,
            entities: entities as u64,
            related_edges: related as u64,
            communities: communities as u64,
            bridge_nodes: bridges as u64,
            avg_community_size: if communities > 0 {
                assigned as f64 / communities as f64
            } else {
                0.0
            },
        })
    }

    async fn schema_snapshot(&self) -> StoreResult<SchemaSnapshot> {
        let mut properties = std::collections::BTreeMap::new();
        for (label, table) in [
            ("Document", "documents"),
            ("Chunk", "chunks"),
            ("Entity", "entities"),
        ] {
            let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
                .fetch_all(&self.pool)
                .await?;
            let cols: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
            properties.insert(label.to_string(), cols);
        }
        let index_rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
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
                "Chunk(document_id, chunk_index) unique".into(),
            ],
            indexes: index_rows
                .iter()
                .map(|r| r.get::<String, _>("name"))
                .collect(),
        })
    }

    async fn export_snapshot(&self) -> StoreResult<Snapshot> {
        let documents = self.list_documents().await?;
        let chunk_rows = sqlx::query("SELECT * FROM chunks ORDER BY document_id, chunk_index")
            .fetch_all(&self.pool)
            .await?;
        let chunks: Vec<Chunk> = chunk_rows
            .iter()
            .map(Self::row_to_chunk)
            .collect::<StoreResult<_>>()?;
        let entities = self.all_entities().await?;
        let ce_rows =
            sqlx::query("SELECT chunk_id, entity_id FROM chunk_entities ORDER BY chunk_id, entity_id")
                .fetch_all(&self.pool)
                .await?;
        let chunk_entities = ce_rows
            .iter()
            .map(|r| (r.get("chunk_id"), r.get("entity_id")))
            .collect();
        let related_to = self.related_edges().await?;
        Ok(Snapshot {
            exported_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
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
        let mut tx = self.pool.begin().await?;
        for table in ["chunk_entities", "related_to", "chunks", "entities", "documents"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        for doc in &snapshot.documents {
            let products_json = serde_json::to_string(&doc.products)
                .map_err(|e| StoreError::Permanent(e.to_string()))?;
            sqlx::query(
                "INSERT INTO documents (id, filename, page_count, processed_date, title, category, \
                 division, doc_category, products_json) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&doc.id)
            .bind(&doc.filename)
            .bind(doc.page_count as i64)
            .bind(doc.processed_date.to_rfc3339())
            .bind(&doc.title)
            .bind(&doc.category)
            .bind(&doc.division)
            .bind(&doc.doc_category)
            .bind(products_json)
            .execute(&mut *tx)
            .await?;
        }
        for chunk in &snapshot.chunks {
            Self::insert_chunk_tx(&mut tx, chunk).await?;
        }
        for entity in &snapshot.entities {
            sqlx::query(
                "INSERT INTO entities (id, text, entity_type, occurrence_count, community_id, \
                 degree_centrality, is_bridge_node) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entity.id)
            .bind(&entity.text)
            .bind(entity.entity_type.as_str())
            .bind(entity.occurrence_count as i64)
            .bind(entity.community_id)
            .bind(entity.degree_centrality)
            .bind(entity.is_bridge_node as i64)
            .execute(&mut *tx)
            .await?;
        }
        for (chunk_id, entity_id) in &snapshot.chunk_entities {
            sqlx::query("INSERT INTO chunk_entities (chunk_id, entity_id) VALUES (?, ?)")
                .bind(chunk_id)
                .bind(entity_id)
                .execute(&mut *tx)
                .await?;
        }
        for edge in &snapshot.related_to {
            sqlx::query("INSERT INTO related_to (a_id, b_id, strength) VALUES (?, ?, ?)")
                .bind(&edge.a)
                .bind(&edge.b)
                .bind(edge.strength as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn wipe(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["chunk_entities", "related_to", "chunks", "entities", "documents"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn open_store(dims: usize) -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(&tmp.path().join("dg.sqlite"), dims)
            .await
            .unwrap();
        (tmp, store)
    }

    fn doc(id: &str) -> Document {
        Document {
            id: id.to_string(),
            filename: format!("{}.pdf", id),
            page_count: 2,
            processed_date: Utc::now(),
            title: Some("Product Disclosure".into()),
            category: Some("pds".into()),
            division: Some("WIB".into()),
            doc_category: Some("markets".into()),
            products: vec!["interest rate swap".into()],
        }
    }

    fn chunk(doc_id: &str, page: u32, index: u32, text: &str, emb: Option<Vec<f32>>) -> Chunk {
        Chunk {
            id: Chunk::make_id(doc_id, page, index),
            document_id: doc_id.to_string(),
            page_num: page,
            chunk_index: index,
            text: text.to_string(),
            token_count: text.split_whitespace().count() as u32,
            embedding: emb,
            semantic_density: 0.4,
            chunk_type: ChunkType::Content,
            has_definitions: false,
            has_examples: false,
            has_lists: false,
            keywords: text
                .to_lowercase()
                .split_whitespace()
                .map(String::from)
                .collect(),
            division: Some("WIB".into()),
            doc_category: Some("markets".into()),
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("dg.sqlite");
        let store = SqliteStore::open(&path, 3).await.unwrap();
        store.close().await;
        // Re-opening runs migrations again against the same file.
        let store2 = SqliteStore::open(&path, 3).await.unwrap();
        assert_eq!(store2.stats().await.unwrap().documents, 0);
    }

    #[tokio::test]
    async fn document_round_trip_preserves_fields() {
        let (_tmp, store) = open_store(3).await;
        let d = doc("irs-pds");
        store.upsert_document(&d).await.unwrap();
        let got = store.get_document("irs-pds").await.unwrap().unwrap();
        assert_eq!(got.filename, "irs-pds.pdf");
        assert_eq!(got.division.as_deref(), Some("WIB"));
        assert_eq!(got.products, vec!["interest rate swap".to_string()]);
    }

    #[tokio::test]
    async fn reingest_replaces_chunk_set() {
        let (_tmp, store) = open_store(2).await;
        store.upsert_document(&doc("a")).await.unwrap();
        store
            .replace_document_chunks(
                "a",
                &[
                    chunk("a", 1, 0, "old text", Some(vec![1.0, 0.0])),
                    chunk("a", 1, 1, "old more", None),
                ],
            )
            .await
            .unwrap();
        store
            .replace_document_chunks("a", &[chunk("a", 1, 0, "new text", Some(vec![0.0, 1.0]))])
            .await
            .unwrap();
        let chunks = store.document_chunks("a").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "new text");
        assert_eq!(chunks[0].embedding, Some(vec![0.0, 1.0]));
    }

    #[tokio::test]
    async fn vector_topk_respects_division_filter() {
        let (_tmp, store) = open_store(2).await;
        store.upsert_document(&doc("a")).await.unwrap();
        let mut other = chunk("a", 1, 1, "retail thing", Some(vec![1.0, 0.0]));
        other.division = Some("RETAIL".into());
        store
            .replace_document_chunks(
                "a",
                &[chunk("a", 1, 0, "wholesale thing", Some(vec![1.0, 0.0])), other],
            )
            .await
            .unwrap();
        let filter = SearchFilter {
            division: Some("WIB".into()),
            ..Default::default()
        };
        let top = store.vector_topk(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].0, "a_p1_c0");
    }

    #[tokio::test]
    async fn related_to_aggregation_matches_memory_semantics() {
        let (_tmp, store) = open_store(2).await;
        store.upsert_document(&doc("a")).await.unwrap();
        store
            .replace_document_chunks(
                "a",
                &[
                    chunk("a", 1, 0, "x", None),
                    chunk("a", 1, 1, "y", None),
                ],
            )
            .await
            .unwrap();
        let e1 = store.upsert_entity("swap", EntityType::Product).await.unwrap();
        let e2 = store.upsert_entity("option", EntityType::Product).await.unwrap();
        for cid in ["a_p1_c0", "a_p1_c1"] {
            store.link_chunk_entity(cid, &e1).await.unwrap();
            store.link_chunk_entity(cid, &e2).await.unwrap();
        }
        let written = store.build_related_to(1).await.unwrap();
        assert_eq!(written, 1);
        let neighbors = store.neighbors(&e1).await.unwrap();
        assert_eq!(neighbors, vec![(e2, 2)]);
    }

    #[tokio::test]
    async fn export_wipe_import_restores_query_results() {
        let (_tmp, store) = open_store(2).await;
        store.upsert_document(&doc("a")).await.unwrap();
        store
            .replace_document_chunks(
                "a",
                &[chunk("a", 1, 0, "minimum balance of 1000", Some(vec![0.6, 0.8]))],
            )
            .await
            .unwrap();
        let e = store.upsert_entity("balance", EntityType::Term).await.unwrap();
        store.link_chunk_entity("a_p1_c0", &e).await.unwrap();

        let snapshot = store.export_snapshot().await.unwrap();
        store.wipe().await.unwrap();
        assert_eq!(store.stats().await.unwrap().documents, 0);
        store.import_snapshot(&snapshot).await.unwrap();

        let top = store
            .vector_topk(&[0.6, 0.8], 1, &SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(top[0].0, "a_p1_c0");
        let kw = store
            .keyword_chunks(&["minimum".into()], KeywordMode::Any, 10)
            .await
            .unwrap();
        assert_eq!(kw, vec!["a_p1_c0".to_string()]);
    }
}
