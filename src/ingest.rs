//! Swarm ingestion orchestrator.
//!
//! Processes a batch of PDFs through a six-phase pipeline with as much
//! parallelism as the dependency structure permits:
//!
//! 1. **extract** — PDF → per-page text (CPU pool, per document)
//! 2. **chunk** — chunking + metadata + hierarchy classification (CPU pool)
//! 3. **embed** — chunk embeddings in mini-batches
//! 4. **entities** — rule-based mention extraction (CPU pool, independent of 3)
//! 5. **insert** — per-document atomic graph write (bounded write concurrency)
//! 6. **relate** — global RELATED_TO build + community detection, gated on
//!    phase 5 completing for every document
//!
//! Documents flow through phases 1–5 independently; there is no barrier
//! between documents. Transient store failures retry with exponential
//! backoff inside a per-task budget; permanent failures record the
//! document in `failed` and never block the batch. Cancellation is
//! cooperative: in-flight documents finish their current phase, no new
//! work starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::chunker;
use crate::community;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::entity::EntityExtractor;
use crate::error::ExtractError;
use crate::extract;
use crate::hierarchy;
use crate::model::{Chunk, Document, InventoryEntry};
use crate::progress::{IngestPhase, IngestProgressEvent, ProgressReporter};
use crate::store::{with_retries, GraphStore};

/// One permanently failed document.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedDocument {
    pub document_id: String,
    pub phase: String,
    pub error: String,
}

/// Cumulative task seconds spent in each phase across the batch.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PhaseTimings {
    pub extract_secs: f64,
    pub chunk_secs: f64,
    pub embed_secs: f64,
    pub entities_secs: f64,
    pub insert_secs: f64,
    pub relate_secs: f64,
}

/// Final batch summary. Partial failure is not a process failure: callers
/// exit 0 with a non-empty `failed` list.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct IngestSummary {
    pub processed: Vec<String>,
    pub failed: Vec<FailedDocument>,
    pub timings: PhaseTimings,
    pub communities: u64,
    pub related_edges: u64,
    pub cancelled: bool,
}

struct PipelineShared {
    config: Config,
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    extractor: EntityExtractor,
    cpu_pool: Semaphore,
    write_pool: Semaphore,
    cancel: CancellationToken,
    progress: Box<dyn ProgressReporter>,
    total: u64,
    done_counts: Mutex<HashMap<IngestPhase, u64>>,
    timings: Mutex<PhaseTimings>,
}

impl PipelineShared {
    async fn document_done(&self, phase: IngestPhase, document: &str) {
        let n = {
            let mut counts = self.done_counts.lock().await;
            let entry = counts.entry(phase).or_insert(0);
            *entry += 1;
            *entry
        };
        self.progress.report(IngestProgressEvent::DocumentDone {
            phase,
            document: document.to_string(),
            n,
            total: self.total,
        });
    }

    async fn add_timing(&self, phase: IngestPhase, elapsed: Duration) {
        let mut timings = self.timings.lock().await;
        let slot = match phase {
            IngestPhase::Extract => &mut timings.extract_secs,
            IngestPhase::Chunk => &mut timings.chunk_secs,
            IngestPhase::Embed => &mut timings.embed_secs,
            IngestPhase::Entities => &mut timings.entities_secs,
            IngestPhase::Insert => &mut timings.insert_secs,
            IngestPhase::Relate => &mut timings.relate_secs,
        };
        *slot += elapsed.as_secs_f64();
    }
}

/// Runs the full pipeline over an inventory batch.
pub async fn run_ingest(
    config: &Config,
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn Embedder>,
    entries: Vec<InventoryEntry>,
    cancel: CancellationToken,
    progress: Box<dyn ProgressReporter>,
) -> Result<IngestSummary> {
    let shared = Arc::new(PipelineShared {
        config: config.clone(),
        store: store.clone(),
        embedder,
        extractor: EntityExtractor::from_config(config),
        cpu_pool: Semaphore::new(config.ingest.effective_cpu_workers()),
        write_pool: Semaphore::new(config.ingest.write_workers.max(1)),
        cancel: cancel.clone(),
        progress,
        total: entries.len() as u64,
        done_counts: Mutex::new(HashMap::new()),
        timings: Mutex::new(PhaseTimings::default()),
    });

    let mut handles = Vec::with_capacity(entries.len());
    for entry in entries {
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            process_document(shared, entry).await
        }));
    }

    let mut summary = IngestSummary::default();
    for handle in handles {
        match handle.await {
            Ok(Ok(doc_id)) => summary.processed.push(doc_id),
            Ok(Err(failed)) => {
                shared.progress.report(IngestProgressEvent::DocumentFailed {
                    phase: phase_from_name(&failed.phase),
                    document: failed.document_id.clone(),
                    error: failed.error.clone(),
                });
                summary.failed.push(failed);
            }
            Err(e) => summary.failed.push(FailedDocument {
                document_id: "<task>".into(),
                phase: "join".into(),
                error: e.to_string(),
            }),
        }
    }
    summary.processed.sort();

    // Phase 6: global, single-threaded by design, gated on all documents.
    if !cancel.is_cancelled() && !summary.processed.is_empty() {
        shared.progress.report(IngestProgressEvent::GlobalPhase {
            phase: IngestPhase::Relate,
        });
        let start = Instant::now();
        let min_strength = config.community.min_strength;
        summary.related_edges = with_retries(config.ingest.max_retries, || {
            store.build_related_to(min_strength)
        })
        .await?;
        let assignment = community::run_detection(store.as_ref(), config.community.resolution).await?;
        summary.communities = assignment.community_count() as u64;
        shared.add_timing(IngestPhase::Relate, start.elapsed()).await;
    }

    summary.cancelled = cancel.is_cancelled();
    summary.timings = shared.timings.lock().await.clone();
    Ok(summary)
}

fn phase_from_name(name: &str) -> IngestPhase {
    IngestPhase::ALL
        .into_iter()
        .find(|p| p.as_str() == name)
        .unwrap_or(IngestPhase::Extract)
}

/// Phases 1–5 for one document. Returns the document id on success.
async fn process_document(
    shared: Arc<PipelineShared>,
    entry: InventoryEntry,
) -> Result<String, FailedDocument> {
    let doc_id = entry.document_id();
    let fail = |phase: IngestPhase, error: String| FailedDocument {
        document_id: doc_id.clone(),
        phase: phase.as_str().to_string(),
        error,
    };

    if shared.cancel.is_cancelled() {
        return Err(fail(IngestPhase::Extract, "cancelled".into()));
    }

    // Phase 1: extract.
    let start = Instant::now();
    let extraction = {
        let _permit = shared.cpu_pool.acquire().await.map_err(|e| {
            fail(IngestPhase::Extract, e.to_string())
        })?;
        let page_timeout = Duration::from_secs(shared.config.ingest.page_timeout_secs);
        extract::extract_pdf(std::path::Path::new(&entry.path), page_timeout)
            .await
            .map_err(|e: ExtractError| fail(IngestPhase::Extract, e.to_string()))?
    };
    for error in &extraction.errors {
        tracing::warn!(document = %doc_id, %error, "extraction error recorded");
    }
    shared.add_timing(IngestPhase::Extract, start.elapsed()).await;
    shared.document_done(IngestPhase::Extract, &doc_id).await;

    if shared.cancel.is_cancelled() {
        return Err(fail(IngestPhase::Chunk, "cancelled".into()));
    }

    // Phase 2: hierarchy classification + chunking.
    let start = Instant::now();
    let (document, mut chunks) = {
        let _permit = shared.cpu_pool.acquire().await.map_err(|e| {
            fail(IngestPhase::Chunk, e.to_string())
        })?;
        let full_text = extraction.pages.join("\n");
        let assignment = hierarchy::classify_document(
            &entry.filename,
            &full_text,
            entry.category.as_deref(),
            &shared.config.hierarchy,
        );
        if assignment.is_empty() && !shared.config.hierarchy.divisions.is_empty() {
            tracing::info!(document = %doc_id, "hierarchy classification below confidence, leaving empty");
        }
        let chunks = chunker::chunk_pages(
            &doc_id,
            assignment.division.as_deref(),
            assignment.category.as_deref(),
            &extraction.pages,
            &shared.config.chunking,
        );
        let document = Document {
            id: doc_id.clone(),
            filename: entry.filename.clone(),
            page_count: extraction.metadata.page_count,
            processed_date: chrono::Utc::now(),
            title: extraction.metadata.title.clone(),
            category: entry.category.clone(),
            division: assignment.division,
            doc_category: assignment.category,
            products: assignment.products,
        };
        (document, chunks)
    };
    shared.add_timing(IngestPhase::Chunk, start.elapsed()).await;
    shared.document_done(IngestPhase::Chunk, &doc_id).await;

    if shared.cancel.is_cancelled() {
        return Err(fail(IngestPhase::Embed, "cancelled".into()));
    }

    // Phase 3: embed in mini-batches. A dead model degrades to chunks
    // without embeddings (excluded from vector strategies) rather than
    // failing the document.
    let start = Instant::now();
    if shared.config.embedding.is_enabled() {
        let batch_size = shared.config.embedding.batch_size.max(1);
        for batch in chunks.chunks_mut(batch_size) {
            if shared.cancel.is_cancelled() {
                return Err(fail(IngestPhase::Embed, "cancelled".into()));
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            match shared.embedder.encode_batch(&texts).await {
                Ok(vectors) => {
                    for (chunk, vector) in batch.iter_mut().zip(vectors) {
                        chunk.embedding = Some(vector);
                    }
                }
                Err(e) => {
                    tracing::warn!(document = %doc_id, error = %e, "embedding batch failed, storing without vectors");
                }
            }
        }
    }
    shared.add_timing(IngestPhase::Embed, start.elapsed()).await;
    shared.document_done(IngestPhase::Embed, &doc_id).await;

    // Phase 4: entity extraction (independent of embed).
    let start = Instant::now();
    let mentions_per_chunk: Vec<Vec<crate::entity::EntityMention>> = {
        let _permit = shared.cpu_pool.acquire().await.map_err(|e| {
            fail(IngestPhase::Entities, e.to_string())
        })?;
        chunks
            .iter()
            .map(|c| shared.extractor.extract(&c.text))
            .collect()
    };
    shared.add_timing(IngestPhase::Entities, start.elapsed()).await;
    shared.document_done(IngestPhase::Entities, &doc_id).await;

    if shared.cancel.is_cancelled() {
        return Err(fail(IngestPhase::Insert, "cancelled".into()));
    }

    // Phase 5: graph insert, serialized per document.
    let start = Instant::now();
    {
        let _permit = shared.write_pool.acquire().await.map_err(|e| {
            fail(IngestPhase::Insert, e.to_string())
        })?;
        insert_document(&shared, &document, &chunks, &mentions_per_chunk)
            .await
            .map_err(|e| fail(IngestPhase::Insert, e))?;
    }
    shared.add_timing(IngestPhase::Insert, start.elapsed()).await;
    shared.document_done(IngestPhase::Insert, &doc_id).await;

    Ok(doc_id)
}

async fn insert_document(
    shared: &PipelineShared,
    document: &Document,
    chunks: &[Chunk],
    mentions_per_chunk: &[Vec<crate::entity::EntityMention>],
) -> Result<(), String> {
    let retries = shared.config.ingest.max_retries;
    let store = &shared.store;

    with_retries(retries, || store.upsert_document(document))
        .await
        .map_err(|e| e.to_string())?;
    with_retries(retries, || {
        store.replace_document_chunks(&document.id, chunks)
    })
    .await
    .map_err(|e| e.to_string())?;

    for (chunk, mentions) in chunks.iter().zip(mentions_per_chunk) {
        for mention in mentions {
            let entity_id = with_retries(retries, || {
                store.upsert_entity(&mention.text, mention.entity_type)
            })
            .await
            .map_err(|e| e.to_string())?;
            with_retries(retries, || store.link_chunk_entity(&chunk.id, &entity_id))
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

/// Reads an inventory file: a JSON array of [`InventoryEntry`] records.
pub fn load_inventory(path: &std::path::Path) -> Result<Vec<InventoryEntry>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read inventory {}: {}", path.display(), e))?;
    let entries: Vec<InventoryEntry> = serde_json::from_str(&content)
        .map_err(|e| anyhow::anyhow!("parse inventory {}: {}", path.display(), e))?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ServerConfig, StoreConfig};
    use crate::embedding::HashEmbedder;
    use crate::progress::NoProgress;
    use crate::store::memory::MemoryStore;
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Object, Stream};
    use tempfile::TempDir;

    fn test_config() -> Config {
        Config {
            store: StoreConfig {
                backend: "memory".into(),
                path: "unused".into(),
            },
            chunking: Default::default(),
            embedding: crate::config::EmbeddingConfig {
                provider: "hashed".into(),
                dims: 64,
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
            products: [("irs".to_string(), "interest rate swap".to_string())]
                .into_iter()
                .collect(),
        }
    }

    fn write_pdf(path: &std::path::Path, page_texts: &[&str]) {
        let mut doc = lopdf::Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids: Vec<Object> = Vec::new();
        for text in page_texts {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id =
                doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    fn entry(path: &std::path::Path, filename: &str) -> InventoryEntry {
        InventoryEntry {
            path: path.display().to_string(),
            filename: filename.to_string(),
            category: Some("pds".into()),
            source_url: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn empty_batch_is_a_clean_noop() {
        let config = test_config();
        let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new(64));
        let summary = run_ingest(
            &config,
            store.clone(),
            Arc::new(HashEmbedder::new(64)),
            Vec::new(),
            CancellationToken::new(),
            Box::new(NoProgress),
        )
        .await
        .unwrap();
        assert!(summary.processed.is_empty());
        assert!(summary.failed.is_empty());
        assert_eq!(store.stats().await.unwrap().documents, 0);
    }

    #[tokio::test]
    async fn single_document_populates_graph() {
        let tmp = TempDir::new().unwrap();
        let pdf = tmp.path().join("irs_pds.pdf");
        write_pdf(
            &pdf,
            &[
                "The IRS means an interest rate swap agreement with minimum balance of 1000",
                "Worked Example of the swap for Westpac Banking customers",
                "Fees and charges apply per the schedule",
            ],
        );
        let config = test_config();
        let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new(64));
        let summary = run_ingest(
            &config,
            store.clone(),
            Arc::new(HashEmbedder::new(64)),
            vec![entry(&pdf, "irs_pds.pdf")],
            CancellationToken::new(),
            Box::new(NoProgress),
        )
        .await
        .unwrap();

        assert_eq!(summary.processed, vec!["irs_pds".to_string()]);
        assert!(summary.failed.is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        assert!(stats.chunks >= 3);
        assert_eq!(stats.embedded_chunks, stats.chunks);
        assert!(stats.entities >= 1);

        let chunks = store.document_chunks("irs_pds").await.unwrap();
        for c in &chunks {
            assert_eq!(c.embedding.as_ref().unwrap().len(), 64);
        }
    }

    #[tokio::test]
    async fn reingest_is_idempotent_for_observers() {
        let tmp = TempDir::new().unwrap();
        let pdf = tmp.path().join("doc.pdf");
        write_pdf(&pdf, &["stable text about term deposit products"]);
        let config = test_config();
        let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new(64));

        for _ in 0..2 {
            run_ingest(
                &config,
                store.clone(),
                Arc::new(HashEmbedder::new(64)),
                vec![entry(&pdf, "doc.pdf")],
                CancellationToken::new(),
                Box::new(NoProgress),
            )
            .await
            .unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.documents, 1);
        let chunks = store.document_chunks("doc").await.unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["doc_p1_c0"]);
    }

    #[tokio::test]
    async fn missing_file_fails_document_not_batch() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.pdf");
        write_pdf(&good, &["good content here"]);
        let config = test_config();
        let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new(64));
        let summary = run_ingest(
            &config,
            store.clone(),
            Arc::new(HashEmbedder::new(64)),
            vec![
                entry(&tmp.path().join("missing.pdf"), "missing.pdf"),
                entry(&good, "good.pdf"),
            ],
            CancellationToken::new(),
            Box::new(NoProgress),
        )
        .await
        .unwrap();
        assert_eq!(summary.processed, vec!["good".to_string()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].document_id, "missing");
        assert_eq!(summary.failed[0].phase, "extract");
    }

    #[tokio::test]
    async fn cancellation_stops_new_work() {
        let tmp = TempDir::new().unwrap();
        let pdf = tmp.path().join("doc.pdf");
        write_pdf(&pdf, &["content"]);
        let config = test_config();
        let store: Arc<dyn GraphStore> = Arc::new(MemoryStore::new(64));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = run_ingest(
            &config,
            store,
            Arc::new(HashEmbedder::new(64)),
            vec![entry(&pdf, "doc.pdf")],
            cancel,
            Box::new(NoProgress),
        )
        .await
        .unwrap();
        assert!(summary.cancelled);
        assert!(summary.processed.is_empty());
    }
}
