//! `dg` — CLI over the docgraph retrieval engine.
//!
//! Subcommands cover the full lifecycle: `init` the store, `ingest` a PDF
//! inventory, run `communities` detection, `search`, inspect `stats`,
//! `export`/`import` snapshots, `evaluate` a labeled question set, and
//! `serve` the HTTP adapter.
//!
//! Exit codes: 0 on success — including ingestion batches with partial
//! per-document failures (reported in the summary) — and non-zero on any
//! permanent failure.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use docgraph::config::{self, Config};
use docgraph::embedding;
use docgraph::eval::{self, EvalConfig};
use docgraph::export;
use docgraph::ingest;
use docgraph::model::Strategy;
use docgraph::progress::ProgressMode;
use docgraph::query::{QueryEngine, SearchRequest};
use docgraph::rerank;
use docgraph::stats;
use docgraph::store::{memory::MemoryStore, sqlite::SqliteStore, GraphStore};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "dg",
    about = "docgraph — hybrid retrieval over a property-graph knowledge base",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/dg.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema
    Init,

    /// Ingest a batch of PDFs from a JSON inventory
    Ingest {
        /// Inventory file: JSON array of {path, filename, category, ...}
        inventory: PathBuf,

        /// Limit number of documents processed
        #[arg(long)]
        limit: Option<usize>,

        /// Parse and count without writing
        #[arg(long)]
        dry_run: bool,

        /// Progress output: off, human, or json (default: human on TTY)
        #[arg(long)]
        progress: Option<String>,
    },

    /// Run community detection over the entity graph
    Communities {
        /// Louvain resolution (default from config)
        #[arg(long)]
        resolution: Option<f64>,
    },

    /// Search the knowledge base
    Search {
        /// Query text
        query: String,

        /// Strategy: vector, keyword, graph, hybrid, community, nl_to_graph
        #[arg(long, default_value = "hybrid")]
        strategy: String,

        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,

        /// Apply cross-encoder reranking
        #[arg(long)]
        rerank: bool,

        /// Restrict to a division code
        #[arg(long)]
        division: Option<String>,

        /// Restrict to a category within the division
        #[arg(long)]
        category: Option<String>,
    },

    /// Show corpus and community statistics
    Stats {
        /// Also print the schema snapshot
        #[arg(long)]
        schema: bool,
    },

    /// Export the graph as a JSON snapshot
    Export {
        /// Output file (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Import a snapshot, replacing the store contents
    Import {
        /// Snapshot file produced by `dg export`
        input: PathBuf,
    },

    /// Run the accuracy harness over a labeled question set
    Evaluate {
        /// JSON array of {question, expected_document}
        cases: PathBuf,

        /// Only run the named configuration (vector | hybrid+rerank)
        #[arg(long)]
        only: Option<String>,

        /// Also sweep community detection across resolutions 0.5 / 1.0 /
        /// 1.5 and report sensitivity; the configured resolution's
        /// assignment is restored afterwards
        #[arg(long)]
        resolution_sweep: bool,

        /// Write the full per-case report as JSON to this file
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Start the HTTP query server
    Serve,
}

async fn open_store(config: &Config) -> Result<Arc<dyn GraphStore>> {
    let store: Arc<dyn GraphStore> = match config.store.backend.as_str() {
        "memory" => Arc::new(MemoryStore::new(config.embedding.dims)),
        _ => Arc::new(SqliteStore::open(&config.store.path, config.embedding.dims).await?),
    };
    Ok(store)
}

fn build_engine(config: &Config, store: Arc<dyn GraphStore>) -> Result<QueryEngine> {
    let embedder = embedding::create_embedder(&config.embedding)?;
    let reranker = rerank::create_reranker(&config.rerank)?;
    Ok(QueryEngine::new(
        config.clone(),
        store,
        Arc::from(embedder),
        Arc::from(reranker),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let _store = open_store(&cfg).await?;
            println!("Store initialized successfully.");
        }

        Commands::Ingest {
            inventory,
            limit,
            dry_run,
            progress,
        } => {
            let mut entries = ingest::load_inventory(&inventory)?;
            if let Some(limit) = limit {
                entries.truncate(limit);
            }
            if dry_run {
                println!("ingest (dry-run)");
                println!("  documents found: {}", entries.len());
                return Ok(());
            }

            let mode = match progress.as_deref() {
                Some("off") => ProgressMode::Off,
                Some("human") => ProgressMode::Human,
                Some("json") => ProgressMode::Json,
                _ => ProgressMode::default_for_tty(),
            };
            let store = open_store(&cfg).await?;
            let embedder: Arc<dyn embedding::Embedder> =
                Arc::from(embedding::create_embedder(&cfg.embedding)?);

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("cancellation requested, finishing in-flight documents...");
                    ctrl_c_cancel.cancel();
                }
            });

            let summary = ingest::run_ingest(
                &cfg,
                store,
                embedder,
                entries,
                cancel,
                mode.reporter(),
            )
            .await?;

            println!("ingest summary");
            println!("  processed: {}", summary.processed.len());
            println!("  failed: {}", summary.failed.len());
            for failure in &summary.failed {
                println!(
                    "    {} ({}): {}",
                    failure.document_id, failure.phase, failure.error
                );
            }
            println!("  communities: {}", summary.communities);
            println!("  related edges: {}", summary.related_edges);
            println!(
                "  phase seconds: extract {:.1}, chunk {:.1}, embed {:.1}, entities {:.1}, insert {:.1}, relate {:.1}",
                summary.timings.extract_secs,
                summary.timings.chunk_secs,
                summary.timings.embed_secs,
                summary.timings.entities_secs,
                summary.timings.insert_secs,
                summary.timings.relate_secs,
            );
            if summary.cancelled {
                println!("  cancelled: yes");
            }
            println!("ok");
        }

        Commands::Communities { resolution } => {
            let store = open_store(&cfg).await?;
            let resolution = resolution.unwrap_or(cfg.community.resolution);
            let assignment =
                docgraph::community::run_detection(store.as_ref(), resolution).await?;
            println!("community detection (resolution {})", resolution);
            println!("  entities assigned: {}", assignment.communities.len());
            println!("  communities: {}", assignment.community_count());
            println!("  bridge nodes: {}", assignment.bridges.len());
            let mut by_coherence: Vec<_> = assignment.stats.iter().collect();
            by_coherence.sort_by(|a, b| {
                b.1.coherence
                    .partial_cmp(&a.1.coherence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for (community, stats) in by_coherence.iter().take(10) {
                println!(
                    "  community {:>4}: size {:>4}, coherence {:.3}",
                    community, stats.size, stats.coherence
                );
            }
        }

        Commands::Search {
            query,
            strategy,
            top_k,
            rerank,
            division,
            category,
        } => {
            let Some(strategy) = Strategy::parse(&strategy) else {
                anyhow::bail!(
                    "Unknown strategy: {}. Use vector, keyword, graph, hybrid, community, or nl_to_graph.",
                    strategy
                );
            };
            let store = open_store(&cfg).await?;
            let engine = build_engine(&cfg, store)?;
            let hits = engine
                .search(&SearchRequest {
                    text: query,
                    strategy,
                    top_k,
                    rerank,
                    division,
                    category,
                })
                .await?;

            if hits.is_empty() {
                println!("No results.");
                return Ok(());
            }
            for (i, hit) in hits.iter().enumerate() {
                println!("{}. [{:.3}] {}", i + 1, hit.score, hit.citation());
                if let Some(rerank_score) = hit.rerank_score {
                    println!("    rerank: {:.3}", rerank_score);
                }
                if !hit.entities.is_empty() {
                    println!("    entities: {}", hit.entities.join(", "));
                }
                let excerpt: String = hit.text.chars().take(240).collect();
                println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
                println!();
            }
        }

        Commands::Stats { schema } => {
            let store = open_store(&cfg).await?;
            stats::run_stats(store.as_ref(), schema).await?;
        }

        Commands::Export { output } => {
            let store = open_store(&cfg).await?;
            export::run_export(store.as_ref(), output.as_deref()).await?;
        }

        Commands::Import { input } => {
            let store = open_store(&cfg).await?;
            export::run_import(store.as_ref(), &input).await?;
        }

        Commands::Evaluate {
            cases,
            only,
            resolution_sweep,
            report,
        } => {
            let cases = eval::load_cases(&cases)?;
            let store = open_store(&cfg).await?;
            let engine = build_engine(&cfg, store)?;
            let configs: Vec<EvalConfig> = match only.as_deref() {
                Some("vector") => vec![EvalConfig::vector_baseline()],
                Some("hybrid+rerank") => vec![EvalConfig::hybrid_rerank()],
                Some(other) => anyhow::bail!("unknown configuration: {}", other),
                None => vec![EvalConfig::vector_baseline(), EvalConfig::hybrid_rerank()],
            };
            let reports = eval::run_eval(&engine, cases, &configs).await?;

            for r in &reports {
                println!(
                    "{}: {}/{} hits ({:.1}%), mean {:.0} ms, p95 {:.0} ms",
                    r.name,
                    r.hits,
                    r.total,
                    r.hit_rate * 100.0,
                    r.mean_latency_ms,
                    r.p95_latency_ms
                );
            }

            if resolution_sweep {
                let sweep_store = engine.store();
                let sweep = eval::run_resolution_sweep(
                    sweep_store.as_ref(),
                    &eval::SWEEP_RESOLUTIONS,
                    cfg.community.resolution,
                )
                .await?;
                for r in &sweep {
                    println!(
                        "resolution {:.1}: {} communities, {} bridge nodes, mean coherence {:.3}",
                        r.resolution, r.communities, r.bridge_nodes, r.mean_coherence
                    );
                }
            }

            if let Some(path) = report {
                std::fs::write(&path, serde_json::to_string_pretty(&reports)?)?;
                eprintln!("wrote report to {}", path.display());
            }
        }

        Commands::Serve => {
            let store = open_store(&cfg).await?;
            let engine = Arc::new(build_engine(&cfg, store)?);
            docgraph::server::run_server(engine, &cfg.server.bind).await?;
        }
    }

    Ok(())
}
