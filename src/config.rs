//! Configuration parsing and validation.
//!
//! The engine is configured via a TOML file (default: `config/dg.toml`).
//! The config defines the store backend, chunking parameters, embedding and
//! reranker providers, fusion weights, community-detection tuning, the
//! hierarchy taxonomy, the product abbreviation table, and the server bind
//! address.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub community: CommunityConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub hierarchy: HierarchyConfig,
    /// Product abbreviation → canonical name, applied by entity extraction,
    /// NL templates, and the metadata boost.
    #[serde(default = "default_products")]
    pub products: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// "sqlite" or "memory".
    #[serde(default = "default_backend")]
    pub backend: String,
    pub path: PathBuf,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_tokens")]
    pub target_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: default_target_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_target_tokens() -> usize {
    512
}
fn default_overlap_tokens() -> usize {
    128
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// "disabled", "openai", "ollama", "local", or "hashed".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Embedding dimension D, uniform across the corpus.
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// "disabled", "http", or "local".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Score-fusion weights. Must sum to 1.0.
#[derive(Debug, Deserialize, Clone)]
pub struct FusionConfig {
    #[serde(default = "default_w_rerank")]
    pub w_rerank: f64,
    #[serde(default = "default_w_base")]
    pub w_base: f64,
    #[serde(default = "default_w_keyword")]
    pub w_keyword: f64,
    #[serde(default = "default_w_metadata")]
    pub w_metadata: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            w_rerank: default_w_rerank(),
            w_base: default_w_base(),
            w_keyword: default_w_keyword(),
            w_metadata: default_w_metadata(),
        }
    }
}

fn default_w_rerank() -> f64 {
    0.4
}
fn default_w_base() -> f64 {
    0.25
}
fn default_w_keyword() -> f64 {
    0.15
}
fn default_w_metadata() -> f64 {
    0.20
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Hybrid strategy weights over cosine and normalized keyword overlap.
    #[serde(default = "default_w_vector")]
    pub w_vector: f64,
    #[serde(default = "default_w_kw")]
    pub w_keyword: f64,
    /// Overall per-request deadline in seconds.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            w_vector: default_w_vector(),
            w_keyword: default_w_kw(),
            deadline_secs: default_deadline_secs(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_w_vector() -> f64 {
    0.7
}
fn default_w_kw() -> f64 {
    0.3
}
fn default_deadline_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommunityConfig {
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// RELATED_TO edges are materialized only above this co-occurrence count.
    #[serde(default = "default_min_strength")]
    pub min_strength: u32,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            min_strength: default_min_strength(),
        }
    }
}

fn default_resolution() -> f64 {
    1.0
}
fn default_min_strength() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Worker pool size for CPU-bound phases (extract, chunk, entities).
    /// 0 means "number of cores".
    #[serde(default)]
    pub cpu_workers: usize,
    /// Concurrent graph-insert tasks (the store's write concurrency).
    #[serde(default = "default_write_workers")]
    pub write_workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Hard budget per extracted page, in seconds.
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            cpu_workers: 0,
            write_workers: default_write_workers(),
            max_retries: default_max_retries(),
            page_timeout_secs: default_page_timeout_secs(),
        }
    }
}

impl IngestConfig {
    pub fn effective_cpu_workers(&self) -> usize {
        if self.cpu_workers > 0 {
            self.cpu_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

fn default_write_workers() -> usize {
    4
}
fn default_page_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Institution → Division → Category → Products taxonomy, scored by
/// keyword hits at classification time.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HierarchyConfig {
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default)]
    pub divisions: Vec<DivisionConfig>,
    /// How many leading characters of document text the classifier reads.
    #[serde(default = "default_classify_chars")]
    pub classify_chars: usize,
    /// Minimum keyword-hit score before hierarchy fields are assigned.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: u32,
}

fn default_classify_chars() -> usize {
    5000
}
fn default_min_confidence() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct DivisionConfig {
    pub code: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,
}

fn default_products() -> BTreeMap<String, String> {
    [
        ("fca", "foreign currency account"),
        ("fx", "foreign exchange"),
        ("fxo", "foreign exchange option"),
        ("irs", "interest rate swap"),
        ("td", "term deposit"),
        ("wibtd", "wib term deposit"),
        ("dci", "dual currency investment"),
        ("cs", "callable swap"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.store.backend.as_str() {
        "sqlite" | "memory" => {}
        other => anyhow::bail!("Unknown store backend: '{}'. Use sqlite or memory.", other),
    }

    if config.chunking.target_tokens == 0 {
        anyhow::bail!("chunking.target_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.target_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.target_tokens");
    }

    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" | "hashed" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hashed.",
            other
        ),
    }
    match config.rerank.provider.as_str() {
        "disabled" | "http" | "local" => {}
        other => anyhow::bail!(
            "Unknown rerank provider: '{}'. Must be disabled, http, or local.",
            other
        ),
    }
    if config.rerank.provider == "http" && config.rerank.url.is_none() {
        anyhow::bail!("rerank.url must be set when provider is 'http'");
    }

    let w = &config.fusion;
    let sum = w.w_rerank + w.w_base + w.w_keyword + w.w_metadata;
    if (sum - 1.0).abs() > 1e-9 {
        anyhow::bail!("fusion weights must sum to 1.0 (got {})", sum);
    }

    let r = &config.retrieval;
    if r.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&r.w_vector) || !(0.0..=1.0).contains(&r.w_keyword) {
        anyhow::bail!("retrieval weights must be in [0.0, 1.0]");
    }

    if config.community.resolution <= 0.0 {
        anyhow::bail!("community.resolution must be > 0");
    }

    Ok(())
}
