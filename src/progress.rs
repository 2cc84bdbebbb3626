//! Ingestion progress reporting.
//!
//! Reports observable progress during `dg ingest` so users see which
//! pipeline phase each document is in and how much of the batch is left.
//! Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;

/// The six pipeline phases, in dependency order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IngestPhase {
    Extract,
    Chunk,
    Embed,
    Entities,
    Insert,
    Relate,
}

impl IngestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestPhase::Extract => "extract",
            IngestPhase::Chunk => "chunk",
            IngestPhase::Embed => "embed",
            IngestPhase::Entities => "entities",
            IngestPhase::Insert => "insert",
            IngestPhase::Relate => "relate",
        }
    }

    pub const ALL: [IngestPhase; 6] = [
        IngestPhase::Extract,
        IngestPhase::Chunk,
        IngestPhase::Embed,
        IngestPhase::Entities,
        IngestPhase::Insert,
        IngestPhase::Relate,
    ];
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// A document finished a phase; `n` of `total` documents have now
    /// finished it.
    DocumentDone {
        phase: IngestPhase,
        document: String,
        n: u64,
        total: u64,
    },
    /// A document failed permanently in a phase.
    DocumentFailed {
        phase: IngestPhase,
        document: String,
        error: String,
    },
    /// The global relate/detect phase started (no per-document totals).
    GlobalPhase { phase: IngestPhase },
}

/// Reports ingest progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly lines: `ingest extract  3 / 12  irs_pds`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::DocumentDone {
                phase,
                document,
                n,
                total,
            } => format!("ingest {}  {} / {}  {}\n", phase.as_str(), n, total, document),
            IngestProgressEvent::DocumentFailed {
                phase,
                document,
                error,
            } => format!("ingest {}  FAILED  {}: {}\n", phase.as_str(), document, error),
            IngestProgressEvent::GlobalPhase { phase } => {
                format!("ingest {}  running...\n", phase.as_str())
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::DocumentDone {
                phase,
                document,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": phase.as_str(),
                "document": document,
                "n": n,
                "total": total
            }),
            IngestProgressEvent::DocumentFailed {
                phase,
                document,
                error,
            } => serde_json::json!({
                "event": "failed",
                "phase": phase.as_str(),
                "document": document,
                "error": error
            }),
            IngestProgressEvent::GlobalPhase { phase } => serde_json::json!({
                "event": "progress",
                "phase": phase.as_str()
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_cover_pipeline_in_order() {
        let names: Vec<&str> = IngestPhase::ALL.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            vec!["extract", "chunk", "embed", "entities", "insert", "relate"]
        );
    }
}
