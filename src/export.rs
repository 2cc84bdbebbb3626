//! Graph snapshot export and import.
//!
//! `dg export` writes the full graph — nodes and edges with typed
//! property values, embeddings as fixed-length float arrays with a
//! recorded dimension, timestamps in ISO-8601 UTC — as JSON to a file or
//! stdout. `dg import` is a straight re-import that replaces the store's
//! contents.

use std::path::Path;

use anyhow::{Context, Result};

use crate::store::GraphStore;

/// Export the store as a JSON snapshot. Writes to `output` when given,
/// else stdout (for piping).
pub async fn run_export(store: &dyn GraphStore, output: Option<&Path>) -> Result<()> {
    let snapshot = store.export_snapshot().await?;
    let json = serde_json::to_string_pretty(&snapshot)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)
                .with_context(|| format!("write snapshot to {}", path.display()))?;
            eprintln!(
                "Exported {} documents, {} chunks, {} entities to {}",
                snapshot.documents.len(),
                snapshot.chunks.len(),
                snapshot.entities.len(),
                path.display()
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Import a snapshot, replacing the store's contents.
pub async fn run_import(store: &dyn GraphStore, input: &Path) -> Result<()> {
    let content = std::fs::read_to_string(input)
        .with_context(|| format!("read snapshot {}", input.display()))?;
    let snapshot = serde_json::from_str(&content)
        .with_context(|| format!("parse snapshot {}", input.display()))?;
    store.import_snapshot(&snapshot).await?;
    let stats = store.stats().await?;
    println!(
        "Imported {} documents, {} chunks, {} entities.",
        stats.documents, stats.chunks, stats.entities
    );
    Ok(())
}
