//! Corpus statistics and health overview.
//!
//! A quick summary of what is in the graph: document, chunk, and entity
//! counts, embedding coverage, and the community layer (total communities,
//! bridge nodes, average community size). Used by `dg stats` to confirm
//! ingestion and detection are working as expected.

use anyhow::Result;

use crate::store::GraphStore;

pub async fn run_stats(store: &dyn GraphStore, schema: bool) -> Result<()> {
    let stats = store.stats().await?;

    println!("docgraph — Knowledge Base Stats");
    println!("===============================");
    println!();
    println!("  Documents:     {}", stats.documents);
    println!("  Chunks:        {}", stats.chunks);
    println!(
        "  Embedded:      {} / {} ({}%)",
        stats.embedded_chunks,
        stats.chunks,
        if stats.chunks > 0 {
            (stats.embedded_chunks * 100) / stats.chunks
        } else {
            0
        }
    );
    println!("  Entities:      {}", stats.entities);
    println!("  Related edges: {}", stats.related_edges);
    println!();
    println!("  Communities:   {}", stats.communities);
    println!("  Bridge nodes:  {}", stats.bridge_nodes);
    println!("  Avg size:      {:.2}", stats.avg_community_size);

    if schema {
        let snapshot = store.schema_snapshot().await?;
        println!();
        println!("  Labels:     {}", snapshot.labels.join(", "));
        println!("  Edge types: {}", snapshot.edge_types.join(", "));
        for (label, properties) in &snapshot.properties {
            println!("  {}: {}", label, properties.join(", "));
        }
        if !snapshot.indexes.is_empty() {
            println!("  Indexes:    {}", snapshot.indexes.join(", "));
        }
    }

    println!();
    Ok(())
}
