//! # docgraph
//!
//! **A hybrid retrieval engine over a property-graph knowledge base built
//! from PDF corpora.**
//!
//! Users pose natural-language questions; the engine returns ranked
//! passages with source citations (document, page, chunk id). PDFs flow
//! through a phased ingestion pipeline into a typed graph of Documents,
//! Chunks, and Entities with dense embeddings; a community-detection pass
//! adds graph structure; a multi-strategy query engine retrieves, fuses,
//! and reranks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────┐
//! │ PDF      │──▶│ Swarm pipeline │──▶│ Graph     │
//! │ inventory│   │ extract→chunk  │   │ store     │
//! └──────────┘   │ →embed→entity  │   │ (SQLite)  │
//!                │ →insert→relate │   └─────┬─────┘
//!                └───────────────┘         │
//!                          ┌───────────────┤
//!                          ▼               ▼
//!                    ┌──────────┐    ┌──────────┐
//!                    │   CLI    │    │   HTTP   │
//!                    │   (dg)   │    │ (axum)   │
//!                    └──────────┘    └──────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. The **ingestion orchestrator** ([`ingest`]) runs six phases per
//!    batch: extract, chunk+classify, embed, entity extraction, graph
//!    insert, and a global relationship+community pass.
//! 2. The **extractor** ([`extract`]) tries multiple PDF backends with
//!    per-page time budgets.
//! 3. The **chunker** ([`chunker`]) windows page text and tags each chunk
//!    with density, type, flags, and keywords.
//! 4. The **community detector** ([`community`]) runs Louvain over entity
//!    co-occurrence and labels bridge nodes.
//! 5. The **query engine** ([`query`]) dispatches vector, keyword, graph,
//!    hybrid, community, and NL-template strategies, then applies
//!    [`fusion`] (cross-encoder rerank + boosts + weighted fusion).
//! 6. The **harness** ([`eval`]) measures top-3 document-match accuracy
//!    over a labeled question set.
//!
//! ## Strategies
//!
//! | Strategy | Engine | Requires embeddings |
//! |----------|--------|---------------------|
//! | `vector` | Cosine over chunk embeddings | Yes |
//! | `keyword` | Substring overlap scoring | No |
//! | `graph` | Entity-mention expansion | No |
//! | `hybrid` | 0.7·cosine + 0.3·keyword with admission rule | Yes |
//! | `community` | Community-filtered vector + bridge top-up | Yes |
//! | `nl_to_graph` | Ordered regex templates over the graph | No |

pub mod chunker;
pub mod community;
pub mod config;
pub mod embedding;
pub mod entity;
pub mod error;
pub mod eval;
pub mod export;
pub mod extract;
pub mod fusion;
pub mod hierarchy;
pub mod ingest;
pub mod model;
pub mod progress;
pub mod query;
pub mod rerank;
pub mod server;
pub mod stats;
pub mod store;
