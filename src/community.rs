//! Community detection over the entity co-occurrence graph.
//!
//! Runs Louvain modularity maximization on the weighted RELATED_TO
//! subgraph at a configurable resolution, then derives per-entity
//! enrichment (degree centrality within the community, bridge-node flag)
//! and per-community coherence statistics. Entities with no RELATED_TO
//! edges fall into singleton communities so that every entity ends up
//! assigned.
//!
//! Detection is deterministic: nodes are visited in sorted entity-id
//! order and modularity-gain ties break toward the smallest community, so
//! the same inputs reproduce the same partition up to relabeling. Writes
//! are idempotent — re-running overwrites prior assignments.
//!
//! The whole pass is single-threaded by design; it is a graph-global
//! computation and runs as the final ingestion phase.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;

use crate::model::Entity;
use crate::store::{GraphStore, RelatedEdge, StoreResult};

/// Per-community statistics reported (not written back).
#[derive(Debug, Clone, serde::Serialize)]
pub struct CommunityStats {
    pub size: usize,
    /// Intra-community edge weight over total incident edge weight.
    pub coherence: f64,
}

/// Full output of one detection run.
#[derive(Debug, Clone)]
pub struct CommunityAssignment {
    /// entity id → community id, densely labeled from 0.
    pub communities: BTreeMap<String, i64>,
    /// entity id → degree centrality within its community, in [0,1].
    pub centrality: BTreeMap<String, f64>,
    pub bridges: BTreeSet<String>,
    pub stats: BTreeMap<i64, CommunityStats>,
}

impl CommunityAssignment {
    pub fn community_count(&self) -> usize {
        self.stats.len()
    }
}

/// Runs detection over the store's RELATED_TO edges and writes the
/// enrichment back onto entities. Returns the assignment for reporting.
pub async fn run_detection(
    store: &dyn GraphStore,
    resolution: f64,
) -> StoreResult<CommunityAssignment> {
    let entities = store.all_entities().await?;
    let edges = store.related_edges().await?;
    tracing::info!(
        entities = entities.len(),
        edges = edges.len(),
        resolution,
        "running community detection"
    );
    let assignment = detect_communities(&entities, &edges, resolution);
    for (entity_id, community) in &assignment.communities {
        let centrality = assignment.centrality.get(entity_id).copied().unwrap_or(0.0);
        let is_bridge = assignment.bridges.contains(entity_id);
        store
            .set_entity_community(entity_id, *community, centrality, is_bridge)
            .await?;
    }
    tracing::info!(
        communities = assignment.community_count(),
        bridges = assignment.bridges.len(),
        "community detection complete"
    );
    Ok(assignment)
}

/// Pure detection over an explicit entity and edge list.
pub fn detect_communities(
    entities: &[Entity],
    edges: &[RelatedEdge],
    resolution: f64,
) -> CommunityAssignment {
    // Sorted node order for determinism.
    let mut ids: Vec<&str> = entities.iter().map(|e| e.id.as_str()).collect();
    ids.sort_unstable();
    let index_of: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut graph: UnGraph<(), f64> = UnGraph::default();
    let nodes: Vec<NodeIndex> = ids.iter().map(|_| graph.add_node(())).collect();
    for edge in edges {
        let (Some(&a), Some(&b)) = (index_of.get(edge.a.as_str()), index_of.get(edge.b.as_str()))
        else {
            continue;
        };
        if a != b {
            graph.add_edge(nodes[a], nodes[b], f64::from(edge.strength));
        }
    }

    let adjacency: Vec<Vec<(usize, f64)>> = (0..ids.len())
        .map(|i| {
            let mut neighbors: Vec<(usize, f64)> = graph
                .edges(nodes[i])
                .map(|e| {
                    let other = if e.source() == nodes[i] {
                        e.target()
                    } else {
                        e.source()
                    };
                    (other.index(), *e.weight())
                })
                .collect();
            neighbors.sort_by_key(|(j, _)| *j);
            neighbors
        })
        .collect();

    let partition = louvain(&adjacency, resolution);

    // Relabel communities densely, ordered by their smallest member index
    // so labels are stable for identical inputs.
    let mut first_member: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (node, community) in partition.iter().enumerate() {
        first_member.entry(*community).or_default().push(node);
    }
    let mut ordered: Vec<(usize, Vec<usize>)> = first_member.into_iter().collect();
    ordered.sort_by_key(|(_, members)| members[0]);

    let mut communities: BTreeMap<String, i64> = BTreeMap::new();
    let mut label_of_node: Vec<i64> = vec![0; ids.len()];
    for (label, (_, members)) in ordered.iter().enumerate() {
        for &node in members {
            communities.insert(ids[node].to_string(), label as i64);
            label_of_node[node] = label as i64;
        }
    }

    let (centrality, bridges, stats) =
        enrich(&ids, &adjacency, &label_of_node, &communities);

    CommunityAssignment {
        communities,
        centrality,
        bridges,
        stats,
    }
}

/// Standard two-phase Louvain: local moves until no gain, then graph
/// aggregation, repeated until the partition stops changing.
fn louvain(adjacency: &[Vec<(usize, f64)>], resolution: f64) -> Vec<usize> {
    let n = adjacency.len();
    // node → community in the original graph.
    let mut node_to_community: Vec<usize> = (0..n).collect();

    // Current coarse graph, initially the input.
    let mut coarse: Vec<Vec<(usize, f64)>> = adjacency.to_vec();
    // original node → coarse node.
    let mut assignment: Vec<usize> = (0..n).collect();

    loop {
        let local = one_level(&coarse, resolution);
        let improved = {
            let mut distinct: Vec<usize> = local.clone();
            distinct.sort_unstable();
            distinct.dedup();
            distinct.len() < coarse.len()
        };

        // Map original nodes through this level.
        for original in 0..n {
            node_to_community[original] = local[assignment[original]];
        }

        if !improved {
            break;
        }

        // Aggregate: one coarse node per community. Intra-community weight
        // becomes a self-loop (stored once, pre-doubled) so modularity at
        // the next level still sees it in degrees and community totals.
        let mut relabel: HashMap<usize, usize> = HashMap::new();
        for &c in &local {
            let next = relabel.len();
            relabel.entry(c).or_insert(next);
        }
        let coarse_n = relabel.len();
        let mut weights: HashMap<(usize, usize), f64> = HashMap::new();
        let mut self_weights: HashMap<usize, f64> = HashMap::new();
        for (u, neighbors) in coarse.iter().enumerate() {
            let cu = relabel[&local[u]];
            for &(v, w) in neighbors {
                if v == u {
                    // A prior-level self-loop, already doubled.
                    *self_weights.entry(cu).or_insert(0.0) += w;
                } else if u < v {
                    let cv = relabel[&local[v]];
                    if cu == cv {
                        *self_weights.entry(cu).or_insert(0.0) += 2.0 * w;
                    } else {
                        let key = if cu < cv { (cu, cv) } else { (cv, cu) };
                        *weights.entry(key).or_insert(0.0) += w;
                    }
                }
            }
        }
        let mut next_coarse: Vec<Vec<(usize, f64)>> = vec![Vec::new(); coarse_n];
        let mut sorted_edges: Vec<((usize, usize), f64)> = weights.into_iter().collect();
        sorted_edges.sort_by_key(|(k, _)| *k);
        for ((a, b), w) in sorted_edges {
            next_coarse[a].push((b, w));
            next_coarse[b].push((a, w));
        }
        let mut sorted_loops: Vec<(usize, f64)> = self_weights.into_iter().collect();
        sorted_loops.sort_by_key(|(c, _)| *c);
        for (c, w) in sorted_loops {
            next_coarse[c].push((c, w));
        }
        for original in 0..n {
            assignment[original] = relabel[&local[assignment[original]]];
        }
        coarse = next_coarse;
    }

    node_to_community
}

/// One Louvain level: greedy local moves until a full pass makes none.
fn one_level(adjacency: &[Vec<(usize, f64)>], resolution: f64) -> Vec<usize> {
    let n = adjacency.len();
    let mut community: Vec<usize> = (0..n).collect();
    let degree: Vec<f64> = adjacency
        .iter()
        .map(|neighbors| neighbors.iter().map(|(_, w)| w).sum())
        .collect();
    let total_weight: f64 = degree.iter().sum::<f64>() / 2.0;
    if total_weight <= 0.0 {
        return community;
    }
    let mut community_total: Vec<f64> = degree.clone();

    loop {
        let mut moved = false;
        for node in 0..n {
            let current = community[node];
            community_total[current] -= degree[node];

            // Weight from this node into each neighboring community.
            let mut weight_to: BTreeMap<usize, f64> = BTreeMap::new();
            for &(neighbor, w) in &adjacency[node] {
                if neighbor != node {
                    *weight_to.entry(community[neighbor]).or_insert(0.0) += w;
                }
            }
            weight_to.entry(current).or_insert(0.0);

            let mut best_community = current;
            let mut best_gain = f64::NEG_INFINITY;
            for (&candidate, &k_in) in &weight_to {
                let gain =
                    k_in - resolution * community_total[candidate] * degree[node] / (2.0 * total_weight);
                // BTreeMap iteration is ascending, so strict improvement
                // keeps the smallest community on ties.
                if gain > best_gain + 1e-12 {
                    best_gain = gain;
                    best_community = candidate;
                }
            }

            community_total[best_community] += degree[node];
            if best_community != current {
                community[node] = best_community;
                moved = true;
            }
        }
        if !moved {
            break;
        }
    }
    community
}

type Enrichment = (
    BTreeMap<String, f64>,
    BTreeSet<String>,
    BTreeMap<i64, CommunityStats>,
);

fn enrich(
    ids: &[&str],
    adjacency: &[Vec<(usize, f64)>],
    label_of_node: &[i64],
    communities: &BTreeMap<String, i64>,
) -> Enrichment {
    let n = ids.len();
    let mut intra: Vec<f64> = vec![0.0; n];
    let mut cross: Vec<f64> = vec![0.0; n];
    let mut neighbor_communities: Vec<BTreeSet<i64>> = vec![BTreeSet::new(); n];

    for node in 0..n {
        for &(neighbor, w) in &adjacency[node] {
            neighbor_communities[node].insert(label_of_node[neighbor]);
            if label_of_node[neighbor] == label_of_node[node] {
                intra[node] += w;
            } else {
                cross[node] += w;
            }
        }
    }

    // Normalize intra sums by the community maximum.
    let mut max_intra: HashMap<i64, f64> = HashMap::new();
    for node in 0..n {
        let entry = max_intra.entry(label_of_node[node]).or_insert(0.0);
        if intra[node] > *entry {
            *entry = intra[node];
        }
    }
    let mut centrality = BTreeMap::new();
    for node in 0..n {
        let max = max_intra.get(&label_of_node[node]).copied().unwrap_or(0.0);
        let value = if max > 0.0 { intra[node] / max } else { 0.0 };
        centrality.insert(ids[node].to_string(), value);
    }

    // Bridge criterion: edges into ≥ 2 distinct communities AND
    // cross-community weight at or above the median over entities that
    // have any cross edges.
    let mut cross_weights: Vec<f64> = cross.iter().copied().filter(|w| *w > 0.0).collect();
    cross_weights.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median_cross = if cross_weights.is_empty() {
        f64::INFINITY
    } else {
        cross_weights[cross_weights.len() / 2]
    };
    let mut bridges = BTreeSet::new();
    for node in 0..n {
        if neighbor_communities[node].len() >= 2 && cross[node] >= median_cross {
            bridges.insert(ids[node].to_string());
        }
    }

    // Coherence: intra / total incident weight, summed per community.
    let mut sum_intra: HashMap<i64, f64> = HashMap::new();
    let mut sum_total: HashMap<i64, f64> = HashMap::new();
    let mut size: HashMap<i64, usize> = HashMap::new();
    for node in 0..n {
        let label = label_of_node[node];
        *sum_intra.entry(label).or_insert(0.0) += intra[node];
        *sum_total.entry(label).or_insert(0.0) += intra[node] + cross[node];
        *size.entry(label).or_insert(0) += 1;
    }
    let mut stats = BTreeMap::new();
    for label in communities.values() {
        if stats.contains_key(label) {
            continue;
        }
        let total = sum_total.get(label).copied().unwrap_or(0.0);
        let coherence = if total > 0.0 {
            sum_intra.get(label).copied().unwrap_or(0.0) / total
        } else {
            0.0
        };
        stats.insert(
            *label,
            CommunityStats {
                size: size.get(label).copied().unwrap_or(0),
                coherence,
            },
        );
    }

    (centrality, bridges, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;

    fn entity(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            text: id.to_string(),
            entity_type: EntityType::Term,
            occurrence_count: 1,
            community_id: None,
            degree_centrality: None,
            is_bridge_node: false,
        }
    }

    fn edge(a: &str, b: &str, strength: u32) -> RelatedEdge {
        RelatedEdge {
            a: a.to_string(),
            b: b.to_string(),
            strength,
        }
    }

    /// Two dense triangles joined by a single weak edge through `c`/`d`.
    fn two_cliques() -> (Vec<Entity>, Vec<RelatedEdge>) {
        let entities = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|id| entity(id))
            .collect();
        let edges = vec![
            edge("a", "b", 5),
            edge("b", "c", 5),
            edge("a", "c", 5),
            edge("d", "e", 5),
            edge("e", "f", 5),
            edge("d", "f", 5),
            edge("c", "d", 1),
        ];
        (entities, edges)
    }

    #[test]
    fn separates_two_cliques() {
        let (entities, edges) = two_cliques();
        let got = detect_communities(&entities, &edges, 1.0);
        let ca = got.communities["a"];
        assert_eq!(got.communities["b"], ca);
        assert_eq!(got.communities["c"], ca);
        let cd = got.communities["d"];
        assert_eq!(got.communities["e"], cd);
        assert_eq!(got.communities["f"], cd);
        assert_ne!(ca, cd);
    }

    #[test]
    fn detection_is_deterministic() {
        let (entities, edges) = two_cliques();
        let first = detect_communities(&entities, &edges, 1.0);
        let second = detect_communities(&entities, &edges, 1.0);
        assert_eq!(first.communities, second.communities);
        assert_eq!(first.bridges, second.bridges);
    }

    #[test]
    fn centrality_in_unit_range_and_maximal_for_hub() {
        let (entities, edges) = two_cliques();
        let got = detect_communities(&entities, &edges, 1.0);
        for value in got.centrality.values() {
            assert!((0.0..=1.0).contains(value));
        }
        // Within each triangle every member has equal intra weight, so all
        // normalize to 1.0 except none below.
        assert!((got.centrality["a"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn bridge_nodes_are_the_clique_connectors() {
        let (entities, edges) = two_cliques();
        let got = detect_communities(&entities, &edges, 1.0);
        // Only c and d have cross-community edges; both sit at the median.
        assert_eq!(
            got.bridges,
            ["c", "d"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[test]
    fn isolated_entities_get_singleton_communities() {
        let entities = vec![entity("a"), entity("b"), entity("lonely")];
        let edges = vec![edge("a", "b", 3)];
        let got = detect_communities(&entities, &edges, 1.0);
        assert_eq!(got.communities.len(), 3);
        let lonely = got.communities["lonely"];
        assert_ne!(lonely, got.communities["a"]);
        assert_eq!(got.centrality["lonely"], 0.0);
        assert!(!got.bridges.contains("lonely"));
    }

    #[test]
    fn coherence_is_high_for_tight_cliques() {
        let (entities, edges) = two_cliques();
        let got = detect_communities(&entities, &edges, 1.0);
        for stats in got.stats.values() {
            if stats.size == 3 {
                // 30 intra vs 1 cross incident weight per clique.
                assert!(stats.coherence > 0.9);
            }
        }
    }

    #[test]
    fn higher_resolution_never_coarsens() {
        let (entities, edges) = two_cliques();
        let low = detect_communities(&entities, &edges, 0.5);
        let high = detect_communities(&entities, &edges, 1.5);
        let count = |a: &CommunityAssignment| {
            let mut set: Vec<i64> = a.communities.values().copied().collect();
            set.sort_unstable();
            set.dedup();
            set.len()
        };
        assert!(count(&high) >= count(&low));
    }

    #[tokio::test]
    async fn run_detection_writes_back() {
        use crate::store::memory::MemoryStore;
        let store = MemoryStore::new(2);
        let e1 = store.upsert_entity("swap", EntityType::Product).await.unwrap();
        let e2 = store.upsert_entity("rate", EntityType::Term).await.unwrap();
        // Seed a related edge by linking both entities to two chunks.
        store
            .upsert_document(&crate::model::Document {
                id: "d".into(),
                filename: "d.pdf".into(),
                page_count: 1,
                processed_date: chrono::Utc::now(),
                title: None,
                category: None,
                division: None,
                doc_category: None,
                products: vec![],
            })
            .await
            .unwrap();
        let chunks: Vec<crate::model::Chunk> = (0..2)
            .map(|i| crate::model::Chunk {
                id: crate::model::Chunk::make_id("d", 1, i),
                document_id: "d".into(),
                page_num: 1,
                chunk_index: i,
                text: "swap rate".into(),
                token_count: 2,
                embedding: None,
                semantic_density: 0.5,
                chunk_type: crate::model::ChunkType::Content,
                has_definitions: false,
                has_examples: false,
                has_lists: false,
                keywords: vec!["swap".into(), "rate".into()],
                division: None,
                doc_category: None,
            })
            .collect();
        store.replace_document_chunks("d", &chunks).await.unwrap();
        for c in &chunks {
            store.link_chunk_entity(&c.id, &e1).await.unwrap();
            store.link_chunk_entity(&c.id, &e2).await.unwrap();
        }
        store.build_related_to(1).await.unwrap();

        let assignment = run_detection(&store, 1.0).await.unwrap();
        assert_eq!(assignment.communities.len(), 2);
        let entity = store.get_entity(&e1).await.unwrap().unwrap();
        assert!(entity.community_id.is_some());
        assert!(entity.degree_centrality.is_some());
    }
}
