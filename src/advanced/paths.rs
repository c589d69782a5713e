use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::advanced::{AdvancedQueryEngine, OpCtx};
use crate::error::{NoemaError, NoemaResult};
use crate::model::edge::{Edge, EdgeType};
use crate::model::node::Node;
use crate::query::QueryOptions;

// ---------------------------------------------------------------------------
// Path finding: all simple paths between two nodes, uni- or bidirectional
// ---------------------------------------------------------------------------

/// Options for `find_paths`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathOptions {
    /// Maximum path length in edges; defaults to the configured limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Meet-in-the-middle search; defaults to on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bidirectional: Option<bool>,
    /// Restrict which edge kinds may be walked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_types: Option<Vec<EdgeType>>,
    /// Maximum number of paths returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// A concrete path: hydrated nodes in order plus the edges connecting them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPath {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphPath {
    /// Path length in edges.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn node_ids(&self) -> Vec<Uuid> {
        self.nodes.iter().map(|n| n.id).collect()
    }
}

/// A path under construction: node ids in order and the edges walked.
#[derive(Debug, Clone)]
struct PartialPath {
    nodes: Vec<Uuid>,
    edges: Vec<Uuid>,
}

impl PartialPath {
    fn seed(id: Uuid) -> Self {
        Self {
            nodes: vec![id],
            edges: Vec::new(),
        }
    }

    fn last(&self) -> Uuid {
        *self.nodes.last().expect("paths are never empty")
    }

    fn extended(&self, edge_id: Uuid, node_id: Uuid) -> Self {
        let mut next = self.clone();
        next.edges.push(edge_id);
        next.nodes.push(node_id);
        next
    }

    fn visits(&self, id: &Uuid) -> bool {
        self.nodes.contains(id)
    }
}

impl AdvancedQueryEngine {
    /// All simple paths from `start` to `end` of length at most
    /// `max_length`, shortest first. The bidirectional strategy returns the
    /// same set of paths as the unidirectional one.
    pub async fn find_paths(
        &self,
        start: &Uuid,
        end: &Uuid,
        options: &PathOptions,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<GraphPath>> {
        let ctx = self.op_ctx(opts);
        let max_length = options
            .max_length
            .unwrap_or(self.config.max_path_length)
            .min(self.config.max_path_length);
        let limit = self.result_cap(options.limit);

        if self.store.get_node(start).await?.is_none() {
            return Err(NoemaError::NodeNotFound(*start));
        }
        if self.store.get_node(end).await?.is_none() {
            return Err(NoemaError::NodeNotFound(*end));
        }
        if max_length == 0 {
            return Ok(Vec::new());
        }

        let edge_types = options.edge_types.as_deref();
        let mut found = if options.bidirectional.unwrap_or(true) {
            self.paths_bidirectional(start, end, edge_types, max_length, &ctx)
                .await?
        } else {
            self.paths_unidirectional(start, end, edge_types, max_length, &ctx)
                .await?
        };

        // Shortest first, then lexicographic on the node sequence, so both
        // strategies order identically.
        found.sort_by(|a, b| a.edges.len().cmp(&b.edges.len()).then_with(|| a.nodes.cmp(&b.nodes)));
        found.truncate(limit);

        self.hydrate_paths(found).await
    }

    /// Breadth-first enumeration of simple paths.
    async fn paths_unidirectional(
        &self,
        start: &Uuid,
        end: &Uuid,
        edge_types: Option<&[EdgeType]>,
        max_length: usize,
        ctx: &OpCtx,
    ) -> NoemaResult<Vec<PartialPath>> {
        let mut found: Vec<PartialPath> = Vec::new();
        let mut queue: VecDeque<PartialPath> = VecDeque::from([PartialPath::seed(*start)]);

        while let Some(path) = queue.pop_front() {
            ctx.checkpoint()?;

            if &path.last() == end {
                found.push(path);
                continue;
            }
            if path.edges.len() == max_length {
                continue;
            }

            let current = path.last();
            let _snapshot = self.write_gate.read().await;
            let edges = self
                .store
                .find_edges(Some(&current), None, edge_types)
                .await?;
            for edge in edges {
                if path.visits(&edge.target_id) {
                    continue;
                }
                queue.push_back(path.extended(edge.id, edge.target_id));
            }
        }

        Ok(found)
    }

    /// Meet-in-the-middle enumeration. The forward side expands first and
    /// walks edges in their declared direction; the backward side walks
    /// against it. Each side expands at most ceil(max_length / 2) times, and
    /// stitched paths are normalized so nodes and edges run start to end.
    async fn paths_bidirectional(
        &self,
        start: &Uuid,
        end: &Uuid,
        edge_types: Option<&[EdgeType]>,
        max_length: usize,
        ctx: &OpCtx,
    ) -> NoemaResult<Vec<PartialPath>> {
        let half = max_length.div_ceil(2);

        // Every simple partial path keyed by its endpoint, all depths kept:
        // meetings may pair a deep forward half with a shallow backward one.
        let mut forward: Vec<PartialPath> = vec![PartialPath::seed(*start)];
        let mut backward: Vec<PartialPath> = vec![PartialPath::seed(*end)];

        let mut forward_frontier = forward.clone();
        let mut backward_frontier = backward.clone();

        for _ in 0..half {
            ctx.checkpoint()?;
            forward_frontier = self
                .extend_wave(&forward_frontier, edge_types, false, ctx)
                .await?;
            forward.extend(forward_frontier.iter().cloned());

            ctx.checkpoint()?;
            backward_frontier = self
                .extend_wave(&backward_frontier, edge_types, true, ctx)
                .await?;
            backward.extend(backward_frontier.iter().cloned());

            if forward_frontier.is_empty() && backward_frontier.is_empty() {
                break;
            }
        }

        let mut by_endpoint: HashMap<Uuid, Vec<&PartialPath>> = HashMap::new();
        for path in &backward {
            by_endpoint.entry(path.last()).or_default().push(path);
        }

        let mut seen: HashSet<Vec<Uuid>> = HashSet::new();
        let mut found: Vec<PartialPath> = Vec::new();
        for fwd in &forward {
            let Some(halves) = by_endpoint.get(&fwd.last()) else {
                continue;
            };
            for bwd in halves {
                if fwd.edges.len() + bwd.edges.len() > max_length {
                    continue;
                }
                if let Some(stitched) = stitch(fwd, bwd) {
                    if seen.insert(stitched.edges.clone()) {
                        found.push(stitched);
                    }
                }
            }
        }

        Ok(found)
    }

    async fn extend_wave(
        &self,
        wave: &[PartialPath],
        edge_types: Option<&[EdgeType]>,
        backward: bool,
        ctx: &OpCtx,
    ) -> NoemaResult<Vec<PartialPath>> {
        let _snapshot = self.write_gate.read().await;
        let mut next: Vec<PartialPath> = Vec::new();
        for path in wave {
            ctx.checkpoint()?;
            let current = path.last();
            let edges = if backward {
                self.store.find_edges(None, Some(&current), edge_types).await?
            } else {
                self.store.find_edges(Some(&current), None, edge_types).await?
            };
            for edge in edges {
                let neighbor = if backward { edge.source_id } else { edge.target_id };
                if path.visits(&neighbor) {
                    continue;
                }
                next.push(path.extended(edge.id, neighbor));
            }
        }
        Ok(next)
    }

    async fn hydrate_paths(&self, paths: Vec<PartialPath>) -> NoemaResult<Vec<GraphPath>> {
        // Bulk-fetch each record once, then assemble.
        let mut node_ids: HashSet<Uuid> = HashSet::new();
        let mut edge_ids: HashSet<Uuid> = HashSet::new();
        for path in &paths {
            node_ids.extend(&path.nodes);
            edge_ids.extend(&path.edges);
        }

        let fetched_nodes =
            try_join_all(node_ids.iter().map(|id| self.store.get_node(id))).await?;
        let nodes: HashMap<Uuid, Node> = fetched_nodes
            .into_iter()
            .flatten()
            .map(|node| (node.id, node))
            .collect();
        let fetched_edges =
            try_join_all(edge_ids.iter().map(|id| self.store.get_edge(id))).await?;
        let edges: HashMap<Uuid, Edge> = fetched_edges
            .into_iter()
            .flatten()
            .map(|edge| (edge.id, edge))
            .collect();

        // A record deleted since discovery invalidates its path; tolerate
        // the tombstone by dropping the path rather than failing the query.
        let mut out: Vec<GraphPath> = Vec::with_capacity(paths.len());
        for path in paths {
            let resolved_nodes: Option<Vec<Node>> =
                path.nodes.iter().map(|id| nodes.get(id).cloned()).collect();
            let resolved_edges: Option<Vec<Edge>> =
                path.edges.iter().map(|id| edges.get(id).cloned()).collect();
            if let (Some(nodes), Some(edges)) = (resolved_nodes, resolved_edges) {
                out.push(GraphPath { nodes, edges });
            }
        }
        Ok(out)
    }
}

/// Join a forward half ending at the meeting node with a backward half
/// ending at the same node. The backward half was walked end-to-middle, so
/// its sequence is reversed into path order; edges keep their stored
/// orientation. Halves sharing any node besides the meeting point would
/// break the simple-path invariant and are rejected.
fn stitch(forward: &PartialPath, backward: &PartialPath) -> Option<PartialPath> {
    let meeting = forward.last();
    debug_assert_eq!(meeting, backward.last());

    let forward_set: HashSet<&Uuid> = forward.nodes.iter().collect();
    for id in &backward.nodes {
        if id != &meeting && forward_set.contains(id) {
            return None;
        }
    }

    let mut nodes = forward.nodes.clone();
    nodes.extend(backward.nodes.iter().rev().skip(1));
    let mut edges = forward.edges.clone();
    edges.extend(backward.edges.iter().rev());

    Some(PartialPath { nodes, edges })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdvancedQueryConfig, IndexingConfig};
    use crate::index::IndexManager;
    use crate::model::embedding::HashEmbedder;
    use crate::model::node::NodeType;
    use crate::store::{GraphStore, InMemoryGraphStore};
    use std::sync::Arc;

    async fn engine_with_chain(n: usize) -> (AdvancedQueryEngine, Vec<Uuid>) {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut ids = Vec::new();
        for i in 0..n {
            let node = Node::new(NodeType::Concept).with_property("i", i as i64);
            ids.push(store.put_node(node).await.unwrap());
        }
        for pair in ids.windows(2) {
            store
                .put_edge(Edge::new(EdgeType::RelatedTo, pair[0], pair[1]))
                .await
                .unwrap();
        }

        let engine = AdvancedQueryEngine::new(
            store,
            Arc::new(IndexManager::new(IndexingConfig::default())),
            Arc::new(HashEmbedder::new(16)),
            AdvancedQueryConfig::default(),
        );
        (engine, ids)
    }

    #[tokio::test]
    async fn chain_has_one_path_found_by_both_strategies() {
        let (engine, ids) = engine_with_chain(5).await;
        let start = ids[0];
        let end = ids[4];

        for bidirectional in [false, true] {
            let paths = engine
                .find_paths(
                    &start,
                    &end,
                    &PathOptions {
                        bidirectional: Some(bidirectional),
                        ..PathOptions::default()
                    },
                    &QueryOptions::default(),
                )
                .await
                .unwrap();

            assert_eq!(paths.len(), 1, "bidirectional={bidirectional}");
            assert_eq!(paths[0].len(), 4);
            assert_eq!(paths[0].node_ids(), ids);
            // Edges come back in path order with their stored orientation.
            for (i, edge) in paths[0].edges.iter().enumerate() {
                assert_eq!(edge.source_id, ids[i]);
                assert_eq!(edge.target_id, ids[i + 1]);
            }
        }
    }

    #[tokio::test]
    async fn strategies_agree_on_a_diamond() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = store.put_node(Node::new(NodeType::Concept)).await.unwrap();
        let b = store.put_node(Node::new(NodeType::Concept)).await.unwrap();
        let c = store.put_node(Node::new(NodeType::Concept)).await.unwrap();
        let d = store.put_node(Node::new(NodeType::Concept)).await.unwrap();
        for (s, t) in [(a, b), (a, c), (b, d), (c, d)] {
            store
                .put_edge(Edge::new(EdgeType::RelatedTo, s, t))
                .await
                .unwrap();
        }
        let engine = AdvancedQueryEngine::new(
            store,
            Arc::new(IndexManager::new(IndexingConfig::default())),
            Arc::new(HashEmbedder::new(16)),
            AdvancedQueryConfig::default(),
        );

        let uni = engine
            .find_paths(
                &a,
                &d,
                &PathOptions {
                    bidirectional: Some(false),
                    ..PathOptions::default()
                },
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        let bi = engine
            .find_paths(
                &a,
                &d,
                &PathOptions {
                    bidirectional: Some(true),
                    ..PathOptions::default()
                },
                &QueryOptions::default(),
            )
            .await
            .unwrap();

        let uni_ids: Vec<Vec<Uuid>> = uni.iter().map(GraphPath::node_ids).collect();
        let bi_ids: Vec<Vec<Uuid>> = bi.iter().map(GraphPath::node_ids).collect();
        assert_eq!(uni_ids.len(), 2);
        assert_eq!(uni_ids, bi_ids);
    }

    #[tokio::test]
    async fn max_length_prunes_long_paths() {
        let (engine, ids) = engine_with_chain(5).await;
        let paths = engine
            .find_paths(
                &ids[0],
                &ids[4],
                &PathOptions {
                    max_length: Some(3),
                    ..PathOptions::default()
                },
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn edge_type_filter_blocks_mismatched_edges() {
        let (engine, ids) = engine_with_chain(3).await;
        let paths = engine
            .find_paths(
                &ids[0],
                &ids[2],
                &PathOptions {
                    edge_types: Some(vec![EdgeType::Causes]),
                    ..PathOptions::default()
                },
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn missing_endpoint_is_an_error() {
        let (engine, ids) = engine_with_chain(2).await;
        let err = engine
            .find_paths(
                &ids[0],
                &Uuid::new_v4(),
                &PathOptions::default(),
                &QueryOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NoemaError::NodeNotFound(_)));
    }
}
