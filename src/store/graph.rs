use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{NoemaError, NoemaResult};
use crate::model::edge::{Edge, EdgePatch, EdgeType};
use crate::model::node::{Node, NodePatch};
use crate::model::value::Criteria;

// ---------------------------------------------------------------------------
// GraphStore trait: the authoritative persistence contract
// ---------------------------------------------------------------------------

/// What happens when a node with incident edges is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadePolicy {
    /// Fail the deletion with an integrity violation.
    #[default]
    Reject,
    /// Delete the node along with every incident edge.
    Cascade,
}

/// Contract for graph storage backends. The in-memory implementation below
/// and any durable backend are interchangeable behind this trait; the engine
/// never reaches around it.
///
/// All mutations are atomic per call. Cross-entity consistency (indexes,
/// caches) is the facade's responsibility.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert a node. Fails with a duplicate-id error if already present.
    async fn put_node(&self, node: Node) -> NoemaResult<Uuid>;

    /// Get a node by ID.
    async fn get_node(&self, id: &Uuid) -> NoemaResult<Option<Node>>;

    /// Merge a patch into an existing node and return the updated snapshot.
    async fn update_node(&self, id: &Uuid, patch: &NodePatch) -> NoemaResult<Node>;

    /// Delete a node, honoring the store's cascade policy. Returns the
    /// incident edges that were removed alongside it (empty under `Reject`).
    async fn delete_node(&self, id: &Uuid) -> NoemaResult<Vec<Edge>>;

    /// Full predicate scan over nodes.
    async fn query_nodes(&self, criteria: &Criteria) -> NoemaResult<Vec<Node>>;

    /// Insert an edge. Both endpoints must already exist.
    async fn put_edge(&self, edge: Edge) -> NoemaResult<Uuid>;

    /// Get an edge by ID.
    async fn get_edge(&self, id: &Uuid) -> NoemaResult<Option<Edge>>;

    /// Merge a patch into an existing edge and return the updated snapshot.
    async fn update_edge(&self, id: &Uuid, patch: &EdgePatch) -> NoemaResult<Edge>;

    /// Delete an edge, returning the removed record.
    async fn delete_edge(&self, id: &Uuid) -> NoemaResult<Edge>;

    /// Full predicate scan over edges.
    async fn query_edges(&self, criteria: &Criteria) -> NoemaResult<Vec<Edge>>;

    /// Composite lookup by any combination of source, target, and edge types.
    async fn find_edges(
        &self,
        source_id: Option<&Uuid>,
        target_id: Option<&Uuid>,
        edge_types: Option<&[EdgeType]>,
    ) -> NoemaResult<Vec<Edge>>;

    /// All nodes, in an implementation-defined order that is stable within a
    /// single snapshot.
    async fn scan_nodes(&self) -> NoemaResult<Vec<Node>>;

    /// All edges, ordered like `scan_nodes`.
    async fn scan_edges(&self) -> NoemaResult<Vec<Edge>>;

    /// Restore a node snapshot verbatim (insert-or-overwrite, metadata
    /// untouched). Used by the facade to revert a mutation whose follow-up
    /// index write failed.
    async fn restore_node(&self, node: Node) -> NoemaResult<()>;

    /// Restore an edge snapshot verbatim. See [`GraphStore::restore_node`].
    async fn restore_edge(&self, edge: Edge) -> NoemaResult<()>;

    /// Total number of nodes.
    async fn node_count(&self) -> usize;

    /// Total number of edges.
    async fn edge_count(&self) -> usize;
}

// ---------------------------------------------------------------------------
// InMemoryGraphStore: reference backend with adjacency lists
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GraphState {
    nodes: HashMap<Uuid, Node>,
    edges: HashMap<Uuid, Edge>,
    outbound: HashMap<Uuid, Vec<Uuid>>,
    inbound: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory graph store. One reader-writer lock guards the whole state, so
/// every mutation is atomic and readers always observe a consistent
/// snapshot.
pub struct InMemoryGraphStore {
    state: RwLock<GraphState>,
    cascade_policy: CascadePolicy,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::with_cascade_policy(CascadePolicy::Reject)
    }

    pub fn with_cascade_policy(cascade_policy: CascadePolicy) -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
            cascade_policy,
        }
    }

    pub fn cascade_policy(&self) -> CascadePolicy {
        self.cascade_policy
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn put_node(&self, node: Node) -> NoemaResult<Uuid> {
        let mut state = self.state.write().await;
        let id = node.id;
        if state.nodes.contains_key(&id) {
            return Err(NoemaError::AlreadyExists(id));
        }
        state.nodes.insert(id, node);
        state.outbound.entry(id).or_default();
        state.inbound.entry(id).or_default();
        Ok(id)
    }

    async fn get_node(&self, id: &Uuid) -> NoemaResult<Option<Node>> {
        let state = self.state.read().await;
        Ok(state.nodes.get(id).cloned())
    }

    async fn update_node(&self, id: &Uuid, patch: &NodePatch) -> NoemaResult<Node> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(id)
            .ok_or(NoemaError::NodeNotFound(*id))?;
        node.apply(patch);
        Ok(node.clone())
    }

    async fn delete_node(&self, id: &Uuid) -> NoemaResult<Vec<Edge>> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(id) {
            return Err(NoemaError::NodeNotFound(*id));
        }

        let mut incident: Vec<Uuid> = state.outbound.get(id).cloned().unwrap_or_default();
        incident.extend(state.inbound.get(id).cloned().unwrap_or_default());
        incident.sort_unstable();
        incident.dedup();

        if !incident.is_empty() && self.cascade_policy == CascadePolicy::Reject {
            return Err(NoemaError::IntegrityViolation(format!(
                "entity in use: node {} has {} incident edge(s)",
                id,
                incident.len()
            )));
        }

        let mut removed = Vec::with_capacity(incident.len());
        for edge_id in incident {
            if let Some(edge) = state.edges.remove(&edge_id) {
                detach(&mut state, &edge);
                removed.push(edge);
            }
        }

        state.outbound.remove(id);
        state.inbound.remove(id);
        state.nodes.remove(id);
        Ok(removed)
    }

    async fn query_nodes(&self, criteria: &Criteria) -> NoemaResult<Vec<Node>> {
        let state = self.state.read().await;
        let mut matched: Vec<Node> = state
            .nodes
            .values()
            .filter(|node| criteria.matches(*node))
            .cloned()
            .collect();
        sort_nodes(&mut matched);
        Ok(matched)
    }

    async fn put_edge(&self, edge: Edge) -> NoemaResult<Uuid> {
        let mut state = self.state.write().await;
        if state.edges.contains_key(&edge.id) {
            return Err(NoemaError::AlreadyExists(edge.id));
        }
        if !state.nodes.contains_key(&edge.source_id) {
            return Err(NoemaError::NodeNotFound(edge.source_id));
        }
        if !state.nodes.contains_key(&edge.target_id) {
            return Err(NoemaError::NodeNotFound(edge.target_id));
        }

        let id = edge.id;
        state.outbound.entry(edge.source_id).or_default().push(id);
        state.inbound.entry(edge.target_id).or_default().push(id);
        state.edges.insert(id, edge);
        Ok(id)
    }

    async fn get_edge(&self, id: &Uuid) -> NoemaResult<Option<Edge>> {
        let state = self.state.read().await;
        Ok(state.edges.get(id).cloned())
    }

    async fn update_edge(&self, id: &Uuid, patch: &EdgePatch) -> NoemaResult<Edge> {
        let mut state = self.state.write().await;
        let edge = state
            .edges
            .get_mut(id)
            .ok_or(NoemaError::EdgeNotFound(*id))?;
        edge.apply(patch);
        Ok(edge.clone())
    }

    async fn delete_edge(&self, id: &Uuid) -> NoemaResult<Edge> {
        let mut state = self.state.write().await;
        let edge = state
            .edges
            .remove(id)
            .ok_or(NoemaError::EdgeNotFound(*id))?;
        detach(&mut state, &edge);
        Ok(edge)
    }

    async fn query_edges(&self, criteria: &Criteria) -> NoemaResult<Vec<Edge>> {
        let state = self.state.read().await;
        let mut matched: Vec<Edge> = state
            .edges
            .values()
            .filter(|edge| criteria.matches(*edge))
            .cloned()
            .collect();
        sort_edges(&mut matched);
        Ok(matched)
    }

    async fn find_edges(
        &self,
        source_id: Option<&Uuid>,
        target_id: Option<&Uuid>,
        edge_types: Option<&[EdgeType]>,
    ) -> NoemaResult<Vec<Edge>> {
        let state = self.state.read().await;

        // Use an adjacency list when an endpoint pins the candidate set.
        let candidates: Vec<Uuid> = match (source_id, target_id) {
            (Some(source), _) => state.outbound.get(source).cloned().unwrap_or_default(),
            (None, Some(target)) => state.inbound.get(target).cloned().unwrap_or_default(),
            (None, None) => state.edges.keys().copied().collect(),
        };

        let mut matched: Vec<Edge> = candidates
            .iter()
            .filter_map(|edge_id| state.edges.get(edge_id))
            .filter(|edge| {
                source_id.is_none_or(|s| &edge.source_id == s)
                    && target_id.is_none_or(|t| &edge.target_id == t)
                    && edge_types.is_none_or(|types| types.contains(&edge.edge_type))
            })
            .cloned()
            .collect();
        sort_edges(&mut matched);
        Ok(matched)
    }

    async fn scan_nodes(&self) -> NoemaResult<Vec<Node>> {
        let state = self.state.read().await;
        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        sort_nodes(&mut nodes);
        Ok(nodes)
    }

    async fn scan_edges(&self) -> NoemaResult<Vec<Edge>> {
        let state = self.state.read().await;
        let mut edges: Vec<Edge> = state.edges.values().cloned().collect();
        sort_edges(&mut edges);
        Ok(edges)
    }

    async fn restore_node(&self, node: Node) -> NoemaResult<()> {
        let mut state = self.state.write().await;
        let id = node.id;
        state.nodes.insert(id, node);
        state.outbound.entry(id).or_default();
        state.inbound.entry(id).or_default();
        Ok(())
    }

    async fn restore_edge(&self, edge: Edge) -> NoemaResult<()> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(&edge.source_id) {
            return Err(NoemaError::NodeNotFound(edge.source_id));
        }
        if !state.nodes.contains_key(&edge.target_id) {
            return Err(NoemaError::NodeNotFound(edge.target_id));
        }
        let id = edge.id;
        if !state.edges.contains_key(&id) {
            state.outbound.entry(edge.source_id).or_default().push(id);
            state.inbound.entry(edge.target_id).or_default().push(id);
        }
        state.edges.insert(id, edge);
        Ok(())
    }

    async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    async fn edge_count(&self) -> usize {
        self.state.read().await.edges.len()
    }
}

fn detach(state: &mut GraphState, edge: &Edge) {
    if let Some(list) = state.outbound.get_mut(&edge.source_id) {
        list.retain(|e| e != &edge.id);
    }
    if let Some(list) = state.inbound.get_mut(&edge.target_id) {
        list.retain(|e| e != &edge.id);
    }
}

// Scan ordering: creation time, then id. Deterministic within a snapshot.
fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        a.metadata
            .created_at
            .cmp(&b.metadata.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn sort_edges(edges: &mut [Edge]) {
    edges.sort_by(|a, b| {
        a.metadata
            .created_at
            .cmp(&b.metadata.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
