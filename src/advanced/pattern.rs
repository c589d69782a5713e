use async_recursion::async_recursion;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::advanced::{AdvancedQueryEngine, OpCtx};
use crate::error::{NoemaError, NoemaResult};
use crate::model::edge::{Edge, EdgeType};
use crate::model::node::{Node, NodeType};
use crate::model::value::{Criteria, Predicate};
use crate::query::QueryOptions;

// ---------------------------------------------------------------------------
// Subgraph pattern matching with seed selection and backtracking
// ---------------------------------------------------------------------------

/// Constraints on one pattern node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConstraint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Criteria>,
}

impl NodeConstraint {
    /// Number of explicit constraints, used for seed selection.
    fn constraint_count(&self) -> usize {
        self.node_type.is_some() as usize
            + self.criteria.as_ref().map_or(0, Criteria::len)
    }

    fn full_criteria(&self) -> Criteria {
        let mut criteria = self.criteria.clone().unwrap_or_default();
        if let Some(node_type) = self.node_type {
            criteria = criteria.eq("type", node_type.as_str());
        }
        criteria
    }

    fn matches(&self, node: &Node) -> bool {
        self.full_criteria().matches(node)
    }
}

/// A directed edge constraint between two pattern-node indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConstraint {
    pub source: usize,
    pub target: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<EdgeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Criteria>,
}

impl EdgeConstraint {
    fn matches(&self, edge: &Edge) -> bool {
        if let Some(edge_type) = self.edge_type {
            if edge.edge_type != edge_type {
                return false;
            }
        }
        self.criteria
            .as_ref()
            .is_none_or(|criteria| criteria.matches(edge))
    }
}

/// A subgraph pattern: node constraints plus edges over their indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPattern {
    pub nodes: Vec<NodeConstraint>,
    #[serde(default)]
    pub edges: Vec<EdgeConstraint>,
    /// Permit one graph node to fill several pattern roles.
    #[serde(default)]
    pub allow_duplicate_bindings: bool,
    /// Marks self-referential patterns that must be expanded iteratively.
    #[serde(default)]
    pub recursive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Difficulty classes steering the matching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternComplexity {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl GraphPattern {
    pub fn classify(&self) -> PatternComplexity {
        if self.recursive || (self.nodes.len() > 5 && self.edges.len() > 10) {
            return PatternComplexity::VeryComplex;
        }
        if self.nodes.len() > 3 || self.has_complex_constraints() {
            return PatternComplexity::Complex;
        }
        if self.nodes.len() == 1 && self.edges.is_empty() {
            return PatternComplexity::Simple;
        }
        if self.nodes.len() == 2 && self.edges.len() == 1 {
            return PatternComplexity::Simple;
        }
        if self.nodes.len() <= 3 && self.edges.len() <= 5 {
            return PatternComplexity::Moderate;
        }
        PatternComplexity::Complex
    }

    /// Non-equality operators and nested property paths push a pattern into
    /// the complex class.
    fn has_complex_constraints(&self) -> bool {
        let criteria_complex = |criteria: &Criteria| {
            criteria.0.iter().any(|(path, predicate)| {
                !matches!(predicate, Predicate::Eq(_))
                    || path
                        .strip_prefix("properties.")
                        .is_some_and(|rest| rest.contains('.'))
            })
        };
        self.nodes
            .iter()
            .filter_map(|n| n.criteria.as_ref())
            .any(&criteria_complex)
            || self
                .edges
                .iter()
                .filter_map(|e| e.criteria.as_ref())
                .any(&criteria_complex)
    }

    fn validate(&self) -> NoemaResult<()> {
        if self.nodes.is_empty() {
            return Err(NoemaError::InvalidQuery(
                "pattern requires at least one node".into(),
            ));
        }
        for (i, edge) in self.edges.iter().enumerate() {
            if edge.source >= self.nodes.len() || edge.target >= self.nodes.len() {
                return Err(NoemaError::InvalidQuery(format!(
                    "pattern edge {i} references a node index out of range"
                )));
            }
        }
        Ok(())
    }

    /// The most-constrained node index; ties fall to declaration order.
    fn seed_index(&self) -> usize {
        let mut best = 0;
        let mut best_count = self.nodes[0].constraint_count();
        for (i, node) in self.nodes.iter().enumerate().skip(1) {
            let count = node.constraint_count();
            if count > best_count {
                best = i;
                best_count = count;
            }
        }
        best
    }

    /// Visit order: seed first, then indices reachable over pattern edges,
    /// then any disconnected remainder in declaration order.
    fn match_order(&self) -> Vec<usize> {
        let seed = self.seed_index();
        let mut order = vec![seed];
        let mut placed: HashSet<usize> = HashSet::from([seed]);

        loop {
            let next = self
                .nodes
                .iter()
                .enumerate()
                .map(|(i, _)| i)
                .find(|i| {
                    !placed.contains(i)
                        && self.edges.iter().any(|e| {
                            (e.source == *i && placed.contains(&e.target))
                                || (e.target == *i && placed.contains(&e.source))
                        })
                })
                .or_else(|| (0..self.nodes.len()).find(|i| !placed.contains(i)));

            match next {
                Some(i) => {
                    placed.insert(i);
                    order.push(i);
                }
                None => break,
            }
        }
        order
    }
}

/// One complete assignment of pattern-node indices to graph nodes, with the
/// witnessing edges in pattern order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    /// Graph node id bound to each pattern index.
    pub bindings: Vec<Uuid>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl PatternMatch {
    /// Signature collapsing node-role symmetries: the sorted binding set.
    fn canonical_signature(&self) -> Vec<Uuid> {
        let mut ids = self.bindings.clone();
        ids.sort_unstable();
        ids
    }
}

impl AdvancedQueryEngine {
    /// Find occurrences of a subgraph pattern. Seed candidates come from the
    /// most-constrained pattern node; the rest of the pattern is bound by
    /// greedy expansion for moderate patterns and full backtracking beyond
    /// that. Matches equal up to role symmetry are collapsed to one.
    pub async fn find_patterns(
        &self,
        pattern: &GraphPattern,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<PatternMatch>> {
        pattern.validate()?;
        let ctx = self.op_ctx(opts);
        let limit = self.result_cap(pattern.limit);
        let complexity = pattern.classify();

        let order = pattern.match_order();
        let seed_candidates = self
            .store
            .query_nodes(&pattern.nodes[order[0]].full_criteria())
            .await?;

        let backtrack = matches!(
            complexity,
            PatternComplexity::Complex | PatternComplexity::VeryComplex
        );
        let depth_cap = if backtrack {
            self.config.max_recursion_depth.max(pattern.nodes.len())
        } else {
            pattern.nodes.len()
        };

        let mut seen: HashSet<Vec<Uuid>> = HashSet::new();
        let mut matches: Vec<PatternMatch> = Vec::new();

        for seed in seed_candidates {
            ctx.checkpoint()?;
            if matches.len() >= limit {
                break;
            }
            // One seed's whole expansion runs against a stable snapshot;
            // writers get through between seeds.
            let _snapshot = self.write_gate.read().await;

            let mut bindings: Vec<Option<Uuid>> = vec![None; pattern.nodes.len()];
            let mut bound_nodes: Vec<Option<Node>> = vec![None; pattern.nodes.len()];
            bindings[order[0]] = Some(seed.id);
            bound_nodes[order[0]] = Some(seed);

            self.bind_next(
                pattern,
                &order,
                1,
                depth_cap,
                &mut bindings,
                &mut bound_nodes,
                backtrack,
                &mut seen,
                &mut matches,
                limit,
                &ctx,
            )
            .await?;
        }

        Ok(matches)
    }

    /// Bind the pattern node at `position` in the match order, then recurse.
    /// Greedy mode commits to the first viable candidate per seed; full
    /// backtracking explores every viable candidate.
    #[allow(clippy::too_many_arguments)]
    #[async_recursion]
    async fn bind_next(
        &self,
        pattern: &GraphPattern,
        order: &[usize],
        position: usize,
        depth_cap: usize,
        bindings: &mut Vec<Option<Uuid>>,
        bound_nodes: &mut Vec<Option<Node>>,
        backtrack: bool,
        seen: &mut HashSet<Vec<Uuid>>,
        matches: &mut Vec<PatternMatch>,
        limit: usize,
        ctx: &OpCtx,
    ) -> NoemaResult<bool> {
        if matches.len() >= limit {
            return Ok(true);
        }
        if position == order.len() {
            if let Some(found) = self.complete_match(pattern, bindings, bound_nodes).await? {
                if seen.insert(found.canonical_signature()) {
                    matches.push(found);
                }
            }
            return Ok(true);
        }
        if position > depth_cap {
            return Ok(false);
        }

        let index = order[position];
        let candidates = self.candidates_for(pattern, index, bindings).await?;

        let mut any_complete = false;
        for candidate in candidates {
            ctx.checkpoint()?;

            if !pattern.allow_duplicate_bindings
                && bindings.iter().flatten().any(|id| id == &candidate.id)
            {
                continue;
            }
            if !self
                .edges_consistent(pattern, index, &candidate.id, bindings)
                .await?
            {
                continue;
            }

            bindings[index] = Some(candidate.id);
            bound_nodes[index] = Some(candidate);
            let completed = self
                .bind_next(
                    pattern,
                    order,
                    position + 1,
                    depth_cap,
                    bindings,
                    bound_nodes,
                    backtrack,
                    seen,
                    matches,
                    limit,
                    ctx,
                )
                .await?;
            bindings[index] = None;
            bound_nodes[index] = None;

            any_complete |= completed;
            if completed && !backtrack {
                // Greedy: the first viable branch per seed is kept.
                break;
            }
            if matches.len() >= limit {
                break;
            }
        }
        Ok(any_complete)
    }

    /// Candidate nodes for a pattern index: neighbors of an already-bound
    /// adjacent node when possible, otherwise a constraint scan.
    async fn candidates_for(
        &self,
        pattern: &GraphPattern,
        index: usize,
        bindings: &[Option<Uuid>],
    ) -> NoemaResult<Vec<Node>> {
        let constraint = &pattern.nodes[index];

        for edge in &pattern.edges {
            if edge.source == index {
                if let Some(bound) = bindings[edge.target] {
                    let edges = self
                        .store
                        .find_edges(None, Some(&bound), edge.edge_type.as_ref().map(std::slice::from_ref))
                        .await?;
                    return self.hydrate_candidates(edges.iter().map(|e| e.source_id), constraint).await;
                }
            }
            if edge.target == index {
                if let Some(bound) = bindings[edge.source] {
                    let edges = self
                        .store
                        .find_edges(Some(&bound), None, edge.edge_type.as_ref().map(std::slice::from_ref))
                        .await?;
                    return self.hydrate_candidates(edges.iter().map(|e| e.target_id), constraint).await;
                }
            }
        }

        self.store.query_nodes(&constraint.full_criteria()).await
    }

    async fn hydrate_candidates(
        &self,
        ids: impl Iterator<Item = Uuid>,
        constraint: &NodeConstraint,
    ) -> NoemaResult<Vec<Node>> {
        let mut unique: Vec<Uuid> = ids.collect();
        unique.sort_unstable();
        unique.dedup();

        let mut nodes = Vec::with_capacity(unique.len());
        for id in unique {
            if let Some(node) = self.store.get_node(&id).await? {
                if constraint.matches(&node) {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    /// Every pattern edge touching `index` and a bound peer must be
    /// witnessed by a concrete edge.
    async fn edges_consistent(
        &self,
        pattern: &GraphPattern,
        index: usize,
        candidate: &Uuid,
        bindings: &[Option<Uuid>],
    ) -> NoemaResult<bool> {
        for edge in &pattern.edges {
            let (source, target) = match (edge.source == index, edge.target == index) {
                (true, _) => match bindings[edge.target] {
                    Some(bound) => (*candidate, bound),
                    None => continue,
                },
                (_, true) => match bindings[edge.source] {
                    Some(bound) => (bound, *candidate),
                    None => continue,
                },
                _ => continue,
            };

            if self.witness_edge(edge, &source, &target).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn witness_edge(
        &self,
        constraint: &EdgeConstraint,
        source: &Uuid,
        target: &Uuid,
    ) -> NoemaResult<Option<Edge>> {
        let found = self
            .store
            .find_edges(
                Some(source),
                Some(target),
                constraint.edge_type.as_ref().map(std::slice::from_ref),
            )
            .await?;
        Ok(found.into_iter().find(|edge| constraint.matches(edge)))
    }

    /// Assemble the final match, re-checking every edge constraint and
    /// collecting the witnessing edges in pattern order.
    async fn complete_match(
        &self,
        pattern: &GraphPattern,
        bindings: &[Option<Uuid>],
        bound_nodes: &[Option<Node>],
    ) -> NoemaResult<Option<PatternMatch>> {
        let ids: Option<Vec<Uuid>> = bindings.iter().copied().collect();
        let Some(ids) = ids else {
            return Ok(None);
        };

        let mut edges = Vec::with_capacity(pattern.edges.len());
        for constraint in &pattern.edges {
            let source = ids[constraint.source];
            let target = ids[constraint.target];
            match self.witness_edge(constraint, &source, &target).await? {
                Some(edge) => edges.push(edge),
                None => return Ok(None),
            }
        }

        let nodes: Vec<Node> = bound_nodes.iter().flatten().cloned().collect();
        Ok(Some(PatternMatch {
            bindings: ids,
            nodes,
            edges,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AdvancedQueryConfig, IndexingConfig};
    use crate::index::IndexManager;
    use crate::model::embedding::HashEmbedder;
    use crate::store::{GraphStore, InMemoryGraphStore};
    use serde_json::json;
    use std::sync::Arc;

    fn engine(store: Arc<InMemoryGraphStore>) -> AdvancedQueryEngine {
        AdvancedQueryEngine::new(
            store,
            Arc::new(IndexManager::new(IndexingConfig::default())),
            Arc::new(HashEmbedder::new(16)),
            AdvancedQueryConfig::default(),
        )
    }

    fn triangle_pattern() -> GraphPattern {
        GraphPattern {
            nodes: vec![
                NodeConstraint::default(),
                NodeConstraint::default(),
                NodeConstraint::default(),
            ],
            edges: vec![
                EdgeConstraint {
                    source: 0,
                    target: 1,
                    edge_type: Some(EdgeType::RelatedTo),
                    criteria: None,
                },
                EdgeConstraint {
                    source: 1,
                    target: 2,
                    edge_type: Some(EdgeType::RelatedTo),
                    criteria: None,
                },
                EdgeConstraint {
                    source: 0,
                    target: 2,
                    edge_type: Some(EdgeType::RelatedTo),
                    criteria: None,
                },
            ],
            allow_duplicate_bindings: false,
            recursive: false,
            limit: None,
        }
    }

    #[test]
    fn classification_matches_the_table() {
        let simple = GraphPattern {
            nodes: vec![NodeConstraint::default()],
            edges: Vec::new(),
            allow_duplicate_bindings: false,
            recursive: false,
            limit: None,
        };
        assert_eq!(simple.classify(), PatternComplexity::Simple);

        assert_eq!(triangle_pattern().classify(), PatternComplexity::Moderate);

        let complex = GraphPattern {
            nodes: vec![
                NodeConstraint {
                    node_type: None,
                    criteria: Some(Criteria::new().with(
                        "properties.rank",
                        Predicate::Gt(json!(3)),
                    )),
                },
                NodeConstraint::default(),
            ],
            edges: vec![EdgeConstraint {
                source: 0,
                target: 1,
                edge_type: None,
                criteria: None,
            }],
            allow_duplicate_bindings: false,
            recursive: false,
            limit: None,
        };
        assert_eq!(complex.classify(), PatternComplexity::Complex);

        let recursive = GraphPattern {
            recursive: true,
            ..triangle_pattern()
        };
        assert_eq!(recursive.classify(), PatternComplexity::VeryComplex);
    }

    #[test]
    fn seed_is_the_most_constrained_node() {
        let mut pattern = triangle_pattern();
        pattern.nodes[1].node_type = Some(NodeType::Concept);
        pattern.nodes[1].criteria = Some(Criteria::new().eq("properties.name", "x"));
        assert_eq!(pattern.seed_index(), 1);

        // Ties fall to declaration order.
        assert_eq!(triangle_pattern().seed_index(), 0);
    }

    /// Two triangles sharing node P; every pair is connected both ways.
    async fn shared_triangles() -> (Arc<InMemoryGraphStore>, Vec<Uuid>) {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut ids = Vec::new();
        for name in ["p", "q", "r", "s", "t"] {
            let node = Node::new(NodeType::Concept).with_property("name", name);
            ids.push(store.put_node(node).await.unwrap());
        }
        let triangles = [[0, 1, 2], [0, 3, 4]];
        for triangle in &triangles {
            for i in 0..3 {
                for j in 0..3 {
                    if i != j {
                        store
                            .put_edge(Edge::new(
                                EdgeType::RelatedTo,
                                ids[triangle[i]],
                                ids[triangle[j]],
                            ))
                            .await
                            .unwrap();
                    }
                }
            }
        }
        (store, ids)
    }

    #[tokio::test]
    async fn shared_triangles_yield_two_canonical_matches() {
        let (store, _) = shared_triangles().await;
        let found = engine(store)
            .find_patterns(&triangle_pattern(), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        for m in &found {
            assert_eq!(m.bindings.len(), 3);
            assert_eq!(m.edges.len(), 3);
            let distinct: HashSet<Uuid> = m.bindings.iter().copied().collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[tokio::test]
    async fn constraints_restrict_matches() {
        let (store, ids) = shared_triangles().await;
        let mut pattern = triangle_pattern();
        pattern.nodes[0].criteria = Some(Criteria::new().eq("properties.name", "q"));

        let found = engine(store)
            .find_patterns(&pattern, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].bindings.contains(&ids[1]));
    }

    #[tokio::test]
    async fn duplicate_bindings_are_rejected_by_default() {
        let store = Arc::new(InMemoryGraphStore::new());
        let a = store.put_node(Node::new(NodeType::Concept)).await.unwrap();
        let b = store.put_node(Node::new(NodeType::Concept)).await.unwrap();
        // Mutual edges form a 2-cycle; a triangle must not reuse a node.
        store.put_edge(Edge::new(EdgeType::RelatedTo, a, b)).await.unwrap();
        store.put_edge(Edge::new(EdgeType::RelatedTo, b, a)).await.unwrap();

        let found = engine(store)
            .find_patterns(&triangle_pattern(), &QueryOptions::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_edge_index_is_invalid() {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut pattern = triangle_pattern();
        pattern.edges[0].target = 9;

        let err = engine(store)
            .find_patterns(&pattern, &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, NoemaError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn limit_caps_matches() {
        let (store, _) = shared_triangles().await;
        let mut pattern = triangle_pattern();
        pattern.limit = Some(1);

        let found = engine(store)
            .find_patterns(&pattern, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }
}
