pub mod exec;
pub mod plan;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::CacheSource;
use crate::model::edge::EdgeType;
use crate::model::node::NodeType;
use crate::model::value::{Criteria, Predicate};

pub use exec::QueryProcessor;
pub use plan::{ExplainedPlan, PlanStep, QueryExplanation, QueryPlan, TraversalStrategy};

// ---------------------------------------------------------------------------
// QuerySpec: the structured query surface of the processor
// ---------------------------------------------------------------------------

/// A structured query: one of five shapes plus optional result modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(flatten)]
    pub shape: QueryShape,
    /// Conjunctive post-conditions; the planner pushes these as early as legal.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<FilterCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Vec<String>>,
}

impl QuerySpec {
    pub fn new(shape: QueryShape) -> Self {
        Self {
            shape,
            filter: Vec::new(),
            sort: Vec::new(),
            limit: None,
            offset: None,
            projection: None,
        }
    }

    /// Single node by id.
    pub fn node_by_id(id: Uuid) -> Self {
        Self::new(QueryShape::Node {
            id: Some(id),
            criteria: None,
        })
    }

    /// Nodes matching criteria.
    pub fn nodes(criteria: Criteria) -> Self {
        Self::new(QueryShape::Node {
            id: None,
            criteria: Some(criteria),
        })
    }

    /// Edges matching criteria.
    pub fn edges(criteria: Criteria) -> Self {
        Self::new(QueryShape::Edge {
            id: None,
            criteria: Some(criteria),
            source_id: None,
            target_id: None,
            edge_type: None,
        })
    }

    /// Outgoing traversal from a start node.
    pub fn traversal(start_id: Uuid) -> Self {
        Self::new(QueryShape::Traversal {
            start_id,
            end_id: None,
            direction: Direction::Outgoing,
            edge_types: None,
            max_depth: default_max_depth(),
        })
    }

    pub fn with_filter(mut self, property: impl Into<String>, predicate: Predicate) -> Self {
        self.filter.push(FilterCondition {
            property: property.into(),
            predicate,
        });
        self
    }

    pub fn with_sort(mut self, property: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            property: property.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_projection(mut self, paths: Vec<String>) -> Self {
        self.projection = Some(paths);
        self
    }

    /// Canonical JSON form of this spec. serde_json orders object keys, so
    /// structurally equal specs serialize identically; this is the cache
    /// fingerprint input.
    pub fn canonical(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The five query shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryShape {
    Node {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        criteria: Option<Criteria>,
    },
    Edge {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        criteria: Option<Criteria>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edge_type: Option<EdgeType>,
    },
    Traversal {
        start_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_id: Option<Uuid>,
        #[serde(default)]
        direction: Direction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edge_types: Option<Vec<EdgeType>>,
        #[serde(default = "default_max_depth")]
        max_depth: usize,
    },
    Pattern {
        pattern: Vec<PatternSegment>,
    },
    Aggregate {
        target: Box<QueryShape>,
        aggregation: Aggregation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

fn default_max_depth() -> usize {
    1
}

/// Which way edges are followed during traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
    Both,
}

impl Direction {
    pub fn reversed(&self) -> Direction {
        match self {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
            Direction::Both => Direction::Both,
        }
    }
}

/// One segment of a linear chain pattern: constraints on the segment's node
/// plus the edge step leading to the next segment (absent on the last one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Criteria>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<EdgeStep>,
}

impl PatternSegment {
    /// Node constraints merged into one criteria set (type included).
    pub fn node_criteria(&self) -> Criteria {
        let mut criteria = self.criteria.clone().unwrap_or_default();
        if let Some(node_type) = self.node_type {
            criteria = criteria.eq("type", node_type.as_str());
        }
        criteria
    }
}

/// The edge step between two adjacent pattern segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_type: Option<EdgeType>,
    #[serde(default)]
    pub direction: Direction,
}

/// One post-condition: a property path plus the comparison applied to it.
/// Paths prefixed `edge.` address the traversed edge when the condition is
/// fused into a traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub property: String,
    #[serde(flatten)]
    pub predicate: Predicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub property: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Group,
}

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

/// Per-call execution knobs shared by the structured and advanced engines.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the configured default deadline.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation; checked at every suspension point.
    pub cancellation: Option<CancellationToken>,
    /// Skip the semantic cache for this call.
    pub bypass_cache: bool,
    /// Overrides the cache's approximate-match threshold.
    pub similarity_threshold: Option<f32>,
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn bypassing_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

/// Execution metadata attached to every result set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryMetadata {
    /// Cost of the selected plan.
    pub plan_cost: u64,
    /// Number of plan steps executed.
    pub steps_executed: usize,
    pub elapsed_ms: u64,
    /// Set when the result was served from the semantic cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_source: Option<CacheSource>,
    /// Cosine similarity of the cached query, for semantic cache hits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

/// A result set plus execution metadata. Items are the serialized entities
/// (or projected / aggregated objects) in final order.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub items: Vec<Value>,
    pub metadata: QueryMetadata,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            metadata: QueryMetadata::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The ids of every node/edge item in the result, for cache invalidation
    /// bookkeeping.
    pub fn referenced_ids(&self) -> Vec<Uuid> {
        self.items
            .iter()
            .filter_map(|item| item.get("id"))
            .filter_map(Value::as_str)
            .filter_map(|raw| Uuid::parse_str(raw).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_round_trips_through_serde() {
        let spec = QuerySpec::traversal(Uuid::new_v4())
            .with_filter("properties.weight", Predicate::Gt(json!(1)))
            .with_sort("properties.name", SortDirection::Desc)
            .with_limit(5);

        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], json!("traversal"));
        let back: QuerySpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn canonical_form_is_stable() {
        let a = QuerySpec::nodes(Criteria::new().eq("properties.b", 1).eq("properties.a", 2));
        let b = QuerySpec::nodes(Criteria::new().eq("properties.a", 2).eq("properties.b", 1));
        assert_eq!(a.canonical().to_string(), b.canonical().to_string());
    }

    #[test]
    fn traversal_defaults_apply_on_deserialize() {
        let spec: QuerySpec = serde_json::from_value(json!({
            "type": "traversal",
            "start_id": Uuid::new_v4(),
        }))
        .unwrap();

        match spec.shape {
            QueryShape::Traversal {
                direction,
                max_depth,
                ..
            } => {
                assert_eq!(direction, Direction::Outgoing);
                assert_eq!(max_depth, 1);
            }
            _ => panic!("expected traversal shape"),
        }
    }

    #[test]
    fn referenced_ids_extracts_entity_ids() {
        let id = Uuid::new_v4();
        let result = QueryResult {
            items: vec![json!({"id": id.to_string()}), json!({"count": 3})],
            metadata: QueryMetadata::default(),
        };
        assert_eq!(result.referenced_ids(), vec![id]);
    }
}
