use serde::Serialize;
use uuid::Uuid;

use crate::error::{NoemaError, NoemaResult};
use crate::index::{IndexManager, IndexTarget};
use crate::model::edge::EdgeType;
use crate::model::value::Criteria;
use crate::query::{
    Aggregation, Direction, FilterCondition, PatternSegment, QueryShape, QuerySpec, SortKey,
};

// ---------------------------------------------------------------------------
// Plan steps and candidate plans
// ---------------------------------------------------------------------------

/// How a traversal step walks the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalStrategy {
    /// Edge expansion through a composite property index.
    IndexBased,
    /// Two frontiers meeting in the middle; needs a known end node.
    Bidirectional,
    /// Plain breadth-first expansion over adjacency.
    BreadthFirst,
}

/// One executable step. Steps consume the previous step's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    NodeLookupById {
        id: Uuid,
    },
    NodeLookupByCriteria {
        criteria: Criteria,
    },
    EdgeLookupById {
        id: Uuid,
    },
    EdgeLookupByCriteria {
        criteria: Criteria,
    },
    EdgeLookupComposite {
        source_id: Option<Uuid>,
        target_id: Option<Uuid>,
        edge_type: Option<EdgeType>,
    },
    Traversal {
        strategy: TraversalStrategy,
        start_id: Uuid,
        end_id: Option<Uuid>,
        direction: Direction,
        edge_types: Option<Vec<EdgeType>>,
        max_depth: usize,
        /// Conditions folded into the per-step expansion predicate.
        fused_filter: Vec<FilterCondition>,
        /// Name of the composite edge index, for index-based strategies.
        index_name: Option<String>,
    },
    /// One-hop expansion used inside pattern chains; input nodes seed it.
    Expand {
        direction: Direction,
        edge_types: Option<Vec<EdgeType>>,
        fused_filter: Vec<FilterCondition>,
    },
    Filter {
        conditions: Vec<FilterCondition>,
    },
    Sort {
        keys: Vec<SortKey>,
    },
    Limit {
        limit: Option<usize>,
        offset: usize,
    },
    Projection {
        paths: Vec<String>,
    },
    /// Re-join for reversed pattern plans: run the forward chain from the
    /// current candidate set.
    Join {
        steps: Vec<PlanStep>,
    },
    Aggregate {
        aggregation: Aggregation,
        field: Option<String>,
    },
    Union {
        right: Vec<PlanStep>,
    },
    Intersection {
        right: Vec<PlanStep>,
    },
    Difference {
        right: Vec<PlanStep>,
    },
}

impl PlanStep {
    /// Additive cost of this step.
    pub fn cost(&self) -> u64 {
        match self {
            PlanStep::NodeLookupById { .. } | PlanStep::EdgeLookupById { .. } => 1,
            PlanStep::NodeLookupByCriteria { .. }
            | PlanStep::EdgeLookupByCriteria { .. }
            | PlanStep::EdgeLookupComposite { .. } => 100,
            PlanStep::Traversal {
                strategy,
                max_depth,
                ..
            } => {
                let per_depth = match strategy {
                    TraversalStrategy::IndexBased => 10,
                    TraversalStrategy::Bidirectional => 50,
                    TraversalStrategy::BreadthFirst => 100,
                };
                per_depth * (*max_depth as u64)
            }
            PlanStep::Expand { .. } => 100,
            PlanStep::Filter { conditions } => 10 * conditions.len() as u64,
            PlanStep::Sort { .. } => 50,
            PlanStep::Limit { .. } => 1,
            PlanStep::Projection { .. } => 5,
            PlanStep::Join { steps } => 200 + steps.iter().map(PlanStep::cost).sum::<u64>(),
            PlanStep::Aggregate { .. } => 100,
            PlanStep::Union { right }
            | PlanStep::Intersection { right }
            | PlanStep::Difference { right } => {
                200 + right.iter().map(PlanStep::cost).sum::<u64>()
            }
        }
    }
}

/// One candidate plan with its total cost.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub label: String,
    pub steps: Vec<PlanStep>,
    pub cost: u64,
}

impl QueryPlan {
    fn new(label: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        let cost = steps.iter().map(PlanStep::cost).sum();
        Self {
            label: label.into(),
            steps,
            cost,
        }
    }
}

/// All candidates for one spec, with the selected index.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSet {
    pub candidates: Vec<QueryPlan>,
    pub selected: usize,
}

impl PlanSet {
    pub fn selected_plan(&self) -> &QueryPlan {
        &self.candidates[self.selected]
    }
}

/// The output of `explain`: the validated spec and every candidate.
#[derive(Debug, Clone, Serialize)]
pub struct QueryExplanation {
    pub spec: QuerySpec,
    pub candidates: Vec<ExplainedPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainedPlan {
    pub label: String,
    pub steps: Vec<PlanStep>,
    pub cost: u64,
    pub selected: bool,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Type and bounds checks. Runs before any storage access, so a rejected
/// spec has no side effects.
pub fn validate(spec: &QuerySpec) -> NoemaResult<()> {
    match &spec.shape {
        QueryShape::Node { id, criteria } => {
            if id.is_none() && criteria.is_none() {
                return Err(NoemaError::InvalidQuery(
                    "node query requires `id` or `criteria`".into(),
                ));
            }
        }
        QueryShape::Edge {
            id,
            criteria,
            source_id,
            target_id,
            ..
        } => {
            if id.is_none() && criteria.is_none() && source_id.is_none() && target_id.is_none() {
                return Err(NoemaError::InvalidQuery(
                    "edge query requires `id`, `criteria`, or an endpoint".into(),
                ));
            }
        }
        QueryShape::Traversal { max_depth, .. } => {
            if *max_depth == 0 {
                return Err(NoemaError::InvalidQuery(
                    "traversal `max_depth` must be at least 1".into(),
                ));
            }
        }
        QueryShape::Pattern { pattern } => {
            if pattern.is_empty() {
                return Err(NoemaError::InvalidQuery("pattern must not be empty".into()));
            }
            for (i, segment) in pattern.iter().enumerate() {
                let is_last = i + 1 == pattern.len();
                if !is_last && segment.edge.is_none() {
                    return Err(NoemaError::InvalidQuery(format!(
                        "pattern segment {i} has no edge step to the next segment"
                    )));
                }
                if is_last && segment.edge.is_some() {
                    return Err(NoemaError::InvalidQuery(
                        "final pattern segment must not carry an edge step".into(),
                    ));
                }
            }
        }
        QueryShape::Aggregate {
            target,
            aggregation,
            field,
        } => {
            match target.as_ref() {
                QueryShape::Node { .. } | QueryShape::Edge { .. } => {}
                _ => {
                    return Err(NoemaError::InvalidQuery(
                        "aggregate target must be a node or edge query".into(),
                    ))
                }
            }
            let needs_field = matches!(
                aggregation,
                Aggregation::Sum
                    | Aggregation::Avg
                    | Aggregation::Min
                    | Aggregation::Max
                    | Aggregation::Group
            );
            if needs_field && field.is_none() {
                return Err(NoemaError::InvalidQuery(format!(
                    "aggregation `{aggregation:?}` requires `field`"
                )));
            }
        }
    }

    for key in &spec.sort {
        if key.property.is_empty() {
            return Err(NoemaError::InvalidQuery(
                "sort key property must not be empty".into(),
            ));
        }
    }
    for condition in &spec.filter {
        if condition.property.is_empty() {
            return Err(NoemaError::InvalidQuery(
                "filter property must not be empty".into(),
            ));
        }
    }
    if let Some(paths) = &spec.projection {
        if paths.is_empty() {
            return Err(NoemaError::InvalidQuery(
                "projection must list at least one path".into(),
            ));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Planning: enumerate candidates, rewrite, cost, select
// ---------------------------------------------------------------------------

/// Produce every candidate plan for a validated spec and pick the cheapest.
/// Ties break by enumeration order, so the basic plan wins when equal.
pub async fn plan(spec: &QuerySpec, indexes: &IndexManager) -> NoemaResult<PlanSet> {
    validate(spec)?;

    let mut candidates: Vec<QueryPlan> = Vec::new();

    // Basic plan: direct structural translation.
    candidates.push(QueryPlan::new("basic", base_steps(spec, None)));

    // Index-based traversal, when a composite edge index applies.
    if let QueryShape::Traversal {
        direction,
        edge_types,
        ..
    } = &spec.shape
    {
        if let Some(types) = edge_types {
            if !types.is_empty() {
                if let Some(index_name) =
                    applicable_traversal_index(indexes, *direction).await
                {
                    candidates.push(QueryPlan::new(
                        "index",
                        base_steps(spec, Some((TraversalStrategy::IndexBased, index_name))),
                    ));
                }
            }
        }

        // Bidirectional traversal needs a destination and enough depth to
        // make meeting in the middle worthwhile. Edge-scoped filters cannot
        // gate a frontier that walks edges from both ends, so they disable
        // the candidate.
        let has_edge_filter = spec.filter.iter().any(|c| c.property.starts_with("edge."));
        if let QueryShape::Traversal {
            end_id: Some(_),
            max_depth,
            ..
        } = &spec.shape
        {
            if *max_depth > 2 && !has_edge_filter {
                candidates.push(QueryPlan::new(
                    "bidirectional",
                    base_steps(spec, Some((TraversalStrategy::Bidirectional, String::new()))),
                ));
            }
        }
    }

    // Alternate join order for long patterns: at minimum the reverse.
    if let QueryShape::Pattern { pattern } = &spec.shape {
        if pattern.len() >= 3 {
            candidates.push(QueryPlan::new(
                "reversed",
                reversed_pattern_steps(spec, pattern),
            ));
        }
    }

    // Rewrites are idempotent and applied in fixed order to each candidate.
    for candidate in &mut candidates {
        candidate.steps = rewrite(std::mem::take(&mut candidate.steps));
        candidate.cost = candidate.steps.iter().map(PlanStep::cost).sum();
    }

    let selected = candidates
        .iter()
        .enumerate()
        .min_by_key(|(i, plan)| (plan.cost, *i))
        .map(|(i, _)| i)
        .unwrap_or(0);

    Ok(PlanSet {
        candidates,
        selected,
    })
}

/// Build `explain` output without executing anything.
pub async fn explain(spec: &QuerySpec, indexes: &IndexManager) -> NoemaResult<QueryExplanation> {
    let set = plan(spec, indexes).await?;
    let candidates = set
        .candidates
        .into_iter()
        .enumerate()
        .map(|(i, plan)| ExplainedPlan {
            label: plan.label,
            steps: plan.steps,
            cost: plan.cost,
            selected: i == set.selected,
        })
        .collect();
    Ok(QueryExplanation {
        spec: spec.clone(),
        candidates,
    })
}

async fn applicable_traversal_index(
    indexes: &IndexManager,
    direction: Direction,
) -> Option<String> {
    let outgoing = indexes
        .find_property_index(IndexTarget::Edge, &["source_id", "edge_type"])
        .await;
    let incoming = indexes
        .find_property_index(IndexTarget::Edge, &["target_id", "edge_type"])
        .await;
    match direction {
        Direction::Outgoing => outgoing,
        Direction::Incoming => incoming,
        // Both directions expand through both postings; require the pair.
        Direction::Both => match (outgoing, incoming) {
            (Some(out), Some(_)) => Some(out),
            _ => None,
        },
    }
}

/// Structural translation of the spec into steps, before rewrites.
fn base_steps(
    spec: &QuerySpec,
    traversal_override: Option<(TraversalStrategy, String)>,
) -> Vec<PlanStep> {
    let mut steps: Vec<PlanStep> = Vec::new();

    match &spec.shape {
        QueryShape::Node { id, criteria } => match (id, criteria) {
            (Some(id), _) => steps.push(PlanStep::NodeLookupById { id: *id }),
            (None, Some(criteria)) => steps.push(PlanStep::NodeLookupByCriteria {
                criteria: criteria.clone(),
            }),
            (None, None) => unreachable!("validated"),
        },
        QueryShape::Edge {
            id,
            criteria,
            source_id,
            target_id,
            edge_type,
        } => {
            if let Some(id) = id {
                steps.push(PlanStep::EdgeLookupById { id: *id });
            } else if source_id.is_some() || target_id.is_some() {
                steps.push(PlanStep::EdgeLookupComposite {
                    source_id: *source_id,
                    target_id: *target_id,
                    edge_type: *edge_type,
                });
                if let Some(criteria) = criteria {
                    steps.push(PlanStep::Filter {
                        conditions: criteria_to_conditions(criteria),
                    });
                }
            } else if let Some(criteria) = criteria {
                steps.push(PlanStep::EdgeLookupByCriteria {
                    criteria: criteria.clone(),
                });
            }
        }
        QueryShape::Traversal {
            start_id,
            end_id,
            direction,
            edge_types,
            max_depth,
        } => {
            let (strategy, index_name) = match traversal_override {
                Some((strategy, name)) => {
                    let name = if name.is_empty() { None } else { Some(name) };
                    (strategy, name)
                }
                None => (TraversalStrategy::BreadthFirst, None),
            };
            steps.push(PlanStep::Traversal {
                strategy,
                start_id: *start_id,
                end_id: *end_id,
                direction: *direction,
                edge_types: edge_types.clone(),
                max_depth: *max_depth,
                fused_filter: Vec::new(),
                index_name,
            });
        }
        QueryShape::Pattern { pattern } => {
            steps.extend(forward_pattern_steps(pattern));
        }
        QueryShape::Aggregate {
            target,
            aggregation,
            field,
        } => {
            let inner = QuerySpec::new(target.as_ref().clone());
            steps.extend(base_steps(&inner, None));
            steps.push(PlanStep::Aggregate {
                aggregation: *aggregation,
                field: field.clone(),
            });
        }
    }

    if !spec.filter.is_empty() {
        steps.push(PlanStep::Filter {
            conditions: spec.filter.clone(),
        });
    }
    if !spec.sort.is_empty() {
        steps.push(PlanStep::Sort {
            keys: spec.sort.clone(),
        });
    }
    if spec.limit.is_some() || spec.offset.is_some() {
        steps.push(PlanStep::Limit {
            limit: spec.limit,
            offset: spec.offset.unwrap_or(0),
        });
    }
    if let Some(paths) = &spec.projection {
        steps.push(PlanStep::Projection {
            paths: paths.clone(),
        });
    }

    steps
}

/// Forward chain for a linear pattern: seed lookup, then expand + filter per
/// segment.
fn forward_pattern_steps(pattern: &[PatternSegment]) -> Vec<PlanStep> {
    let mut steps = vec![PlanStep::NodeLookupByCriteria {
        criteria: pattern[0].node_criteria(),
    }];
    for (i, segment) in pattern.iter().enumerate().skip(1) {
        let step = pattern[i - 1]
            .edge
            .as_ref()
            .expect("validated: non-final segments carry an edge step");
        steps.push(PlanStep::Expand {
            direction: step.direction,
            edge_types: step.edge_type.map(|t| vec![t]),
            fused_filter: Vec::new(),
        });
        let criteria = segment.node_criteria();
        if !criteria.is_empty() {
            steps.push(PlanStep::Filter {
                conditions: criteria_to_conditions(&criteria),
            });
        }
    }
    steps
}

/// Reverse join order: seed from the final segment, walk the chain backwards
/// to prune, then re-join forward to emit final-segment nodes.
fn reversed_pattern_steps(spec: &QuerySpec, pattern: &[PatternSegment]) -> Vec<PlanStep> {
    let last = pattern.len() - 1;
    let mut steps = vec![PlanStep::NodeLookupByCriteria {
        criteria: pattern[last].node_criteria(),
    }];

    for i in (0..last).rev() {
        let step = pattern[i]
            .edge
            .as_ref()
            .expect("validated: non-final segments carry an edge step");
        steps.push(PlanStep::Expand {
            direction: step.direction.reversed(),
            edge_types: step.edge_type.map(|t| vec![t]),
            fused_filter: Vec::new(),
        });
        let criteria = pattern[i].node_criteria();
        if !criteria.is_empty() {
            steps.push(PlanStep::Filter {
                conditions: criteria_to_conditions(&criteria),
            });
        }
    }

    // The backward pass leaves segment-0 candidates; the join replays the
    // forward chain from them, minus the redundant seed lookup.
    let forward: Vec<PlanStep> = forward_pattern_steps(pattern).split_off(1);
    steps.push(PlanStep::Join { steps: forward });

    // Modifiers still apply after the join.
    let mut modifiers = base_steps(
        &QuerySpec {
            shape: QueryShape::Node {
                id: None,
                criteria: Some(Criteria::new()),
            },
            ..spec.clone()
        },
        None,
    );
    modifiers.remove(0);
    steps.extend(modifiers);
    steps
}

fn criteria_to_conditions(criteria: &Criteria) -> Vec<FilterCondition> {
    criteria
        .0
        .iter()
        .map(|(path, predicate)| FilterCondition {
            property: path.clone(),
            predicate: predicate.clone(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Rewrite rules, applied idempotently in fixed order
// ---------------------------------------------------------------------------

fn rewrite(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let steps = push_down_filters(steps);
    let steps = merge_filters(steps);
    let steps = fuse_traversal_filters(steps);
    sort_before_limit(steps)
}

/// A filter may move earlier past order-insensitive steps. It may never
/// cross the step that binds its referenced entity: traversals, expansions,
/// lookups, joins, aggregates, or a limit (which would change semantics).
fn push_down_filters(mut steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut moved = true;
    while moved {
        moved = false;
        for i in 1..steps.len() {
            let filter_here = matches!(steps[i], PlanStep::Filter { .. });
            let can_cross = matches!(steps[i - 1], PlanStep::Sort { .. });
            if filter_here && can_cross {
                steps.swap(i - 1, i);
                moved = true;
            }
        }
    }
    steps
}

/// Adjacent filters merge into one conjunction.
fn merge_filters(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut out: Vec<PlanStep> = Vec::with_capacity(steps.len());
    for step in steps {
        match (out.last_mut(), step) {
            (
                Some(PlanStep::Filter { conditions }),
                PlanStep::Filter {
                    conditions: incoming,
                },
            ) => {
                conditions.extend(incoming);
            }
            (_, step) => out.push(step),
        }
    }
    out
}

/// A filter immediately after a traversal folds into its per-step predicate
/// when every condition references fields bound during expansion (node
/// fields, or `edge.`-prefixed fields of the traversed edge).
fn fuse_traversal_filters(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut out: Vec<PlanStep> = Vec::with_capacity(steps.len());
    for step in steps {
        let fusable = match (out.last(), &step) {
            // A bidirectional frontier cannot evaluate per-hop predicates
            // from both ends; its filters stay as explicit steps.
            (Some(PlanStep::Traversal { strategy, .. }), PlanStep::Filter { conditions })
                if *strategy != TraversalStrategy::Bidirectional =>
            {
                conditions.iter().all(|c| is_bound_during_expansion(&c.property))
            }
            (Some(PlanStep::Expand { .. }), PlanStep::Filter { conditions }) => {
                conditions.iter().all(|c| is_bound_during_expansion(&c.property))
            }
            _ => false,
        };

        if fusable {
            if let PlanStep::Filter { conditions } = step {
                match out.last_mut() {
                    Some(PlanStep::Traversal { fused_filter, .. })
                    | Some(PlanStep::Expand { fused_filter, .. }) => {
                        fused_filter.extend(conditions);
                        continue;
                    }
                    _ => unreachable!(),
                }
            }
        }
        out.push(step);
    }
    out
}

fn is_bound_during_expansion(property: &str) -> bool {
    property == "id"
        || property == "type"
        || property == "node_type"
        || property.starts_with("properties.")
        || property.starts_with("metadata.")
        || property.starts_with("node.")
        || property.starts_with("edge.")
}

/// Sort always runs before limit.
fn sort_before_limit(mut steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut moved = true;
    while moved {
        moved = false;
        for i in 1..steps.len() {
            if matches!(steps[i], PlanStep::Sort { .. })
                && matches!(steps[i - 1], PlanStep::Limit { .. })
            {
                steps.swap(i - 1, i);
                moved = true;
            }
        }
    }
    steps
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
