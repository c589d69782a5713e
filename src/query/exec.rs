use async_recursion::async_recursion;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueryProcessorConfig;
use crate::error::{NoemaError, NoemaResult};
use crate::index::{IndexManager, IndexTarget};
use crate::model::edge::{Edge, EdgeType};
use crate::model::node::Node;
use crate::model::value::{compare_values, Criteria, Predicate, PropertyAccess};
use crate::query::plan::{self, PlanSet, PlanStep, QueryExplanation, TraversalStrategy};
use crate::query::{
    Aggregation, Direction, FilterCondition, QueryMetadata, QueryOptions, QueryResult, QuerySpec,
    SortDirection, SortKey,
};
use crate::store::GraphStore;

// ---------------------------------------------------------------------------
// QueryProcessor: plans and executes structured queries over store + indexes
// ---------------------------------------------------------------------------

pub struct QueryProcessor {
    store: Arc<dyn GraphStore>,
    indexes: Arc<IndexManager>,
    config: QueryProcessorConfig,
    plan_cache: Mutex<PlanCache>,
    /// Shared with the facade's writers: each step holds it in read mode, so
    /// a step never observes a half-applied store/index mutation. It is
    /// released between steps to let writers through during long queries.
    write_gate: Arc<tokio::sync::RwLock<()>>,
}

struct PlanCache {
    map: HashMap<String, PlanSet>,
    order: VecDeque<String>,
    capacity: usize,
}

impl PlanCache {
    fn get(&self, key: &str) -> Option<PlanSet> {
        self.map.get(key).cloned()
    }

    fn put(&mut self, key: String, set: PlanSet) {
        if self.capacity == 0 || self.map.contains_key(&key) {
            return;
        }
        while self.map.len() >= self.capacity {
            match self.order.pop_front() {
                Some(evicted) => {
                    self.map.remove(&evicted);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.map.insert(key, set);
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Per-invocation execution context: deadline, cancellation, and bounds.
struct ExecCtx {
    started: Instant,
    deadline: Instant,
    timeout: Duration,
    cancellation: CancellationToken,
    max_result_size: usize,
}

impl ExecCtx {
    fn checkpoint(&self) -> NoemaResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(NoemaError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(NoemaError::Timeout(self.timeout));
        }
        Ok(())
    }

    fn check_size(&self, len: usize) -> NoemaResult<()> {
        if len > self.max_result_size {
            return Err(NoemaError::ResultTooLarge {
                limit: self.max_result_size,
            });
        }
        Ok(())
    }
}

/// The working set flowing between steps.
enum Items {
    Nodes(Vec<Node>),
    Edges(Vec<Edge>),
    Values(Vec<Value>),
}

impl Items {
    fn empty() -> Self {
        Items::Values(Vec::new())
    }

    fn len(&self) -> usize {
        match self {
            Items::Nodes(items) => items.len(),
            Items::Edges(items) => items.len(),
            Items::Values(items) => items.len(),
        }
    }

    fn into_values(self) -> NoemaResult<Vec<Value>> {
        Ok(match self {
            Items::Nodes(items) => items
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
            Items::Edges(items) => items
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?,
            Items::Values(items) => items,
        })
    }

    fn value_at(&self, index: usize, path: &str) -> Option<Value> {
        match self {
            Items::Nodes(items) => items[index].value_at(strip_node_prefix(path)),
            Items::Edges(items) => items[index].value_at(strip_node_prefix(path)),
            Items::Values(items) => items[index].value_at(path),
        }
    }
}

fn strip_node_prefix(path: &str) -> &str {
    path.strip_prefix("node.").unwrap_or(path)
}

impl QueryProcessor {
    pub fn new(
        store: Arc<dyn GraphStore>,
        indexes: Arc<IndexManager>,
        config: QueryProcessorConfig,
    ) -> Self {
        let capacity = config.max_query_cache_size;
        Self {
            store,
            indexes,
            config,
            plan_cache: Mutex::new(PlanCache {
                map: HashMap::new(),
                order: VecDeque::new(),
                capacity,
            }),
            write_gate: Arc::new(tokio::sync::RwLock::new(())),
        }
    }

    /// Share the facade's writer gate so step snapshots exclude in-flight
    /// mutations.
    pub fn with_write_gate(mut self, gate: Arc<tokio::sync::RwLock<()>>) -> Self {
        self.write_gate = gate;
        self
    }

    /// Plan and run a structured query. Caching of results lives in the
    /// facade; this layer only memoizes plans.
    pub async fn execute(&self, spec: &QuerySpec, opts: &QueryOptions) -> NoemaResult<QueryResult> {
        let started = Instant::now();
        let set = self.plan_for(spec).await?;
        let selected = set.selected_plan().clone();

        let timeout = opts.timeout.unwrap_or_else(|| self.config.default_timeout());
        let ctx = ExecCtx {
            started,
            deadline: started + timeout,
            timeout,
            cancellation: opts
                .cancellation
                .clone()
                .unwrap_or_else(CancellationToken::new),
            max_result_size: self.config.max_result_size,
        };

        let output = self
            .run_steps_gated(&selected.steps, Items::empty(), &ctx)
            .await?;
        let items = output.into_values()?;
        ctx.check_size(items.len())?;

        Ok(QueryResult {
            items,
            metadata: QueryMetadata {
                plan_cost: selected.cost,
                steps_executed: selected.steps.len(),
                elapsed_ms: ctx.started.elapsed().as_millis() as u64,
                cache_source: None,
                similarity: None,
            },
        })
    }

    /// Candidate plans and costs for a spec, without executing anything.
    pub async fn explain(&self, spec: &QuerySpec) -> NoemaResult<QueryExplanation> {
        plan::explain(spec, &self.indexes).await
    }

    /// Drop memoized plans. Called when index topology changes, since index
    /// applicability is decided at plan time.
    pub fn invalidate_plans(&self) {
        if let Ok(mut cache) = self.plan_cache.lock() {
            cache.clear();
        }
    }

    async fn plan_for(&self, spec: &QuerySpec) -> NoemaResult<PlanSet> {
        let key = spec.canonical().to_string();
        if let Ok(cache) = self.plan_cache.lock() {
            if let Some(set) = cache.get(&key) {
                return Ok(set);
            }
        }

        let set = plan::plan(spec, &self.indexes).await?;
        if let Ok(mut cache) = self.plan_cache.lock() {
            cache.put(key, set.clone());
        }
        Ok(set)
    }

    // -----------------------------------------------------------------------
    // Step execution
    // -----------------------------------------------------------------------

    /// Top-level runner: each step holds the writer gate in read mode and
    /// releases it before the next, so steps see committed snapshots while
    /// writers interleave between them.
    async fn run_steps_gated(
        &self,
        steps: &[PlanStep],
        input: Items,
        ctx: &ExecCtx,
    ) -> NoemaResult<Items> {
        let mut current = input;
        for step in steps {
            ctx.checkpoint()?;
            let _snapshot = self.write_gate.read().await;
            current = self.run_step(step, current, ctx).await?;
            ctx.check_size(current.len())?;
        }
        Ok(current)
    }

    // Nested sub-plans (join and set steps) run inside their parent step's
    // gate acquisition; re-acquiring here could deadlock behind a queued
    // writer.
    #[async_recursion]
    async fn run_steps(
        &self,
        steps: &[PlanStep],
        input: Items,
        ctx: &ExecCtx,
    ) -> NoemaResult<Items> {
        let mut current = input;
        for step in steps {
            ctx.checkpoint()?;
            current = self.run_step(step, current, ctx).await?;
            ctx.check_size(current.len())?;
        }
        Ok(current)
    }

    #[async_recursion]
    async fn run_step(&self, step: &PlanStep, input: Items, ctx: &ExecCtx) -> NoemaResult<Items> {
        match step {
            PlanStep::NodeLookupById { id } => {
                let node = self.store.get_node(id).await?;
                Ok(Items::Nodes(node.into_iter().collect()))
            }
            PlanStep::NodeLookupByCriteria { criteria } => {
                Ok(Items::Nodes(self.lookup_nodes(criteria).await?))
            }
            PlanStep::EdgeLookupById { id } => {
                let edge = self.store.get_edge(id).await?;
                Ok(Items::Edges(edge.into_iter().collect()))
            }
            PlanStep::EdgeLookupByCriteria { criteria } => {
                Ok(Items::Edges(self.lookup_edges(criteria).await?))
            }
            PlanStep::EdgeLookupComposite {
                source_id,
                target_id,
                edge_type,
            } => {
                let types = edge_type.map(|t| vec![t]);
                let edges = self
                    .store
                    .find_edges(source_id.as_ref(), target_id.as_ref(), types.as_deref())
                    .await?;
                Ok(Items::Edges(edges))
            }
            PlanStep::Traversal {
                strategy,
                start_id,
                end_id,
                direction,
                edge_types,
                max_depth,
                fused_filter,
                index_name,
            } => {
                self.traverse(
                    *strategy,
                    start_id,
                    end_id.as_ref(),
                    *direction,
                    edge_types.as_deref(),
                    *max_depth,
                    fused_filter,
                    index_name.as_deref(),
                    ctx,
                )
                .await
            }
            PlanStep::Expand {
                direction,
                edge_types,
                fused_filter,
            } => self.expand(input, *direction, edge_types.as_deref(), fused_filter, ctx).await,
            PlanStep::Filter { conditions } => Ok(apply_filter(input, conditions)),
            PlanStep::Sort { keys } => Ok(apply_sort(input, keys)),
            PlanStep::Limit { limit, offset } => Ok(apply_limit(input, *limit, *offset)),
            PlanStep::Projection { paths } => apply_projection(input, paths),
            PlanStep::Aggregate { aggregation, field } => {
                apply_aggregate(input, *aggregation, field.as_deref())
            }
            PlanStep::Join { steps } => self.run_steps(steps, input, ctx).await,
            PlanStep::Union { right } => {
                let right = self.run_steps(right, Items::empty(), ctx).await?;
                combine(input, right, SetOp::Union)
            }
            PlanStep::Intersection { right } => {
                let right = self.run_steps(right, Items::empty(), ctx).await?;
                combine(input, right, SetOp::Intersection)
            }
            PlanStep::Difference { right } => {
                let right = self.run_steps(right, Items::empty(), ctx).await?;
                combine(input, right, SetOp::Difference)
            }
        }
    }

    async fn lookup_nodes(&self, criteria: &Criteria) -> NoemaResult<Vec<Node>> {
        // Index acceleration for all-equality criteria with a covering index.
        if let Some((index_name, tuple)) = self
            .covering_index(criteria, IndexTarget::Node)
            .await
        {
            let ids = self.indexes.query_property(&index_name, &tuple).await?;
            let mut nodes = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(node) = self.store.get_node(&id).await? {
                    nodes.push(node);
                }
            }
            return Ok(nodes);
        }
        self.store.query_nodes(criteria).await
    }

    async fn lookup_edges(&self, criteria: &Criteria) -> NoemaResult<Vec<Edge>> {
        if let Some((index_name, tuple)) = self
            .covering_index(criteria, IndexTarget::Edge)
            .await
        {
            let ids = self.indexes.query_property(&index_name, &tuple).await?;
            let mut edges = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(edge) = self.store.get_edge(&id).await? {
                    edges.push(edge);
                }
            }
            return Ok(edges);
        }
        self.store.query_edges(criteria).await
    }

    async fn covering_index(
        &self,
        criteria: &Criteria,
        target: IndexTarget,
    ) -> Option<(String, Vec<Value>)> {
        if criteria.is_empty() {
            return None;
        }
        let mut paths: Vec<&str> = Vec::with_capacity(criteria.len());
        let mut tuple: Vec<Value> = Vec::with_capacity(criteria.len());
        for (path, predicate) in &criteria.0 {
            match predicate {
                Predicate::Eq(value) => {
                    paths.push(path.as_str());
                    tuple.push(value.clone());
                }
                _ => return None,
            }
        }
        let name = self.indexes.find_property_index(target, &paths).await?;
        Some((name, tuple))
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn traverse(
        &self,
        strategy: TraversalStrategy,
        start_id: &Uuid,
        end_id: Option<&Uuid>,
        direction: Direction,
        edge_types: Option<&[EdgeType]>,
        max_depth: usize,
        fused_filter: &[FilterCondition],
        index_name: Option<&str>,
        ctx: &ExecCtx,
    ) -> NoemaResult<Items> {
        let start = self
            .store
            .get_node(start_id)
            .await?
            .ok_or(NoemaError::NodeNotFound(*start_id))?;

        if end_id == Some(start_id) {
            return Ok(Items::Nodes(vec![start]));
        }

        if strategy == TraversalStrategy::Bidirectional {
            if let Some(end) = end_id {
                return self
                    .traverse_bidirectional(start_id, end, direction, edge_types, max_depth, ctx)
                    .await;
            }
        }

        let use_index = strategy == TraversalStrategy::IndexBased;
        let mut visited: HashSet<Uuid> = HashSet::from([*start_id]);
        let mut frontier: VecDeque<(Uuid, usize)> = VecDeque::from([(*start_id, 0)]);
        let mut emitted: Vec<Node> = Vec::new();

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            ctx.checkpoint()?;

            let neighbors = self
                .neighbors(&current, direction, edge_types, use_index, index_name)
                .await?;
            for (edge, node) in neighbors {
                if !edge_filter_passes(&edge, fused_filter) {
                    continue;
                }
                if visited.contains(&node.id) {
                    continue;
                }
                visited.insert(node.id);

                let node_id = node.id;
                if node_filter_passes(&node, fused_filter) {
                    match end_id {
                        Some(end) if end == &node_id => return Ok(Items::Nodes(vec![node])),
                        Some(_) => {}
                        None => emitted.push(node),
                    }
                }
                ctx.check_size(emitted.len())?;
                frontier.push_back((node_id, depth + 1));
            }
        }

        if end_id.is_some() {
            // Destination never reached within the depth bound.
            return Ok(Items::Nodes(Vec::new()));
        }
        Ok(Items::Nodes(emitted))
    }

    /// Alternating-frontier search: forward from the start along the query
    /// direction, backward from the end against it. A meeting node proves
    /// reachability within `max_depth`.
    async fn traverse_bidirectional(
        &self,
        start_id: &Uuid,
        end_id: &Uuid,
        direction: Direction,
        edge_types: Option<&[EdgeType]>,
        max_depth: usize,
        ctx: &ExecCtx,
    ) -> NoemaResult<Items> {
        let end = match self.store.get_node(end_id).await? {
            Some(node) => node,
            None => return Ok(Items::Nodes(Vec::new())),
        };

        let mut forward: HashMap<Uuid, usize> = HashMap::from([(*start_id, 0)]);
        let mut backward: HashMap<Uuid, usize> = HashMap::from([(*end_id, 0)]);
        let mut forward_frontier: Vec<Uuid> = vec![*start_id];
        let mut backward_frontier: Vec<Uuid> = vec![*end_id];

        let half = max_depth.div_ceil(2);
        let mut met = false;
        for _ in 0..half {
            ctx.checkpoint()?;

            // Forward first, then backward; each side expands one depth.
            forward_frontier = self
                .expand_frontier(&forward_frontier, &mut forward, direction, edge_types)
                .await?;
            if meets_within(&forward, &backward, max_depth) {
                met = true;
                break;
            }

            ctx.checkpoint()?;
            backward_frontier = self
                .expand_frontier(
                    &backward_frontier,
                    &mut backward,
                    direction.reversed(),
                    edge_types,
                )
                .await?;
            if meets_within(&forward, &backward, max_depth) {
                met = true;
                break;
            }

            if forward_frontier.is_empty() && backward_frontier.is_empty() {
                break;
            }
        }

        if met {
            Ok(Items::Nodes(vec![end]))
        } else {
            Ok(Items::Nodes(Vec::new()))
        }
    }

    async fn expand_frontier(
        &self,
        frontier: &[Uuid],
        depths: &mut HashMap<Uuid, usize>,
        direction: Direction,
        edge_types: Option<&[EdgeType]>,
    ) -> NoemaResult<Vec<Uuid>> {
        let mut next: Vec<Uuid> = Vec::new();
        for id in frontier {
            let depth = depths.get(id).copied().unwrap_or(0);
            for (_, node) in self
                .neighbors(id, direction, edge_types, false, None)
                .await?
            {
                if !depths.contains_key(&node.id) {
                    depths.insert(node.id, depth + 1);
                    next.push(node.id);
                }
            }
        }
        Ok(next)
    }

    async fn neighbors(
        &self,
        id: &Uuid,
        direction: Direction,
        edge_types: Option<&[EdgeType]>,
        use_index: bool,
        index_name: Option<&str>,
    ) -> NoemaResult<Vec<(Edge, Node)>> {
        let edges = if use_index {
            self.indexed_edges(id, direction, edge_types, index_name)
                .await?
        } else {
            self.adjacent_edges(id, direction, edge_types).await?
        };

        let mut out = Vec::with_capacity(edges.len());
        for edge in edges {
            let neighbor_id = if &edge.source_id == id {
                edge.target_id
            } else {
                edge.source_id
            };
            // A node deleted mid-query simply drops out of the expansion.
            if let Some(node) = self.store.get_node(&neighbor_id).await? {
                out.push((edge, node));
            }
        }
        Ok(out)
    }

    async fn adjacent_edges(
        &self,
        id: &Uuid,
        direction: Direction,
        edge_types: Option<&[EdgeType]>,
    ) -> NoemaResult<Vec<Edge>> {
        match direction {
            Direction::Outgoing => self.store.find_edges(Some(id), None, edge_types).await,
            Direction::Incoming => self.store.find_edges(None, Some(id), edge_types).await,
            Direction::Both => {
                let mut edges = self.store.find_edges(Some(id), None, edge_types).await?;
                let incoming = self.store.find_edges(None, Some(id), edge_types).await?;
                let seen: HashSet<Uuid> = edges.iter().map(|e| e.id).collect();
                edges.extend(incoming.into_iter().filter(|e| !seen.contains(&e.id)));
                Ok(edges)
            }
        }
    }

    async fn indexed_edges(
        &self,
        id: &Uuid,
        direction: Direction,
        edge_types: Option<&[EdgeType]>,
        index_name: Option<&str>,
    ) -> NoemaResult<Vec<Edge>> {
        let Some(types) = edge_types else {
            // No concrete key tuple can be formed; use adjacency instead.
            return self.adjacent_edges(id, direction, edge_types).await;
        };

        let mut names: Vec<(String, &str)> = Vec::new();
        match direction {
            Direction::Outgoing | Direction::Both => {
                let name = match index_name {
                    Some(name) => Some(name.to_string()),
                    None => {
                        self.indexes
                            .find_property_index(IndexTarget::Edge, &["source_id", "edge_type"])
                            .await
                    }
                };
                if let Some(name) = name {
                    names.push((name, "out"));
                }
            }
            Direction::Incoming => {}
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(name) = self
                .indexes
                .find_property_index(IndexTarget::Edge, &["target_id", "edge_type"])
                .await
            {
                names.push((name, "in"));
            }
        }
        if names.is_empty() {
            return self.adjacent_edges(id, direction, edge_types).await;
        }

        let mut edges: Vec<Edge> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        for (name, _) in &names {
            for edge_type in types {
                let tuple = vec![
                    Value::String(id.to_string()),
                    Value::String(edge_type.as_str().to_string()),
                ];
                for edge_id in self.indexes.query_property(name, &tuple).await? {
                    if seen.insert(edge_id) {
                        if let Some(edge) = self.store.get_edge(&edge_id).await? {
                            edges.push(edge);
                        }
                    }
                }
            }
        }
        Ok(edges)
    }

    async fn expand(
        &self,
        input: Items,
        direction: Direction,
        edge_types: Option<&[EdgeType]>,
        fused_filter: &[FilterCondition],
        ctx: &ExecCtx,
    ) -> NoemaResult<Items> {
        let nodes = match input {
            Items::Nodes(nodes) => nodes,
            other => {
                let len = other.len();
                if len == 0 {
                    return Ok(Items::Nodes(Vec::new()));
                }
                return Err(NoemaError::InvalidQuery(
                    "expansion requires node input".into(),
                ));
            }
        };

        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut out: Vec<Node> = Vec::new();
        for node in &nodes {
            ctx.checkpoint()?;
            for (edge, neighbor) in self
                .neighbors(&node.id, direction, edge_types, false, None)
                .await?
            {
                if !edge_filter_passes(&edge, fused_filter) {
                    continue;
                }
                if !node_filter_passes(&neighbor, fused_filter) {
                    continue;
                }
                if seen.insert(neighbor.id) {
                    out.push(neighbor);
                }
            }
            ctx.check_size(out.len())?;
        }
        Ok(Items::Nodes(out))
    }
}

fn meets_within(
    forward: &HashMap<Uuid, usize>,
    backward: &HashMap<Uuid, usize>,
    max_depth: usize,
) -> bool {
    forward
        .iter()
        .any(|(id, depth)| backward.get(id).is_some_and(|other| depth + other <= max_depth))
}

// ---------------------------------------------------------------------------
// Pure step implementations
// ---------------------------------------------------------------------------

fn node_filter_passes(node: &Node, conditions: &[FilterCondition]) -> bool {
    conditions
        .iter()
        .filter(|c| !c.property.starts_with("edge."))
        .all(|c| {
            c.predicate
                .matches(node.value_at(strip_node_prefix(&c.property)).as_ref())
        })
}

fn edge_filter_passes(edge: &Edge, conditions: &[FilterCondition]) -> bool {
    conditions
        .iter()
        .filter_map(|c| {
            c.property
                .strip_prefix("edge.")
                .map(|path| (path, &c.predicate))
        })
        .all(|(path, predicate)| predicate.matches(edge.value_at(path).as_ref()))
}

fn apply_filter(input: Items, conditions: &[FilterCondition]) -> Items {
    match input {
        Items::Nodes(items) => Items::Nodes(
            items
                .into_iter()
                .filter(|node| node_filter_passes(node, conditions))
                .collect(),
        ),
        Items::Edges(items) => Items::Edges(
            items
                .into_iter()
                .filter(|edge| {
                    conditions.iter().all(|c| {
                        c.predicate
                            .matches(edge.value_at(strip_node_prefix(&c.property)).as_ref())
                    })
                })
                .collect(),
        ),
        Items::Values(items) => Items::Values(
            items
                .into_iter()
                .filter(|value| {
                    conditions
                        .iter()
                        .all(|c| c.predicate.matches(value.value_at(&c.property).as_ref()))
                })
                .collect(),
        ),
    }
}

fn apply_sort(input: Items, keys: &[SortKey]) -> Items {
    let compare = |a: &[Option<Value>], b: &[Option<Value>]| -> Ordering {
        for (i, key) in keys.iter().enumerate() {
            let base = match (&a[i], &b[i]) {
                (None, None) => Ordering::Equal,
                // Nulls sort last in ascending order.
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
            };
            let ord = match key.direction {
                SortDirection::Asc => base,
                SortDirection::Desc => base.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    };

    fn sort_with<T>(
        mut items: Vec<T>,
        keys: &[SortKey],
        accessor: impl Fn(&T, &str) -> Option<Value>,
        compare: impl Fn(&[Option<Value>], &[Option<Value>]) -> Ordering,
    ) -> Vec<T> {
        let mut keyed: Vec<(Vec<Option<Value>>, usize)> = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                (
                    keys.iter()
                        .map(|key| accessor(item, &key.property))
                        .collect(),
                    i,
                )
            })
            .collect();
        keyed.sort_by(|(a, ai), (b, bi)| compare(a, b).then_with(|| ai.cmp(bi)));

        let mut slots: Vec<Option<T>> = items.drain(..).map(Some).collect();
        keyed
            .into_iter()
            .filter_map(|(_, i)| slots[i].take())
            .collect()
    }

    match input {
        Items::Nodes(items) => Items::Nodes(sort_with(
            items,
            keys,
            |n, p| n.value_at(strip_node_prefix(p)),
            compare,
        )),
        Items::Edges(items) => Items::Edges(sort_with(
            items,
            keys,
            |e, p| e.value_at(strip_node_prefix(p)),
            compare,
        )),
        Items::Values(items) => Items::Values(sort_with(items, keys, |v, p| v.value_at(p), compare)),
    }
}

fn apply_limit(input: Items, limit: Option<usize>, offset: usize) -> Items {
    fn slice<T>(items: Vec<T>, limit: Option<usize>, offset: usize) -> Vec<T> {
        items
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    match input {
        Items::Nodes(items) => Items::Nodes(slice(items, limit, offset)),
        Items::Edges(items) => Items::Edges(slice(items, limit, offset)),
        Items::Values(items) => Items::Values(slice(items, limit, offset)),
    }
}

/// Rebuild each item as a nested object containing only the requested paths.
fn apply_projection(input: Items, paths: &[String]) -> NoemaResult<Items> {
    let count = input.len();
    let mut projected: Vec<Value> = Vec::with_capacity(count);
    for i in 0..count {
        let mut object = Value::Object(serde_json::Map::new());
        for path in paths {
            if let Some(value) = input.value_at(i, path) {
                insert_at_path(&mut object, path, value);
            }
        }
        projected.push(object);
    }
    Ok(Items::Values(projected))
}

fn insert_at_path(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let map = match current {
            Value::Object(map) => map,
            _ => return,
        };
        if i + 1 == segments.len() {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

fn apply_aggregate(
    input: Items,
    aggregation: Aggregation,
    field: Option<&str>,
) -> NoemaResult<Items> {
    let count = input.len();
    let field_values: Vec<Option<Value>> = match field {
        Some(path) => (0..count).map(|i| input.value_at(i, path)).collect(),
        None => vec![None; count],
    };
    let numeric: Vec<f64> = field_values
        .iter()
        .filter_map(|v| v.as_ref().and_then(Value::as_f64))
        .collect();

    let single = |key: &str, value: Value| -> Items {
        let mut map = serde_json::Map::new();
        map.insert(key.to_string(), value);
        Items::Values(vec![Value::Object(map)])
    };

    let number = |n: f64| -> Value {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    };

    Ok(match aggregation {
        Aggregation::Count => single("count", Value::from(count)),
        Aggregation::Sum => single("sum", number(numeric.iter().sum())),
        Aggregation::Avg => {
            let avg = if numeric.is_empty() {
                Value::Null
            } else {
                number(numeric.iter().sum::<f64>() / numeric.len() as f64)
            };
            single("avg", avg)
        }
        Aggregation::Min => single(
            "min",
            numeric
                .iter()
                .copied()
                .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
                .map(number)
                .unwrap_or(Value::Null),
        ),
        Aggregation::Max => single(
            "max",
            numeric
                .iter()
                .copied()
                .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
                .map(number)
                .unwrap_or(Value::Null),
        ),
        Aggregation::Group => {
            let values = input.into_values()?;
            let mut groups: HashMap<String, (usize, Vec<Value>)> = HashMap::new();
            for (value, key) in values.into_iter().zip(field_values) {
                let group_key = match key {
                    Some(Value::String(s)) => s,
                    Some(Value::Null) | None => "null".to_string(),
                    Some(other) => other.to_string(),
                };
                let entry = groups.entry(group_key).or_insert_with(|| (0, Vec::new()));
                entry.0 += 1;
                entry.1.push(value);
            }

            let mut keys: Vec<String> = groups.keys().cloned().collect();
            keys.sort();
            let items = keys
                .into_iter()
                .map(|key| {
                    let (count, items) = groups.remove(&key).expect("key just listed");
                    serde_json::json!({
                        "group": key,
                        "count": count,
                        "items": items,
                    })
                })
                .collect();
            Items::Values(items)
        }
    })
}

enum SetOp {
    Union,
    Intersection,
    Difference,
}

/// Entity-id based set combination; value streams combine by equality.
fn combine(left: Items, right: Items, op: SetOp) -> NoemaResult<Items> {
    match (left, right) {
        (Items::Nodes(left), Items::Nodes(right)) => {
            Ok(Items::Nodes(combine_by_id(left, right, |n| n.id, op)))
        }
        (Items::Edges(left), Items::Edges(right)) => {
            Ok(Items::Edges(combine_by_id(left, right, |e| e.id, op)))
        }
        (left, right) => {
            let left = left.into_values()?;
            let right = right.into_values()?;
            let result = match op {
                SetOp::Union => {
                    let mut out = left;
                    for value in right {
                        if !out.contains(&value) {
                            out.push(value);
                        }
                    }
                    out
                }
                SetOp::Intersection => left.into_iter().filter(|v| right.contains(v)).collect(),
                SetOp::Difference => left.into_iter().filter(|v| !right.contains(v)).collect(),
            };
            Ok(Items::Values(result))
        }
    }
}

fn combine_by_id<T>(
    left: Vec<T>,
    right: Vec<T>,
    id_of: impl Fn(&T) -> Uuid,
    op: SetOp,
) -> Vec<T> {
    let right_ids: HashSet<Uuid> = right.iter().map(&id_of).collect();
    match op {
        SetOp::Union => {
            let left_ids: HashSet<Uuid> = left.iter().map(&id_of).collect();
            let mut out = left;
            out.extend(right.into_iter().filter(|t| !left_ids.contains(&id_of(t))));
            out
        }
        SetOp::Intersection => left
            .into_iter()
            .filter(|t| right_ids.contains(&id_of(t)))
            .collect(),
        SetOp::Difference => left
            .into_iter()
            .filter(|t| !right_ids.contains(&id_of(t)))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexingConfig;
    use crate::model::node::NodeType;
    use crate::query::{QueryShape, QuerySpec};
    use crate::store::InMemoryGraphStore;
    use serde_json::json;

    struct Fixture {
        processor: QueryProcessor,
        store: Arc<InMemoryGraphStore>,
        ids: Vec<Uuid>,
    }

    /// Chain a -> b -> c -> d with RelatedTo edges and ranked properties.
    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryGraphStore::new());
        let indexes = Arc::new(IndexManager::new(IndexingConfig::default()));

        let mut ids = Vec::new();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            let node = Node::new(NodeType::Concept)
                .with_property("name", *name)
                .with_property("rank", i as i64);
            ids.push(store.put_node(node).await.unwrap());
        }
        for pair in ids.windows(2) {
            store
                .put_edge(Edge::new(EdgeType::RelatedTo, pair[0], pair[1]))
                .await
                .unwrap();
        }

        let processor = QueryProcessor::new(
            store.clone(),
            indexes,
            QueryProcessorConfig::default(),
        );
        Fixture {
            processor,
            store,
            ids,
        }
    }

    #[tokio::test]
    async fn node_lookup_by_id_and_criteria() {
        let f = fixture().await;

        let by_id = f
            .processor
            .execute(&QuerySpec::node_by_id(f.ids[0]), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(by_id.items.len(), 1);
        assert_eq!(by_id.items[0]["properties"]["name"], json!("a"));
        assert_eq!(by_id.metadata.plan_cost, 1);

        let by_criteria = f
            .processor
            .execute(
                &QuerySpec::nodes(Criteria::new().eq("properties.name", "c")),
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_criteria.items.len(), 1);
        assert_eq!(by_criteria.metadata.plan_cost, 100);
    }

    #[tokio::test]
    async fn traversal_emits_reachable_nodes_excluding_start() {
        let f = fixture().await;
        let mut spec = QuerySpec::traversal(f.ids[0]);
        if let QueryShape::Traversal { max_depth, .. } = &mut spec.shape {
            *max_depth = 2;
        }

        let result = f
            .processor
            .execute(&spec, &QueryOptions::default())
            .await
            .unwrap();
        let names: Vec<&str> = result
            .items
            .iter()
            .map(|i| i["properties"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn traversal_with_destination_returns_only_it() {
        let f = fixture().await;
        let mut spec = QuerySpec::traversal(f.ids[0]);
        if let QueryShape::Traversal {
            end_id, max_depth, ..
        } = &mut spec.shape
        {
            *end_id = Some(f.ids[3]);
            *max_depth = 5;
        }

        let result = f
            .processor
            .execute(&spec, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0]["properties"]["name"], json!("d"));
    }

    #[tokio::test]
    async fn filter_sort_limit_projection_pipeline() {
        let f = fixture().await;
        let spec = QuerySpec::nodes(Criteria::new().eq("type", "Concept"))
            .with_filter("properties.rank", Predicate::Gte(json!(1)))
            .with_sort("properties.rank", SortDirection::Desc)
            .with_limit(2)
            .with_projection(vec!["properties.name".into()]);

        let result = f
            .processor
            .execute(&spec, &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(
            result.items,
            vec![
                json!({"properties": {"name": "d"}}),
                json!({"properties": {"name": "c"}}),
            ]
        );
    }

    #[tokio::test]
    async fn sort_places_nulls_last_ascending() {
        let f = fixture().await;
        let extra = Node::new(NodeType::Concept).with_property("name", "unranked");
        f.store.put_node(extra).await.unwrap();

        let spec = QuerySpec::nodes(Criteria::new().eq("type", "Concept"))
            .with_sort("properties.rank", SortDirection::Asc);
        let result = f
            .processor
            .execute(&spec, &QueryOptions::default())
            .await
            .unwrap();
        let last = result.items.last().unwrap();
        assert_eq!(last["properties"]["name"], json!("unranked"));

        let spec = QuerySpec::nodes(Criteria::new().eq("type", "Concept"))
            .with_sort("properties.rank", SortDirection::Desc);
        let result = f
            .processor
            .execute(&spec, &QueryOptions::default())
            .await
            .unwrap();
        let first = result.items.first().unwrap();
        assert_eq!(first["properties"]["name"], json!("unranked"));
    }

    #[tokio::test]
    async fn aggregate_count_sum_and_group() {
        let f = fixture().await;
        let target = QueryShape::Node {
            id: None,
            criteria: Some(Criteria::new().eq("type", "Concept")),
        };

        let count = f
            .processor
            .execute(
                &QuerySpec::new(QueryShape::Aggregate {
                    target: Box::new(target.clone()),
                    aggregation: Aggregation::Count,
                    field: None,
                }),
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(count.items, vec![json!({"count": 4})]);

        let sum = f
            .processor
            .execute(
                &QuerySpec::new(QueryShape::Aggregate {
                    target: Box::new(target.clone()),
                    aggregation: Aggregation::Sum,
                    field: Some("properties.rank".into()),
                }),
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(sum.items, vec![json!({"sum": 6.0})]);

        let group = f
            .processor
            .execute(
                &QuerySpec::new(QueryShape::Aggregate {
                    target: Box::new(target),
                    aggregation: Aggregation::Group,
                    field: Some("properties.name".into()),
                }),
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(group.items.len(), 4);
        assert_eq!(group.items[0]["group"], json!("a"));
        assert_eq!(group.items[0]["count"], json!(1));
    }

    #[tokio::test]
    async fn group_uses_null_key_for_missing_field() {
        let f = fixture().await;
        let result = f
            .processor
            .execute(
                &QuerySpec::new(QueryShape::Aggregate {
                    target: Box::new(QueryShape::Node {
                        id: None,
                        criteria: Some(Criteria::new().eq("type", "Concept")),
                    }),
                    aggregation: Aggregation::Group,
                    field: Some("properties.absent".into()),
                }),
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0]["group"], json!("null"));
        assert_eq!(result.items[0]["count"], json!(4));
    }

    #[tokio::test]
    async fn cancellation_aborts_execution() {
        let f = fixture().await;
        let token = CancellationToken::new();
        token.cancel();

        let err = f
            .processor
            .execute(
                &QuerySpec::nodes(Criteria::new().eq("type", "Concept")),
                &QueryOptions::default().with_cancellation(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NoemaError::Cancelled));
    }

    #[tokio::test]
    async fn result_size_limit_is_enforced() {
        let store = Arc::new(InMemoryGraphStore::new());
        let indexes = Arc::new(IndexManager::new(IndexingConfig::default()));
        for i in 0..5 {
            store
                .put_node(Node::new(NodeType::Concept).with_property("i", i))
                .await
                .unwrap();
        }
        let processor = QueryProcessor::new(
            store,
            indexes,
            QueryProcessorConfig {
                max_result_size: 3,
                ..QueryProcessorConfig::default()
            },
        );

        let err = processor
            .execute(
                &QuerySpec::nodes(Criteria::new().eq("type", "Concept")),
                &QueryOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NoemaError::ResultTooLarge { limit: 3 }));
    }

    #[tokio::test]
    async fn pattern_chain_emits_final_segment_nodes() {
        let f = fixture().await;
        let pattern = vec![
            crate::query::PatternSegment {
                node_type: None,
                criteria: Some(Criteria::new().eq("properties.name", "a")),
                edge: Some(crate::query::EdgeStep {
                    edge_type: Some(EdgeType::RelatedTo),
                    direction: Direction::Outgoing,
                }),
            },
            crate::query::PatternSegment {
                node_type: None,
                criteria: None,
                edge: Some(crate::query::EdgeStep {
                    edge_type: Some(EdgeType::RelatedTo),
                    direction: Direction::Outgoing,
                }),
            },
            crate::query::PatternSegment {
                node_type: None,
                criteria: Some(Criteria::new().eq("properties.name", "c")),
                edge: None,
            },
        ];

        let result = f
            .processor
            .execute(
                &QuerySpec::new(QueryShape::Pattern { pattern }),
                &QueryOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0]["properties"]["name"], json!("c"));
    }

    #[tokio::test]
    async fn union_and_difference_combine_by_id() {
        let f = fixture().await;
        let ctx = ExecCtx {
            started: Instant::now(),
            deadline: Instant::now() + Duration::from_secs(5),
            timeout: Duration::from_secs(5),
            cancellation: CancellationToken::new(),
            max_result_size: 100,
        };

        let left = PlanStep::NodeLookupByCriteria {
            criteria: Criteria::new().eq("properties.name", "a"),
        };
        let union = PlanStep::Union {
            right: vec![PlanStep::NodeLookupByCriteria {
                criteria: Criteria::new().eq("properties.name", "b"),
            }],
        };
        let out = f
            .processor
            .run_steps(&[left.clone(), union], Items::empty(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.len(), 2);

        let difference = PlanStep::Difference {
            right: vec![PlanStep::NodeLookupByCriteria {
                criteria: Criteria::new().eq("properties.name", "a"),
            }],
        };
        let out = f
            .processor
            .run_steps(&[left, difference], Items::empty(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.len(), 0);
    }

    #[tokio::test]
    async fn explain_does_not_touch_the_store() {
        let f = fixture().await;
        let nodes_before = f.store.node_count().await;

        let explanation = f
            .processor
            .explain(&QuerySpec::node_by_id(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(!explanation.candidates.is_empty());
        assert_eq!(f.store.node_count().await, nodes_before);
    }
}
