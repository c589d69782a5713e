use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advanced::{
    AdvancedQueryEngine, AdvancedQuerySpec, GraphPath, GraphPattern, PathOptions, PatternMatch,
    ScoredNode, SemanticQuery, SemanticSearchOptions,
};
use crate::cache::{
    CachePut, CacheSource, CacheStats, InvalidationCriteria, SemanticCache,
};
use crate::config::NoemaConfig;
use crate::error::{NoemaError, NoemaResult};
use crate::event::{EventBus, GraphEvent};
use crate::index::{EntityRef, IndexManager, IndexSpec, IndexStats, IndexTarget};
use crate::model::edge::{Edge, EdgePatch};
use crate::model::embedding::{EmbeddingProvider, HashEmbedder};
use crate::model::node::{Node, NodePatch};
use crate::query::{
    QueryExplanation, QueryMetadata, QueryOptions, QueryProcessor, QueryResult, QuerySpec,
};
use crate::store::{CascadePolicy, GraphStore, InMemoryGraphStore};

// ---------------------------------------------------------------------------
// NoemaEngine: the coordinating facade over store, indexes, cache, queries
// ---------------------------------------------------------------------------

/// The single entry point of the engine.
///
/// Construction wires the components in dependency order (graph store, index
/// manager, semantic cache, query processor, advanced engine); `initialize`
/// makes the public surface live. Every mutating operation runs under one
/// write critical section covering store, indexes, and cache, and emits its
/// observable event before the section ends, so event order equals lock
/// acquisition order.
#[derive(Clone)]
pub struct NoemaEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: NoemaConfig,
    store: Arc<dyn GraphStore>,
    indexes: Arc<IndexManager>,
    cache: Arc<SemanticCache>,
    query: QueryProcessor,
    advanced: AdvancedQueryEngine,
    events: EventBus,
    write_lock: Arc<RwLock<()>>,
    initialized: AtomicBool,
}

/// Builder for a [`NoemaEngine`] with pluggable store and embedding provider.
pub struct NoemaEngineBuilder {
    config: NoemaConfig,
    store: Option<Arc<dyn GraphStore>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl NoemaEngineBuilder {
    pub fn new(config: NoemaConfig) -> Self {
        Self {
            config,
            store: None,
            embedder: None,
        }
    }

    /// Use a custom (e.g. durable) graph store behind the standard contract.
    pub fn with_store(mut self, store: Arc<dyn GraphStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a real embedding provider instead of the deterministic fallback.
    pub fn with_embedding_provider(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn build(self) -> NoemaEngine {
        let config = self.config;

        // Components come up leaves-first: store, indexes, cache, query
        // processor, advanced engine.
        let store: Arc<dyn GraphStore> = self.store.unwrap_or_else(|| {
            let policy = if config.graph.cascade_delete {
                CascadePolicy::Cascade
            } else {
                CascadePolicy::Reject
            };
            Arc::new(InMemoryGraphStore::with_cascade_policy(policy))
        });
        let indexes = Arc::new(IndexManager::new(config.indexing.clone()));
        let embedder: Arc<dyn EmbeddingProvider> = self.embedder.unwrap_or_else(|| {
            Arc::new(HashEmbedder::new(config.semantic_cache.embedding_dimensions))
        });
        let cache = Arc::new(SemanticCache::new(
            config.semantic_cache.clone(),
            embedder.clone(),
        ));
        // Readers hold this gate shared per step so they never observe a
        // store/index mutation mid-flight; writers hold it exclusively.
        let write_lock = Arc::new(RwLock::new(()));
        let query = QueryProcessor::new(
            store.clone(),
            indexes.clone(),
            config.query_processor.clone(),
        )
        .with_write_gate(write_lock.clone());
        let advanced = AdvancedQueryEngine::new(
            store.clone(),
            indexes.clone(),
            embedder,
            config.advanced_query.clone(),
        )
        .with_write_gate(write_lock.clone());

        NoemaEngine {
            inner: Arc::new(EngineInner {
                config,
                store,
                indexes,
                cache,
                query,
                advanced,
                events: EventBus::default(),
                write_lock,
                initialized: AtomicBool::new(false),
            }),
        }
    }
}

/// Aggregate counters across all components.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub nodes: usize,
    pub edges: usize,
    pub indexes: HashMap<String, IndexStats>,
    pub cache: CacheStats,
}

/// Typed semantic-search response, carrying cache provenance when served
/// from the semantic cache.
#[derive(Debug, Clone, Serialize)]
pub struct SemanticSearchResult {
    pub items: Vec<ScoredNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_source: Option<CacheSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
}

impl NoemaEngine {
    pub fn builder(config: NoemaConfig) -> NoemaEngineBuilder {
        NoemaEngineBuilder::new(config)
    }

    /// An engine with default configuration and in-memory components.
    pub fn in_memory() -> Self {
        Self::builder(NoemaConfig::default()).build()
    }

    pub fn config(&self) -> &NoemaConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring the engine online and emit `initialized`.
    pub async fn initialize(&self) -> NoemaResult<()> {
        let _guard = self.inner.write_lock.write().await;
        if self.inner.initialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("noema engine initialized");
        self.inner.events.emit(GraphEvent::Initialized);
        Ok(())
    }

    /// Take the engine offline and emit `shutdown`. The graph itself is left
    /// intact; only cached results are dropped.
    pub async fn shutdown(&self) -> NoemaResult<()> {
        let _guard = self.inner.write_lock.write().await;
        if !self.inner.initialized.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.cache.clear();
        info!("noema engine shut down");
        self.inner.events.emit(GraphEvent::Shutdown);
        Ok(())
    }

    /// Subscribe to graph events.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.inner.events.subscribe()
    }

    fn ensure_initialized(&self) -> NoemaResult<()> {
        if self.inner.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(NoemaError::NotInitialized)
        }
    }

    // -----------------------------------------------------------------------
    // Node CRUD
    // -----------------------------------------------------------------------

    pub async fn add_node(&self, node: Node) -> NoemaResult<Uuid> {
        self.ensure_initialized()?;
        let node_type = node.node_type;

        let guard = self.inner.write_lock.write().await;
        let id = self
            .inner
            .store
            .put_node(node.clone())
            .await
            .map_err(|e| e.in_op("add_node"))?;

        if let Err(err) = self.index_with_retry(EntityRef::Node(&node)).await {
            // The index could not be brought in line; revert the insert so
            // store and indexes stay consistent.
            self.inner.indexes.remove_entity(&id).await;
            let _ = self.inner.store.delete_node(&id).await;
            return Err(NoemaError::Backend(format!("index update failed: {err}"))
                .in_op("add_node"));
        }

        self.inner
            .cache
            .invalidate(&InvalidationCriteria::Entity(id));
        self.inner.events.emit(GraphEvent::NodeAdded { id, node_type });
        drop(guard);
        Ok(id)
    }

    pub async fn get_node(&self, id: &Uuid) -> NoemaResult<Option<Node>> {
        self.ensure_initialized()?;
        self.inner
            .store
            .get_node(id)
            .await
            .map_err(|e| e.in_op("get_node"))
    }

    pub async fn update_node(&self, id: &Uuid, patch: &NodePatch) -> NoemaResult<Node> {
        self.ensure_initialized()?;

        let guard = self.inner.write_lock.write().await;
        let before = self
            .inner
            .store
            .get_node(id)
            .await
            .map_err(|e| e.in_op("update_node"))?
            .ok_or(NoemaError::NodeNotFound(*id))?;
        let updated = self
            .inner
            .store
            .update_node(id, patch)
            .await
            .map_err(|e| e.in_op("update_node"))?;

        if let Err(err) = self.reindex_with_retry(EntityRef::Node(&updated)).await {
            let _ = self.inner.store.restore_node(before.clone()).await;
            if self
                .inner
                .indexes
                .reindex_entity(EntityRef::Node(&before))
                .await
                .is_err()
            {
                self.inner.indexes.remove_entity(id).await;
            }
            return Err(NoemaError::Backend(format!("index update failed: {err}"))
                .in_op("update_node"));
        }

        self.inner
            .cache
            .invalidate(&InvalidationCriteria::Entity(*id));
        self.inner.events.emit(GraphEvent::NodeUpdated { id: *id });
        drop(guard);
        Ok(updated)
    }

    /// Delete a node. Under the default policy the call fails while incident
    /// edges exist; with cascade enabled those edges are removed too, and an
    /// `edge_deleted` event precedes the node's own.
    pub async fn delete_node(&self, id: &Uuid) -> NoemaResult<()> {
        self.ensure_initialized()?;

        let guard = self.inner.write_lock.write().await;
        let removed_edges = self
            .inner
            .store
            .delete_node(id)
            .await
            .map_err(|e| e.in_op("delete_node"))?;

        self.inner.indexes.remove_entity(id).await;
        self.inner
            .cache
            .invalidate(&InvalidationCriteria::Entity(*id));

        for edge in &removed_edges {
            self.inner.indexes.remove_entity(&edge.id).await;
            self.invalidate_edge_entries(edge);
            self.inner
                .events
                .emit(GraphEvent::EdgeDeleted { id: edge.id });
        }
        self.inner.events.emit(GraphEvent::NodeDeleted { id: *id });
        drop(guard);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Edge CRUD
    // -----------------------------------------------------------------------

    pub async fn add_edge(&self, edge: Edge) -> NoemaResult<Uuid> {
        self.ensure_initialized()?;
        let (source, target, edge_type) = (edge.source_id, edge.target_id, edge.edge_type);

        let guard = self.inner.write_lock.write().await;
        let id = self
            .inner
            .store
            .put_edge(edge.clone())
            .await
            .map_err(|e| e.in_op("add_edge"))?;

        if let Err(err) = self.index_with_retry(EntityRef::Edge(&edge)).await {
            self.inner.indexes.remove_entity(&id).await;
            let _ = self.inner.store.delete_edge(&id).await;
            return Err(NoemaError::Backend(format!("index update failed: {err}"))
                .in_op("add_edge"));
        }

        self.invalidate_edge_entries(&edge);
        self.inner.events.emit(GraphEvent::EdgeAdded {
            id,
            source,
            target,
            edge_type,
        });
        drop(guard);
        Ok(id)
    }

    pub async fn get_edge(&self, id: &Uuid) -> NoemaResult<Option<Edge>> {
        self.ensure_initialized()?;
        self.inner
            .store
            .get_edge(id)
            .await
            .map_err(|e| e.in_op("get_edge"))
    }

    pub async fn update_edge(&self, id: &Uuid, patch: &EdgePatch) -> NoemaResult<Edge> {
        self.ensure_initialized()?;

        let guard = self.inner.write_lock.write().await;
        let before = self
            .inner
            .store
            .get_edge(id)
            .await
            .map_err(|e| e.in_op("update_edge"))?
            .ok_or(NoemaError::EdgeNotFound(*id))?;
        let updated = self
            .inner
            .store
            .update_edge(id, patch)
            .await
            .map_err(|e| e.in_op("update_edge"))?;

        if let Err(err) = self.reindex_with_retry(EntityRef::Edge(&updated)).await {
            let _ = self.inner.store.restore_edge(before.clone()).await;
            if self
                .inner
                .indexes
                .reindex_entity(EntityRef::Edge(&before))
                .await
                .is_err()
            {
                self.inner.indexes.remove_entity(id).await;
            }
            return Err(NoemaError::Backend(format!("index update failed: {err}"))
                .in_op("update_edge"));
        }

        self.invalidate_edge_entries(&updated);
        self.inner.events.emit(GraphEvent::EdgeUpdated { id: *id });
        drop(guard);
        Ok(updated)
    }

    pub async fn delete_edge(&self, id: &Uuid) -> NoemaResult<()> {
        self.ensure_initialized()?;

        let guard = self.inner.write_lock.write().await;
        let removed = self
            .inner
            .store
            .delete_edge(id)
            .await
            .map_err(|e| e.in_op("delete_edge"))?;

        self.inner.indexes.remove_entity(id).await;
        self.invalidate_edge_entries(&removed);
        self.inner.events.emit(GraphEvent::EdgeDeleted { id: *id });
        drop(guard);
        Ok(())
    }

    /// An edge mutation can change which nodes are reachable from its
    /// endpoints, so cached entries citing either endpoint go too.
    fn invalidate_edge_entries(&self, edge: &Edge) {
        for id in [edge.id, edge.source_id, edge.target_id] {
            self.inner
                .cache
                .invalidate(&InvalidationCriteria::Entity(id));
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Execute a structured query, consulting the semantic cache first.
    pub async fn execute_query(
        &self,
        spec: &QuerySpec,
        opts: &QueryOptions,
    ) -> NoemaResult<QueryResult> {
        self.ensure_initialized()?;
        let query_value = spec.canonical();
        let context = json!({"op": "execute_query"});

        if !opts.bypass_cache {
            if let Some(hit) = self
                .inner
                .cache
                .lookup(&query_value, &context, opts.similarity_threshold)
                .await
            {
                debug!(source = ?hit.source, "query served from cache");
                let items = match hit.value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                return Ok(QueryResult {
                    items,
                    metadata: QueryMetadata {
                        cache_source: Some(hit.source),
                        similarity: hit.similarity,
                        ..QueryMetadata::default()
                    },
                });
            }
        }

        let result = self
            .inner
            .query
            .execute(spec, opts)
            .await
            .map_err(|e| e.in_op("execute_query"))?;

        if !opts.bypass_cache {
            let refs = self.query_entity_refs(spec, &result);
            self.inner
                .cache
                .insert(
                    &query_value,
                    &context,
                    Value::Array(result.items.clone()),
                    CachePut {
                        entity_refs: refs,
                        ..CachePut::default()
                    },
                )
                .await;
        }
        Ok(result)
    }

    /// Execute a tagged advanced query (paths, pattern, or semantic) with
    /// the same cache integration as `execute_query`.
    pub async fn execute_advanced_query(
        &self,
        spec: &AdvancedQuerySpec,
        opts: &QueryOptions,
    ) -> NoemaResult<QueryResult> {
        self.ensure_initialized()?;
        let query_value = serde_json::to_value(spec)?;
        let context = json!({"op": "execute_advanced_query"});

        if !opts.bypass_cache {
            if let Some(hit) = self
                .inner
                .cache
                .lookup(&query_value, &context, opts.similarity_threshold)
                .await
            {
                let items = match hit.value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                return Ok(QueryResult {
                    items,
                    metadata: QueryMetadata {
                        cache_source: Some(hit.source),
                        similarity: hit.similarity,
                        ..QueryMetadata::default()
                    },
                });
            }
        }

        let items = self
            .inner
            .advanced
            .execute(spec, opts)
            .await
            .map_err(|e| e.in_op("execute_advanced_query"))?;
        let result = QueryResult {
            items,
            metadata: QueryMetadata::default(),
        };

        if !opts.bypass_cache {
            let refs: HashSet<Uuid> = result.referenced_ids().into_iter().collect();
            self.inner
                .cache
                .insert(
                    &query_value,
                    &context,
                    Value::Array(result.items.clone()),
                    CachePut {
                        entity_refs: refs,
                        ..CachePut::default()
                    },
                )
                .await;
        }
        Ok(result)
    }

    /// Candidate plans with costs; never executes and never caches.
    pub async fn explain_query(&self, spec: &QuerySpec) -> NoemaResult<QueryExplanation> {
        self.ensure_initialized()?;
        self.inner
            .query
            .explain(spec)
            .await
            .map_err(|e| e.in_op("explain_query"))
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    pub async fn find_paths(
        &self,
        start: &Uuid,
        end: &Uuid,
        options: &PathOptions,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<GraphPath>> {
        self.ensure_initialized()?;
        let query_value = json!({
            "op": "find_paths",
            "start": start,
            "end": end,
            "options": serde_json::to_value(options)?,
        });
        let context = json!({"op": "find_paths"});

        if !opts.bypass_cache {
            if let Some(hit) = self
                .inner
                .cache
                .lookup(&query_value, &context, opts.similarity_threshold)
                .await
            {
                if let Ok(paths) = serde_json::from_value::<Vec<GraphPath>>(hit.value) {
                    return Ok(paths);
                }
            }
        }

        let paths = self
            .inner
            .advanced
            .find_paths(start, end, options, opts)
            .await
            .map_err(|e| e.in_op("find_paths"))?;

        if !opts.bypass_cache {
            let mut refs: HashSet<Uuid> = HashSet::from([*start, *end]);
            for path in &paths {
                refs.extend(path.nodes.iter().map(|n| n.id));
                refs.extend(path.edges.iter().map(|e| e.id));
            }
            self.inner
                .cache
                .insert(
                    &query_value,
                    &context,
                    serde_json::to_value(&paths)?,
                    CachePut {
                        entity_refs: refs,
                        ..CachePut::default()
                    },
                )
                .await;
        }
        Ok(paths)
    }

    pub async fn find_patterns(
        &self,
        pattern: &GraphPattern,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<PatternMatch>> {
        self.ensure_initialized()?;
        let query_value = json!({
            "op": "find_patterns",
            "pattern": serde_json::to_value(pattern)?,
        });
        let context = json!({"op": "find_patterns"});

        if !opts.bypass_cache {
            if let Some(hit) = self
                .inner
                .cache
                .lookup(&query_value, &context, opts.similarity_threshold)
                .await
            {
                if let Ok(matches) = serde_json::from_value::<Vec<PatternMatch>>(hit.value) {
                    return Ok(matches);
                }
            }
        }

        let matches = self
            .inner
            .advanced
            .find_patterns(pattern, opts)
            .await
            .map_err(|e| e.in_op("find_patterns"))?;

        if !opts.bypass_cache {
            let mut refs: HashSet<Uuid> = HashSet::new();
            for found in &matches {
                refs.extend(found.bindings.iter().copied());
                refs.extend(found.edges.iter().map(|e| e.id));
            }
            self.inner
                .cache
                .insert(
                    &query_value,
                    &context,
                    serde_json::to_value(&matches)?,
                    CachePut {
                        entity_refs: refs,
                        ..CachePut::default()
                    },
                )
                .await;
        }
        Ok(matches)
    }

    /// Similarity search with cache provenance: repeated identical queries
    /// come back `exact`, close paraphrases come back `semantic` with the
    /// similarity attached.
    pub async fn semantic_search(
        &self,
        query: &SemanticQuery,
        options: &SemanticSearchOptions,
        opts: &QueryOptions,
    ) -> NoemaResult<SemanticSearchResult> {
        self.ensure_initialized()?;
        // Text queries cache under the raw text so the approximate key
        // reflects what the user actually asked.
        let query_value = match query {
            SemanticQuery::Text(text) => Value::String(text.clone()),
            other => serde_json::to_value(other)?,
        };
        let context = json!({
            "op": "semantic_search",
            "options": serde_json::to_value(options)?,
        });

        if !opts.bypass_cache {
            if let Some(hit) = self
                .inner
                .cache
                .lookup(&query_value, &context, opts.similarity_threshold)
                .await
            {
                if let Ok(items) = serde_json::from_value::<Vec<ScoredNode>>(hit.value) {
                    return Ok(SemanticSearchResult {
                        items,
                        cache_source: Some(hit.source),
                        similarity: hit.similarity,
                    });
                }
            }
        }

        let items = self
            .inner
            .advanced
            .semantic_search(query, options, opts)
            .await
            .map_err(|e| e.in_op("semantic_search"))?;

        if !opts.bypass_cache {
            let refs: HashSet<Uuid> = items.iter().map(|hit| hit.node.id).collect();
            self.inner
                .cache
                .insert(
                    &query_value,
                    &context,
                    serde_json::to_value(&items)?,
                    CachePut {
                        entity_refs: refs,
                        ..CachePut::default()
                    },
                )
                .await;
        }

        Ok(SemanticSearchResult {
            items,
            cache_source: None,
            similarity: None,
        })
    }

    pub async fn find_similar_nodes(
        &self,
        node_id: &Uuid,
        options: &SemanticSearchOptions,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<ScoredNode>> {
        self.ensure_initialized()?;
        self.inner
            .advanced
            .find_similar_nodes(node_id, options, opts)
            .await
            .map_err(|e| e.in_op("find_similar_nodes"))
    }

    // -----------------------------------------------------------------------
    // Neighborhood reads
    // -----------------------------------------------------------------------

    /// Direct neighbors of a node with the connecting edges.
    pub async fn neighbors(
        &self,
        id: &Uuid,
        direction: crate::query::Direction,
        edge_types: Option<&[crate::model::edge::EdgeType]>,
    ) -> NoemaResult<Vec<(Edge, Node)>> {
        self.ensure_initialized()?;
        use crate::query::Direction;

        let mut edges = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            edges.extend(
                self.inner
                    .store
                    .find_edges(Some(id), None, edge_types)
                    .await
                    .map_err(|e| e.in_op("neighbors"))?,
            );
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            let incoming = self
                .inner
                .store
                .find_edges(None, Some(id), edge_types)
                .await
                .map_err(|e| e.in_op("neighbors"))?;
            let seen: HashSet<Uuid> = edges.iter().map(|e| e.id).collect();
            edges.extend(incoming.into_iter().filter(|e| !seen.contains(&e.id)));
        }

        let mut out = Vec::with_capacity(edges.len());
        for edge in edges {
            let neighbor = if &edge.source_id == id {
                edge.target_id
            } else {
                edge.source_id
            };
            if let Some(node) = self.inner.store.get_node(&neighbor).await? {
                out.push((edge, node));
            }
        }
        Ok(out)
    }

    /// The nodes and edges reachable from a root within `depth` hops.
    pub async fn subgraph(&self, root: &Uuid, depth: usize) -> NoemaResult<(Vec<Node>, Vec<Edge>)> {
        self.ensure_initialized()?;

        let mut nodes: Vec<Node> = Vec::new();
        let mut edges: Vec<Edge> = Vec::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut edge_ids: HashSet<Uuid> = HashSet::new();

        let root_node = self
            .inner
            .store
            .get_node(root)
            .await?
            .ok_or(NoemaError::NodeNotFound(*root))
            .map_err(|e| e.in_op("subgraph"))?;
        visited.insert(*root);
        nodes.push(root_node);

        let mut frontier = vec![*root];
        for _ in 0..depth {
            let mut next = Vec::new();
            for id in &frontier {
                for edge in self.inner.store.find_edges(Some(id), None, None).await? {
                    if edge_ids.insert(edge.id) {
                        let target = edge.target_id;
                        edges.push(edge);
                        if visited.insert(target) {
                            if let Some(node) = self.inner.store.get_node(&target).await? {
                                nodes.push(node);
                                next.push(target);
                            }
                        }
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        Ok((nodes, edges))
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    /// Declare an index and backfill it from the current graph.
    pub async fn create_index(&self, name: &str, spec: IndexSpec) -> NoemaResult<()> {
        self.ensure_initialized()?;

        let guard = self.inner.write_lock.write().await;
        self.inner
            .indexes
            .create_index(name, spec.clone())
            .await
            .map_err(|e| e.in_op("create_index"))?;

        let backfill = async {
            match spec.target() {
                IndexTarget::Node => {
                    for node in self.inner.store.scan_nodes().await? {
                        self.inner.indexes.index_entity(EntityRef::Node(&node)).await?;
                    }
                }
                IndexTarget::Edge => {
                    for edge in self.inner.store.scan_edges().await? {
                        self.inner.indexes.index_entity(EntityRef::Edge(&edge)).await?;
                    }
                }
            }
            Ok::<(), NoemaError>(())
        };
        if let Err(err) = backfill.await {
            warn!(index = name, error = %err, "index backfill failed");
            return Err(err.in_op("create_index"));
        }

        // Plans chosen before this index existed may no longer be optimal.
        self.inner.query.invalidate_plans();
        drop(guard);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cache controls and statistics
    // -----------------------------------------------------------------------

    /// Invalidate cache entries matching the criteria; returns the count
    /// removed.
    pub fn invalidate(&self, criteria: &InvalidationCriteria) -> NoemaResult<usize> {
        self.ensure_initialized()?;
        Ok(self.inner.cache.invalidate(criteria))
    }

    /// Drop every cached result.
    pub fn clear_cache(&self) -> NoemaResult<usize> {
        self.ensure_initialized()?;
        Ok(self.inner.cache.clear())
    }

    /// Aggregate statistics across store, indexes, and cache.
    pub async fn stats(&self) -> NoemaResult<EngineStats> {
        self.ensure_initialized()?;
        Ok(EngineStats {
            nodes: self.inner.store.node_count().await,
            edges: self.inner.store.edge_count().await,
            indexes: self.inner.indexes.stats().await,
            cache: self.inner.cache.stats(),
        })
    }

    // -----------------------------------------------------------------------
    // Index write-through with retry
    // -----------------------------------------------------------------------

    async fn index_with_retry(&self, entity: EntityRef<'_>) -> NoemaResult<()> {
        match self.inner.indexes.index_entity(entity).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "index mutation failed; retrying once");
                self.inner.indexes.reindex_entity(entity).await
            }
        }
    }

    async fn reindex_with_retry(&self, entity: EntityRef<'_>) -> NoemaResult<()> {
        match self.inner.indexes.reindex_entity(entity).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(error = %first, "reindex failed; retrying once");
                self.inner.indexes.reindex_entity(entity).await
            }
        }
    }

    /// Entity ids a cached structured-query result depends on: the items it
    /// returned plus any ids pinned by the spec itself.
    fn query_entity_refs(&self, spec: &QuerySpec, result: &QueryResult) -> HashSet<Uuid> {
        let mut refs: HashSet<Uuid> = result.referenced_ids().into_iter().collect();
        match &spec.shape {
            crate::query::QueryShape::Node { id, .. } => {
                refs.extend(id.iter().copied());
            }
            crate::query::QueryShape::Edge {
                id,
                source_id,
                target_id,
                ..
            } => {
                refs.extend(id.iter().copied());
                refs.extend(source_id.iter().copied());
                refs.extend(target_id.iter().copied());
            }
            crate::query::QueryShape::Traversal {
                start_id, end_id, ..
            } => {
                refs.insert(*start_id);
                refs.extend(end_id.iter().copied());
            }
            _ => {}
        }
        refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::edge::EdgeType;
    use crate::model::node::NodeType;
    use serde_json::json;

    async fn live_engine() -> NoemaEngine {
        let engine = NoemaEngine::in_memory();
        engine.initialize().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn operations_require_initialization() {
        let engine = NoemaEngine::in_memory();
        let err = engine.get_node(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, NoemaError::NotInitialized));

        engine.initialize().await.unwrap();
        assert!(engine.get_node(&Uuid::new_v4()).await.unwrap().is_none());

        engine.shutdown().await.unwrap();
        let err = engine.get_node(&Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, NoemaError::NotInitialized));
    }

    #[tokio::test]
    async fn lifecycle_and_mutation_events_are_observable() {
        let engine = NoemaEngine::in_memory();
        let mut events = engine.subscribe();
        engine.initialize().await.unwrap();

        let node = Node::new(NodeType::Concept);
        let id = engine.add_node(node).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), GraphEvent::Initialized);
        assert_eq!(
            events.recv().await.unwrap(),
            GraphEvent::NodeAdded {
                id,
                node_type: NodeType::Concept
            }
        );
    }

    #[tokio::test]
    async fn delete_node_rejects_then_cascade_emits_edge_events() {
        let engine = live_engine().await;
        let a = engine.add_node(Node::new(NodeType::Concept)).await.unwrap();
        let b = engine.add_node(Node::new(NodeType::Concept)).await.unwrap();
        let e = engine
            .add_edge(Edge::new(EdgeType::RelatedTo, a, b))
            .await
            .unwrap();

        let err = engine.delete_node(&a).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IntegrityViolation);

        engine.delete_edge(&e).await.unwrap();
        engine.delete_node(&a).await.unwrap();
        assert!(engine.get_node(&a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_results_are_cached_and_invalidated_on_delete() {
        let engine = live_engine().await;
        let id = engine
            .add_node(Node::new(NodeType::Concept).with_property("name", "AI"))
            .await
            .unwrap();

        let spec = QuerySpec::node_by_id(id);
        let opts = QueryOptions::default();

        let first = engine.execute_query(&spec, &opts).await.unwrap();
        assert_eq!(first.items.len(), 1);
        assert!(first.metadata.cache_source.is_none());

        let second = engine.execute_query(&spec, &opts).await.unwrap();
        assert_eq!(second.metadata.cache_source, Some(CacheSource::Exact));
        assert_eq!(second.items, first.items);

        engine.delete_node(&id).await.unwrap();
        let third = engine.execute_query(&spec, &opts).await.unwrap();
        assert!(third.items.is_empty());
        assert!(third.metadata.cache_source.is_none());
    }

    #[tokio::test]
    async fn create_index_backfills_existing_entities() {
        let engine = live_engine().await;
        engine
            .add_node(Node::new(NodeType::Concept).with_property("name", "AI"))
            .await
            .unwrap();

        engine
            .create_index(
                "by_name",
                IndexSpec::Property {
                    target: IndexTarget::Node,
                    keys: vec!["properties.name".into()],
                },
            )
            .await
            .unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.indexes["by_name"].entries, 1);
        assert_eq!(stats.nodes, 1);
    }

    #[tokio::test]
    async fn stats_track_cache_counters() {
        let engine = live_engine().await;
        let id = engine.add_node(Node::new(NodeType::Concept)).await.unwrap();
        let spec = QuerySpec::node_by_id(id);

        engine
            .execute_query(&spec, &QueryOptions::default())
            .await
            .unwrap();
        engine
            .execute_query(&spec, &QueryOptions::default())
            .await
            .unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.cache.exact_hits, 1);
        assert!(stats.cache.size >= 1);

        engine.clear_cache().unwrap();
        assert_eq!(engine.stats().await.unwrap().cache.size, 0);
    }

    #[tokio::test]
    async fn bypass_cache_skips_population() {
        let engine = live_engine().await;
        let id = engine.add_node(Node::new(NodeType::Concept)).await.unwrap();
        let spec = QuerySpec::node_by_id(id);
        let opts = QueryOptions::default().bypassing_cache();

        engine.execute_query(&spec, &opts).await.unwrap();
        let result = engine.execute_query(&spec, &opts).await.unwrap();
        assert!(result.metadata.cache_source.is_none());
        assert_eq!(engine.stats().await.unwrap().cache.size, 0);
    }

    #[tokio::test]
    async fn neighbors_and_subgraph_read_through() {
        let engine = live_engine().await;
        let a = engine
            .add_node(Node::new(NodeType::Concept).with_property("name", "a"))
            .await
            .unwrap();
        let b = engine
            .add_node(Node::new(NodeType::Concept).with_property("name", "b"))
            .await
            .unwrap();
        let c = engine
            .add_node(Node::new(NodeType::Concept).with_property("name", "c"))
            .await
            .unwrap();
        engine
            .add_edge(Edge::new(EdgeType::RelatedTo, a, b))
            .await
            .unwrap();
        engine
            .add_edge(Edge::new(EdgeType::RelatedTo, b, c))
            .await
            .unwrap();

        let direct = engine
            .neighbors(&a, crate::query::Direction::Outgoing, None)
            .await
            .unwrap();
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].1.properties["name"], json!("b"));

        let (nodes, edges) = engine.subgraph(&a, 2).await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(edges.len(), 2);
    }

    #[tokio::test]
    async fn update_node_invalidates_cached_entries_citing_it() {
        let engine = live_engine().await;
        let id = engine
            .add_node(Node::new(NodeType::Concept).with_property("name", "before"))
            .await
            .unwrap();
        let spec = QuerySpec::node_by_id(id);

        engine
            .execute_query(&spec, &QueryOptions::default())
            .await
            .unwrap();
        engine
            .update_node(&id, &NodePatch::new().set_property("name", "after"))
            .await
            .unwrap();

        let result = engine
            .execute_query(&spec, &QueryOptions::default())
            .await
            .unwrap();
        assert!(result.metadata.cache_source.is_none());
        assert_eq!(result.items[0]["properties"]["name"], json!("after"));
    }
}
