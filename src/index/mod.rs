pub mod fulltext;
pub mod property;
pub mod temporal;
pub mod vector;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::IndexingConfig;
use crate::error::{NoemaError, NoemaResult};
use crate::model::edge::Edge;
use crate::model::node::Node;
use crate::model::value::PropertyAccess;

pub use fulltext::{tokenize, FullTextIndex};
pub use property::PropertyIndex;
pub use temporal::TemporalIndex;
pub use vector::VectorIndex;

// ---------------------------------------------------------------------------
// Entity views: what the index layer is allowed to see
// ---------------------------------------------------------------------------

/// Which entity class an index covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexTarget {
    Node,
    Edge,
}

/// Borrowed view of an entity snapshot handed to the index layer. Indexes
/// hold ids only, never entity references.
#[derive(Debug, Clone, Copy)]
pub enum EntityRef<'a> {
    Node(&'a Node),
    Edge(&'a Edge),
}

impl<'a> EntityRef<'a> {
    pub fn id(&self) -> Uuid {
        match self {
            EntityRef::Node(node) => node.id,
            EntityRef::Edge(edge) => edge.id,
        }
    }

    pub fn target(&self) -> IndexTarget {
        match self {
            EntityRef::Node(_) => IndexTarget::Node,
            EntityRef::Edge(_) => IndexTarget::Edge,
        }
    }

    pub fn value_at(&self, path: &str) -> Option<Value> {
        match self {
            EntityRef::Node(node) => node.value_at(path),
            EntityRef::Edge(edge) => edge.value_at(path),
        }
    }

    pub fn embedding(&self, kind: &str) -> Option<&'a [f32]> {
        match self {
            EntityRef::Node(node) => node.embedding(kind),
            EntityRef::Edge(edge) => {
                if kind.is_empty() || kind == "default" {
                    edge.metadata.embedding.as_deref()
                } else {
                    None
                }
            }
        }
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        let metadata = match self {
            EntityRef::Node(node) => &node.metadata,
            EntityRef::Edge(edge) => &edge.metadata,
        };
        if metadata.created_at == metadata.updated_at {
            vec![metadata.created_at]
        } else {
            vec![metadata.created_at, metadata.updated_at]
        }
    }

    fn key_tuple(&self, keys: &[String]) -> Option<Vec<Value>> {
        keys.iter().map(|path| self.value_at(path)).collect()
    }

    fn texts(&self, fields: &[String]) -> Vec<String> {
        fields
            .iter()
            .filter_map(|path| self.value_at(path))
            .filter_map(|value| value.as_str().map(str::to_string))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Index declarations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Property,
    FullText,
    Vector,
    Temporal,
}

/// Declaration of an index: its kind plus the key derivation it applies to
/// every entity snapshot of the matching target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexSpec {
    Property {
        target: IndexTarget,
        keys: Vec<String>,
    },
    FullText {
        target: IndexTarget,
        fields: Vec<String>,
    },
    Vector {
        target: IndexTarget,
        embedding_kind: String,
        dimensions: usize,
    },
    Temporal {
        target: IndexTarget,
    },
}

impl IndexSpec {
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexSpec::Property { .. } => IndexKind::Property,
            IndexSpec::FullText { .. } => IndexKind::FullText,
            IndexSpec::Vector { .. } => IndexKind::Vector,
            IndexSpec::Temporal { .. } => IndexKind::Temporal,
        }
    }

    pub fn target(&self) -> IndexTarget {
        match self {
            IndexSpec::Property { target, .. }
            | IndexSpec::FullText { target, .. }
            | IndexSpec::Vector { target, .. }
            | IndexSpec::Temporal { target } => *target,
        }
    }

    /// The declared key paths (or fields / embedding kind) of this index.
    pub fn declared_keys(&self) -> Vec<String> {
        match self {
            IndexSpec::Property { keys, .. } => keys.clone(),
            IndexSpec::FullText { fields, .. } => fields.clone(),
            IndexSpec::Vector { embedding_kind, .. } => vec![embedding_kind.clone()],
            IndexSpec::Temporal { .. } => vec!["metadata.created_at".into(), "metadata.updated_at".into()],
        }
    }
}

#[derive(Debug)]
enum IndexState {
    Property(PropertyIndex),
    FullText(FullTextIndex),
    Vector(VectorIndex),
    Temporal(TemporalIndex),
}

#[derive(Debug)]
struct IndexEntry {
    spec: IndexSpec,
    state: IndexState,
}

/// Per-index bookkeeping surfaced through `stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub target: IndexTarget,
    pub entries: usize,
}

/// Portable serialized form of one index: kind tag, declared keys, and an
/// entity-id to key-tuple map. Durable backends persist this; the in-memory
/// engine only uses it for inspection.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSnapshot {
    pub kind: IndexKind,
    pub keys: Vec<String>,
    pub entries: HashMap<Uuid, String>,
}

// ---------------------------------------------------------------------------
// IndexManager
// ---------------------------------------------------------------------------

/// Owner of all secondary indexes. Mutations arrive from the facade inside
/// the same write critical section as the store mutation that caused them,
/// so readers never observe a store/index mismatch.
pub struct IndexManager {
    indexes: RwLock<HashMap<String, IndexEntry>>,
    config: IndexingConfig,
}

impl IndexManager {
    pub fn new(config: IndexingConfig) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Declare a new index. Fails when the name is taken, the cap is
    /// reached, or the kind is disabled by configuration.
    pub async fn create_index(&self, name: &str, spec: IndexSpec) -> NoemaResult<()> {
        if name.is_empty() {
            return Err(NoemaError::InvalidArgument(
                "index name must not be empty".into(),
            ));
        }
        if spec.kind() == IndexKind::FullText && !self.config.enable_full_text {
            return Err(NoemaError::Unsupported(
                "full-text indexing is disabled (indexing.enable_full_text)".into(),
            ));
        }
        if let IndexSpec::Property { keys, .. } = &spec {
            if keys.is_empty() {
                return Err(NoemaError::InvalidArgument(
                    "property index requires at least one key path".into(),
                ));
            }
        }

        let mut indexes = self.indexes.write().await;
        if indexes.len() >= self.config.max_indexes {
            return Err(NoemaError::InvalidArgument(format!(
                "index limit reached ({} of {})",
                indexes.len(),
                self.config.max_indexes
            )));
        }
        if indexes.contains_key(name) {
            return Err(NoemaError::IndexAlreadyExists(name.to_string()));
        }

        let state = match &spec {
            IndexSpec::Property { .. } => IndexState::Property(PropertyIndex::new()),
            IndexSpec::FullText { .. } => IndexState::FullText(FullTextIndex::new()),
            IndexSpec::Vector { dimensions, .. } => {
                let dims = if *dimensions == 0 {
                    self.config.vector_dimensions
                } else {
                    *dimensions
                };
                IndexState::Vector(VectorIndex::new(dims))
            }
            IndexSpec::Temporal { .. } => IndexState::Temporal(TemporalIndex::new()),
        };

        indexes.insert(name.to_string(), IndexEntry { spec, state });
        Ok(())
    }

    /// Register an entity snapshot with every index of its target class.
    pub async fn index_entity(&self, entity: EntityRef<'_>) -> NoemaResult<()> {
        let mut indexes = self.indexes.write().await;
        for entry in indexes.values_mut() {
            if entry.spec.target() != entity.target() {
                continue;
            }
            apply_entity(entry, entity)?;
        }
        Ok(())
    }

    /// Remove-then-index for an updated entity.
    pub async fn reindex_entity(&self, entity: EntityRef<'_>) -> NoemaResult<()> {
        let id = entity.id();
        let mut indexes = self.indexes.write().await;
        for entry in indexes.values_mut() {
            if entry.spec.target() != entity.target() {
                continue;
            }
            remove_id(entry, &id);
            apply_entity(entry, entity)?;
        }
        Ok(())
    }

    /// Drop an entity from every index. Idempotent.
    pub async fn remove_entity(&self, id: &Uuid) {
        let mut indexes = self.indexes.write().await;
        for entry in indexes.values_mut() {
            remove_id(entry, id);
        }
    }

    /// Exact posting-list lookup on a property index.
    pub async fn query_property(&self, name: &str, tuple: &[Value]) -> NoemaResult<Vec<Uuid>> {
        let indexes = self.indexes.read().await;
        let entry = indexes
            .get(name)
            .ok_or_else(|| NoemaError::IndexNotFound(name.to_string()))?;
        match &entry.state {
            IndexState::Property(index) => Ok(index.lookup(tuple)),
            _ => Err(NoemaError::InvalidArgument(format!(
                "index '{name}' is not a property index"
            ))),
        }
    }

    /// Cosine top-k on a vector index.
    pub async fn vector_top_k(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> NoemaResult<Vec<(Uuid, f32)>> {
        let indexes = self.indexes.read().await;
        let entry = indexes
            .get(name)
            .ok_or_else(|| NoemaError::IndexNotFound(name.to_string()))?;
        match &entry.state {
            IndexState::Vector(index) => index.top_k(query, k, threshold),
            _ => Err(NoemaError::InvalidArgument(format!(
                "index '{name}' is not a vector index"
            ))),
        }
    }

    /// Term-match top-k on a full-text index.
    pub async fn full_text_top_k(
        &self,
        name: &str,
        query: &str,
        k: usize,
    ) -> NoemaResult<Vec<(Uuid, usize)>> {
        let indexes = self.indexes.read().await;
        let entry = indexes
            .get(name)
            .ok_or_else(|| NoemaError::IndexNotFound(name.to_string()))?;
        match &entry.state {
            IndexState::FullText(index) => Ok(index.top_k(query, k)),
            _ => Err(NoemaError::InvalidArgument(format!(
                "index '{name}' is not a full-text index"
            ))),
        }
    }

    /// Entities registered in `[from, to]` on a temporal index.
    pub async fn temporal_range(
        &self,
        name: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> NoemaResult<Vec<Uuid>> {
        let indexes = self.indexes.read().await;
        let entry = indexes
            .get(name)
            .ok_or_else(|| NoemaError::IndexNotFound(name.to_string()))?;
        match &entry.state {
            IndexState::Temporal(index) => Ok(index.range(from, to)),
            _ => Err(NoemaError::InvalidArgument(format!(
                "index '{name}' is not a temporal index"
            ))),
        }
    }

    /// Find a property index covering exactly the given key paths, used by
    /// the planner to decide whether an index-based traversal is applicable.
    pub async fn find_property_index(
        &self,
        target: IndexTarget,
        keys: &[&str],
    ) -> Option<String> {
        let indexes = self.indexes.read().await;
        indexes
            .iter()
            .find(|(_, entry)| match &entry.spec {
                IndexSpec::Property {
                    target: t,
                    keys: declared,
                } => *t == target && declared.len() == keys.len()
                    && declared.iter().zip(keys).all(|(a, b)| a == b),
                _ => false,
            })
            .map(|(name, _)| name.clone())
    }

    /// First vector index for a target class, if any.
    pub async fn find_vector_index(&self, target: IndexTarget) -> Option<String> {
        let indexes = self.indexes.read().await;
        let mut names: Vec<&String> = indexes
            .iter()
            .filter(|(_, entry)| {
                entry.spec.target() == target && entry.spec.kind() == IndexKind::Vector
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names.first().map(|s| s.to_string())
    }

    /// First full-text index for a target class, if any.
    pub async fn find_full_text_index(&self, target: IndexTarget) -> Option<String> {
        let indexes = self.indexes.read().await;
        let mut names: Vec<&String> = indexes
            .iter()
            .filter(|(_, entry)| {
                entry.spec.target() == target && entry.spec.kind() == IndexKind::FullText
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names.first().map(|s| s.to_string())
    }

    /// Per-index entry counts.
    pub async fn stats(&self) -> HashMap<String, IndexStats> {
        let indexes = self.indexes.read().await;
        indexes
            .iter()
            .map(|(name, entry)| {
                let entries = match &entry.state {
                    IndexState::Property(index) => index.len(),
                    IndexState::FullText(index) => index.len(),
                    IndexState::Vector(index) => index.len(),
                    IndexState::Temporal(index) => index.len(),
                };
                (
                    name.clone(),
                    IndexStats {
                        kind: entry.spec.kind(),
                        target: entry.spec.target(),
                        entries,
                    },
                )
            })
            .collect()
    }

    /// Export the portable serialized form of one index.
    pub async fn export(&self, name: &str) -> NoemaResult<IndexSnapshot> {
        let indexes = self.indexes.read().await;
        let entry = indexes
            .get(name)
            .ok_or_else(|| NoemaError::IndexNotFound(name.to_string()))?;

        let entries = match &entry.state {
            IndexState::Property(index) => index_entries_property(index),
            IndexState::FullText(index) => {
                // Term lists are reconstructible from the store; export ids only.
                let mut map = HashMap::new();
                for id in index_ids_fulltext(index) {
                    map.insert(id, String::new());
                }
                map
            }
            IndexState::Vector(index) => index_entries_vector(index),
            IndexState::Temporal(index) => index_entries_temporal(index),
        };

        Ok(IndexSnapshot {
            kind: entry.spec.kind(),
            keys: entry.spec.declared_keys(),
            entries,
        })
    }

    pub async fn index_count(&self) -> usize {
        self.indexes.read().await.len()
    }
}

fn apply_entity(entry: &mut IndexEntry, entity: EntityRef<'_>) -> NoemaResult<()> {
    let id = entity.id();
    match (&entry.spec, &mut entry.state) {
        (IndexSpec::Property { keys, .. }, IndexState::Property(index)) => {
            index.insert(id, entity.key_tuple(keys));
        }
        (IndexSpec::FullText { fields, .. }, IndexState::FullText(index)) => {
            index.insert(id, &entity.texts(fields));
        }
        (IndexSpec::Vector { embedding_kind, .. }, IndexState::Vector(index)) => {
            if let Some(vector) = entity.embedding(embedding_kind) {
                index.insert(id, vector.to_vec())?;
            } else {
                index.remove(&id);
            }
        }
        (IndexSpec::Temporal { .. }, IndexState::Temporal(index)) => {
            index.insert(id, &entity.timestamps());
        }
        _ => {
            return Err(NoemaError::IntegrityViolation(
                "index spec and state diverged".into(),
            ))
        }
    }
    Ok(())
}

fn remove_id(entry: &mut IndexEntry, id: &Uuid) {
    match &mut entry.state {
        IndexState::Property(index) => index.remove(id),
        IndexState::FullText(index) => index.remove(id),
        IndexState::Vector(index) => index.remove(id),
        IndexState::Temporal(index) => index.remove(id),
    }
}

fn index_entries_property(index: &PropertyIndex) -> HashMap<Uuid, String> {
    // PropertyIndex exposes tuples through its reverse map accessor.
    let mut map = HashMap::new();
    for id in index_ids_property(index) {
        if let Some(tuple) = index.tuple_of(&id) {
            map.insert(id, tuple.to_string());
        }
    }
    map
}

fn index_ids_property(index: &PropertyIndex) -> Vec<Uuid> {
    index.ids()
}

fn index_ids_fulltext(index: &FullTextIndex) -> Vec<Uuid> {
    index.ids()
}

fn index_entries_vector(index: &VectorIndex) -> HashMap<Uuid, String> {
    index
        .ids()
        .into_iter()
        .filter_map(|id| {
            index
                .get(&id)
                .map(|v| (id, serde_json::to_string(v).unwrap_or_default()))
        })
        .collect()
}

fn index_entries_temporal(index: &TemporalIndex) -> HashMap<Uuid, String> {
    index
        .ids()
        .into_iter()
        .map(|id| {
            let stamps: Vec<String> = index
                .timestamps_of(&id)
                .into_iter()
                .map(|ts| ts.to_rfc3339())
                .collect();
            (id, stamps.join(","))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
