use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::value::{resolve_path, PropertyAccess};

// ---------------------------------------------------------------------------
// Node: the fundamental entity in the noema knowledge graph
// ---------------------------------------------------------------------------

/// A node in the knowledge graph. Concepts, entities, events, rules, and the
/// other semantic kinds are all represented as nodes with free-form
/// properties and system-managed metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Globally unique identifier, immutable for the node's lifetime.
    pub id: Uuid,
    /// The semantic kind of this node.
    pub node_type: NodeType,
    /// Caller-owned key-value payload.
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    /// System-managed metadata (timestamps, confidence, default embedding).
    #[serde(default)]
    pub metadata: Metadata,
    /// Additional named embeddings beyond the default one in `metadata`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub embeddings: HashMap<String, Vec<f32>>,
}

impl Node {
    /// Create a new node of the given kind with a fresh id and timestamps.
    pub fn new(node_type: NodeType) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_type,
            properties: HashMap::new(),
            metadata: Metadata::now(),
            embeddings: HashMap::new(),
        }
    }

    /// Set a property on this node.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the confidence score in [0.0, 1.0].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Set the default embedding vector.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.metadata.embedding = Some(embedding);
        self
    }

    /// Set a named embedding (e.g. a secondary model's vector).
    pub fn with_named_embedding(mut self, kind: impl Into<String>, embedding: Vec<f32>) -> Self {
        self.embeddings.insert(kind.into(), embedding);
        self
    }

    /// Set a caller metadata field.
    pub fn with_metadata_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.extra.insert(key.into(), value.into());
        self
    }

    /// Look up an embedding by kind. The name `default` (or an empty kind)
    /// resolves to the metadata embedding.
    pub fn embedding(&self, kind: &str) -> Option<&[f32]> {
        if kind.is_empty() || kind == "default" {
            self.metadata.embedding.as_deref()
        } else {
            self.embeddings.get(kind).map(Vec::as_slice)
        }
    }

    /// Merge a patch into this node, bumping `updated_at`.
    pub fn apply(&mut self, patch: &NodePatch) {
        for (key, value) in &patch.properties {
            self.properties.insert(key.clone(), value.clone());
        }
        for (key, value) in &patch.metadata {
            self.metadata.extra.insert(key.clone(), value.clone());
        }
        if let Some(confidence) = patch.confidence {
            self.metadata.confidence = Some(confidence.clamp(0.0, 1.0));
        }
        if let Some(embedding) = &patch.embedding {
            self.metadata.embedding = Some(embedding.clone());
        }
        if let Some(node_type) = patch.node_type {
            self.node_type = node_type;
        }
        self.metadata.touch();
    }
}

impl PropertyAccess for Node {
    fn value_at(&self, path: &str) -> Option<Value> {
        match path {
            "id" => Some(Value::String(self.id.to_string())),
            "type" | "node_type" => Some(Value::String(self.node_type.as_str().to_string())),
            _ => {
                if let Some(rest) = path.strip_prefix("properties.") {
                    let (head, tail) = split_head(rest);
                    let root = self.properties.get(head)?;
                    match tail {
                        Some(tail) => resolve_path(root, tail).cloned(),
                        None => Some(root.clone()),
                    }
                } else if let Some(rest) = path.strip_prefix("metadata.") {
                    self.metadata.value_at(rest)
                } else {
                    None
                }
            }
        }
    }
}

fn split_head(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    }
}

// ---------------------------------------------------------------------------
// NodeType: the closed set of semantic kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Concept,
    Entity,
    Event,
    Property,
    Relation,
    Rule,
    Context,
    Metadata,
    Uncertain,
    Composite,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Concept => "Concept",
            NodeType::Entity => "Entity",
            NodeType::Event => "Event",
            NodeType::Property => "Property",
            NodeType::Relation => "Relation",
            NodeType::Rule => "Rule",
            NodeType::Context => "Context",
            NodeType::Metadata => "Metadata",
            NodeType::Uncertain => "Uncertain",
            NodeType::Composite => "Composite",
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata: system-managed bookkeeping shared by nodes and edges
// ---------------------------------------------------------------------------

/// System-managed entity metadata. `created_at` and `updated_at` are owned
/// by the store and monotonic per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Arbitrary caller fields.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Metadata {
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            confidence: None,
            embedding: None,
            extra: HashMap::new(),
        }
    }

    /// Bump `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    fn value_at(&self, path: &str) -> Option<Value> {
        match path {
            "created_at" => Some(Value::String(self.created_at.to_rfc3339())),
            "updated_at" => Some(Value::String(self.updated_at.to_rfc3339())),
            "confidence" => self.confidence.and_then(|c| serde_json::Number::from_f64(c).map(Value::Number)),
            _ => {
                let (head, tail) = split_head(path);
                let root = self.extra.get(head)?;
                match tail {
                    Some(tail) => resolve_path(root, tail).cloned(),
                    None => Some(root.clone()),
                }
            }
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::now()
    }
}

// ---------------------------------------------------------------------------
// NodePatch: the typed update surface
// ---------------------------------------------------------------------------

/// A partial update merged into an existing node by the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,
}

impl NodePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn set_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn set_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
            && self.metadata.is_empty()
            && self.confidence.is_none()
            && self.embedding.is_none()
            && self.node_type.is_none()
    }
}
