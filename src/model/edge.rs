use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::model::node::Metadata;
use crate::model::value::{resolve_path, PropertyAccess};

// ---------------------------------------------------------------------------
// Edge: directed, typed relationships between nodes
// ---------------------------------------------------------------------------

/// A directed edge connecting two nodes. Edges carry the same property and
/// metadata surface as nodes; both endpoints must exist when the edge is
/// created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Globally unique edge identifier.
    pub id: Uuid,
    /// The relationship kind.
    pub edge_type: EdgeType,
    /// Source node ID (edge goes FROM this node).
    pub source_id: Uuid,
    /// Target node ID (edge goes TO this node).
    pub target_id: Uuid,
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Edge {
    /// Create a new edge of the given kind between two nodes.
    pub fn new(edge_type: EdgeType, source_id: Uuid, target_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            edge_type,
            source_id,
            target_id,
            properties: HashMap::new(),
            metadata: Metadata::now(),
        }
    }

    /// Set a property on this edge.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the confidence score in [0.0, 1.0].
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    /// Whether this edge touches the given node on either end.
    pub fn is_incident_to(&self, node_id: &Uuid) -> bool {
        &self.source_id == node_id || &self.target_id == node_id
    }

    /// Merge a patch into this edge, bumping `updated_at`. Endpoints and the
    /// edge type are immutable; a patch cannot rewire an edge.
    pub fn apply(&mut self, patch: &EdgePatch) {
        for (key, value) in &patch.properties {
            self.properties.insert(key.clone(), value.clone());
        }
        for (key, value) in &patch.metadata {
            self.metadata.extra.insert(key.clone(), value.clone());
        }
        if let Some(confidence) = patch.confidence {
            self.metadata.confidence = Some(confidence.clamp(0.0, 1.0));
        }
        self.metadata.touch();
    }
}

impl PropertyAccess for Edge {
    fn value_at(&self, path: &str) -> Option<Value> {
        match path {
            "id" => Some(Value::String(self.id.to_string())),
            "type" | "edge_type" => Some(Value::String(self.edge_type.as_str().to_string())),
            "source_id" => Some(Value::String(self.source_id.to_string())),
            "target_id" => Some(Value::String(self.target_id.to_string())),
            _ => {
                if let Some(rest) = path.strip_prefix("properties.") {
                    match rest.split_once('.') {
                        Some((head, tail)) => {
                            resolve_path(self.properties.get(head)?, tail).cloned()
                        }
                        None => self.properties.get(rest).cloned(),
                    }
                } else if path.strip_prefix("metadata.").is_some() {
                    // Reuse the node metadata resolver through a stand-in node
                    // shape would be overkill; resolve inline instead.
                    metadata_value_at(&self.metadata, &path["metadata.".len()..])
                } else {
                    None
                }
            }
        }
    }
}

fn metadata_value_at(metadata: &Metadata, path: &str) -> Option<Value> {
    match path {
        "created_at" => Some(Value::String(metadata.created_at.to_rfc3339())),
        "updated_at" => Some(Value::String(metadata.updated_at.to_rfc3339())),
        "confidence" => metadata
            .confidence
            .and_then(|c| serde_json::Number::from_f64(c).map(Value::Number)),
        _ => match path.split_once('.') {
            Some((head, tail)) => resolve_path(metadata.extra.get(head)?, tail).cloned(),
            None => metadata.extra.get(path).cloned(),
        },
    }
}

// ---------------------------------------------------------------------------
// EdgeType: the closed set of relational kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    IsA,
    HasProperty,
    RelatedTo,
    PartOf,
    Causes,
    Precedes,
    Implies,
    Contradicts,
    SimilarTo,
    InstanceOf,
    DefinedBy,
    References,
    TemporalRelation,
    Probabilistic,
    Bidirectional,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::IsA => "IsA",
            EdgeType::HasProperty => "HasProperty",
            EdgeType::RelatedTo => "RelatedTo",
            EdgeType::PartOf => "PartOf",
            EdgeType::Causes => "Causes",
            EdgeType::Precedes => "Precedes",
            EdgeType::Implies => "Implies",
            EdgeType::Contradicts => "Contradicts",
            EdgeType::SimilarTo => "SimilarTo",
            EdgeType::InstanceOf => "InstanceOf",
            EdgeType::DefinedBy => "DefinedBy",
            EdgeType::References => "References",
            EdgeType::TemporalRelation => "TemporalRelation",
            EdgeType::Probabilistic => "Probabilistic",
            EdgeType::Bidirectional => "Bidirectional",
        }
    }

    /// Whether traversal may follow this edge against its direction even in
    /// `outgoing` mode.
    pub fn is_symmetric(&self) -> bool {
        matches!(self, EdgeType::Bidirectional)
    }
}

// ---------------------------------------------------------------------------
// EdgePatch: the typed update surface
// ---------------------------------------------------------------------------

/// A partial update merged into an existing edge by the store. Endpoints and
/// the edge type have no patch surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgePatch {
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl EdgePatch {
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

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && self.metadata.is_empty() && self.confidence.is_none()
    }
}
