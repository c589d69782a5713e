use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PropertyIndex: value tuple over one or more property paths -> posting list
// ---------------------------------------------------------------------------

/// Secondary index mapping a derived key tuple to the set of entity ids that
/// currently carry those values. Entities missing any key path are simply
/// not indexed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyIndex {
    /// Encoded key tuple -> posting list.
    forward: HashMap<String, HashSet<Uuid>>,
    /// Entity id -> the encoded tuple it is filed under.
    reverse: HashMap<Uuid, String>,
}

impl PropertyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and store the key tuple for an entity. Returns false when the
    /// entity resolves no complete tuple and was left unindexed.
    pub fn insert(&mut self, id: Uuid, tuple: Option<Vec<Value>>) -> bool {
        self.remove(&id);
        let Some(tuple) = tuple else {
            return false;
        };
        let key = encode_tuple(&tuple);
        self.forward.entry(key.clone()).or_default().insert(id);
        self.reverse.insert(id, key);
        true
    }

    /// Drop an entity from the index. Idempotent.
    pub fn remove(&mut self, id: &Uuid) {
        if let Some(key) = self.reverse.remove(id) {
            if let Some(postings) = self.forward.get_mut(&key) {
                postings.remove(id);
                if postings.is_empty() {
                    self.forward.remove(&key);
                }
            }
        }
    }

    /// Posting list for an exact key tuple, sorted for determinism.
    pub fn lookup(&self, tuple: &[Value]) -> Vec<Uuid> {
        let key = encode_tuple(tuple);
        let mut ids: Vec<Uuid> = self
            .forward
            .get(&key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Whether the entity is currently indexed.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.reverse.contains_key(id)
    }

    /// The encoded tuple an entity is filed under, if any.
    pub fn tuple_of(&self, id: &Uuid) -> Option<&str> {
        self.reverse.get(id).map(String::as_str)
    }

    /// Number of indexed entities.
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    /// All indexed entity ids.
    pub fn ids(&self) -> Vec<Uuid> {
        self.reverse.keys().copied().collect()
    }

    /// Sizes of every posting list, keyed by encoded tuple.
    pub fn posting_sizes(&self) -> HashMap<String, usize> {
        self.forward
            .iter()
            .map(|(key, postings)| (key.clone(), postings.len()))
            .collect()
    }
}

/// Canonical encoding of a key tuple. JSON array text is stable because the
/// values arrive in declared key order.
pub fn encode_tuple(tuple: &[Value]) -> String {
    serde_json::to_string(tuple).unwrap_or_else(|_| String::from("[]"))
}
