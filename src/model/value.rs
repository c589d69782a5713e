use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Property paths and predicates: the criteria language shared by the store,
// the indexes, and the query processor
// ---------------------------------------------------------------------------

/// Read access to an entity's fields by dotted path.
///
/// Paths address either a top-level field (`id`, `type`, `source_id`) or a
/// nested location under `properties.` / `metadata.`.
pub trait PropertyAccess {
    /// Resolve a dotted path to an owned JSON value, `None` if absent.
    fn value_at(&self, path: &str) -> Option<Value>;
}

impl PropertyAccess for Value {
    fn value_at(&self, path: &str) -> Option<Value> {
        resolve_path(self, path).cloned()
    }
}

/// Walk a dotted path through nested JSON objects.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// A single comparison applied to the value at one property path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    /// Substring for strings, membership for arrays, key presence for objects.
    Contains(Value),
    StartsWith(String),
    EndsWith(String),
    Regex(String),
    Exists(bool),
}

impl Predicate {
    /// Evaluate this predicate against the resolved value at its path.
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        match self {
            Predicate::Exists(expected) => actual.is_some() == *expected,
            Predicate::Eq(expected) => actual.is_some_and(|v| values_equal(v, expected)),
            Predicate::Ne(expected) => !actual.is_some_and(|v| values_equal(v, expected)),
            Predicate::Lt(expected) => cmp_to(actual, expected, |o| o == Ordering::Less),
            Predicate::Lte(expected) => cmp_to(actual, expected, |o| o != Ordering::Greater),
            Predicate::Gt(expected) => cmp_to(actual, expected, |o| o == Ordering::Greater),
            Predicate::Gte(expected) => cmp_to(actual, expected, |o| o != Ordering::Less),
            Predicate::In(options) => {
                actual.is_some_and(|v| options.iter().any(|o| values_equal(v, o)))
            }
            Predicate::Nin(options) => {
                !actual.is_some_and(|v| options.iter().any(|o| values_equal(v, o)))
            }
            Predicate::Contains(needle) => actual.is_some_and(|v| contains(v, needle)),
            Predicate::StartsWith(prefix) => {
                actual.and_then(Value::as_str).is_some_and(|s| s.starts_with(prefix))
            }
            Predicate::EndsWith(suffix) => {
                actual.and_then(Value::as_str).is_some_and(|s| s.ends_with(suffix))
            }
            Predicate::Regex(pattern) => actual
                .and_then(Value::as_str)
                .is_some_and(|s| Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(false)),
        }
    }
}

fn cmp_to(actual: Option<&Value>, expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|v| compare_values(v, expected))
        .is_some_and(accept)
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// Equality with numeric coercion: `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Total order over comparable values: numbers with numbers, strings with
/// strings (codepoint order), booleans with booleans. Mixed types are
/// incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

// ---------------------------------------------------------------------------
// Criteria: a conjunction of path -> predicate constraints
// ---------------------------------------------------------------------------

/// Conjunctive entity selection criteria.
///
/// The `BTreeMap` keeps path order deterministic, which makes the canonical
/// serialization usable as a cache fingerprint component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Criteria(pub BTreeMap<String, Predicate>);

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, predicate: Predicate) -> Self {
        self.0.insert(path.into(), predicate);
        self
    }

    /// Shorthand for the common equality constraint.
    pub fn eq(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Predicate::Eq(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Paths referenced by this criteria set.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// True when the entity satisfies every constraint.
    pub fn matches(&self, entity: &impl PropertyAccess) -> bool {
        self.0
            .iter()
            .all(|(path, predicate)| predicate.matches(entity.value_at(path).as_ref()))
    }
}
