use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TemporalIndex: timestamp <-> entity id, both directions
// ---------------------------------------------------------------------------

/// Bidirectional timestamp index consumed by temporal sidecars. Maintained
/// in lockstep with the store exactly like a property index; here the key
/// tuple is the entity's set of system timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemporalIndex {
    by_timestamp: BTreeMap<DateTime<Utc>, HashSet<Uuid>>,
    by_entity: HashMap<Uuid, BTreeSet<DateTime<Utc>>>,
}

impl TemporalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entity under its current timestamps, replacing any previous
    /// registration.
    pub fn insert(&mut self, id: Uuid, timestamps: &[DateTime<Utc>]) {
        self.remove(&id);
        let mut set = BTreeSet::new();
        for ts in timestamps {
            set.insert(*ts);
            self.by_timestamp.entry(*ts).or_default().insert(id);
        }
        if !set.is_empty() {
            self.by_entity.insert(id, set);
        }
    }

    /// Drop an entity from both directions. Idempotent.
    pub fn remove(&mut self, id: &Uuid) {
        if let Some(stamps) = self.by_entity.remove(id) {
            for ts in stamps {
                if let Some(ids) = self.by_timestamp.get_mut(&ts) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.by_timestamp.remove(&ts);
                    }
                }
            }
        }
    }

    /// Entities with any timestamp in `[from, to]`, sorted by id.
    pub fn range(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<Uuid> {
        let lower = from.map_or(Bound::Unbounded, Bound::Included);
        let upper = to.map_or(Bound::Unbounded, Bound::Included);

        let mut ids: Vec<Uuid> = self
            .by_timestamp
            .range((lower, upper))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// All timestamps recorded for an entity.
    pub fn timestamps_of(&self, id: &Uuid) -> Vec<DateTime<Utc>> {
        self.by_entity
            .get(id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_entity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    /// All indexed entity ids.
    pub fn ids(&self) -> Vec<Uuid> {
        self.by_entity.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn range_query_is_inclusive() {
        let mut index = TemporalIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.insert(a, &[ts(100)]);
        index.insert(b, &[ts(200)]);

        assert_eq!(index.range(Some(ts(100)), Some(ts(150))), vec![a]);
        let both = index.range(Some(ts(100)), Some(ts(200)));
        assert_eq!(both.len(), 2);
        assert!(index.range(Some(ts(201)), None).is_empty());
    }

    #[test]
    fn reinsert_replaces_timestamps() {
        let mut index = TemporalIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, &[ts(1), ts(2)]);
        index.insert(id, &[ts(3)]);

        assert!(index.range(Some(ts(1)), Some(ts(2))).is_empty());
        assert_eq!(index.timestamps_of(&id), vec![ts(3)]);
    }

    #[test]
    fn remove_clears_both_directions() {
        let mut index = TemporalIndex::new();
        let id = Uuid::new_v4();
        index.insert(id, &[ts(5)]);
        index.remove(&id);

        assert!(index.is_empty());
        assert!(index.range(None, None).is_empty());
        assert!(index.timestamps_of(&id).is_empty());
    }
}
