use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use uuid::Uuid;

use crate::error::{NoemaError, NoemaResult};
use crate::model::embedding::cosine_similarity;

// ---------------------------------------------------------------------------
// VectorIndex: brute-force cosine top-k over stored embeddings
// ---------------------------------------------------------------------------

/// Vector index keyed by one named embedding kind. Search is an exact
/// brute-force scan with a bounded min-heap, which is the right trade for
/// in-process graphs of the sizes this engine targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    dimensions: usize,
    vectors: HashMap<Uuid, Vec<f32>>,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: HashMap::new(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Insert or replace the vector for an entity.
    pub fn insert(&mut self, id: Uuid, vector: Vec<f32>) -> NoemaResult<()> {
        if vector.len() != self.dimensions {
            return Err(NoemaError::DimensionMismatch {
                expected: self.dimensions,
                got: vector.len(),
            });
        }
        self.vectors.insert(id, vector);
        Ok(())
    }

    /// Drop an entity's vector. Idempotent.
    pub fn remove(&mut self, id: &Uuid) {
        self.vectors.remove(id);
    }

    pub fn get(&self, id: &Uuid) -> Option<&[f32]> {
        self.vectors.get(id).map(Vec::as_slice)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.vectors.contains_key(id)
    }

    /// The k most similar entities to the query vector, descending by cosine
    /// similarity, filtered by the threshold.
    pub fn top_k(&self, query: &[f32], k: usize, threshold: f32) -> NoemaResult<Vec<(Uuid, f32)>> {
        if query.len() != self.dimensions {
            return Err(NoemaError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut heap: BinaryHeap<ScoredItem> = BinaryHeap::new();
        for (id, vector) in &self.vectors {
            let score = cosine_similarity(query, vector)?;
            if score < threshold {
                continue;
            }
            let item = ScoredItem { id: *id, score };
            if heap.len() < k {
                heap.push(item);
            } else if let Some(min) = heap.peek() {
                if score > min.score {
                    heap.pop();
                    heap.push(item);
                }
            }
        }

        let mut results: Vec<(Uuid, f32)> =
            heap.into_iter().map(|item| (item.id, item.score)).collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        Ok(results)
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// All indexed entity ids.
    pub fn ids(&self) -> Vec<Uuid> {
        self.vectors.keys().copied().collect()
    }
}

// Min-heap entry: the binary heap keeps the worst of the current top-k on
// top so it can be swapped out cheaply.
#[derive(Debug, Clone)]
struct ScoredItem {
    id: Uuid,
    score: f32,
}

impl PartialEq for ScoredItem {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for ScoredItem {}

impl PartialOrd for ScoredItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_orders_by_similarity() {
        let mut index = VectorIndex::new(3);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        index.insert(a, vec![1.0, 0.0, 0.0]).unwrap();
        index.insert(b, vec![0.0, 1.0, 0.0]).unwrap();
        index.insert(c, vec![0.9, 0.1, 0.0]).unwrap();

        let results = index.top_k(&[1.0, 0.0, 0.0], 2, 0.0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, a);
        assert!((results[0].1 - 1.0).abs() < 1e-6);
        assert_eq!(results[1].0, c);
    }

    #[test]
    fn threshold_filters_low_similarity() {
        let mut index = VectorIndex::new(2);
        index.insert(Uuid::new_v4(), vec![1.0, 0.0]).unwrap();
        index.insert(Uuid::new_v4(), vec![0.0, 1.0]).unwrap();

        let results = index.top_k(&[1.0, 0.0], 10, 0.5).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = VectorIndex::new(2);
        assert!(index.insert(Uuid::new_v4(), vec![1.0, 2.0, 3.0]).is_err());
        assert!(index.top_k(&[1.0], 5, 0.0).is_err());
    }

    #[test]
    fn zero_vectors_score_zero() {
        let mut index = VectorIndex::new(2);
        let id = Uuid::new_v4();
        index.insert(id, vec![0.0, 0.0]).unwrap();

        let results = index.top_k(&[1.0, 0.0], 5, 0.0).unwrap();
        assert_eq!(results, vec![(id, 0.0)]);
    }
}
