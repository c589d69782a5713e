use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{NoemaError, NoemaResult};

// ---------------------------------------------------------------------------
// Cosine similarity: the single distance contract used across the engine
// ---------------------------------------------------------------------------

/// Cosine similarity between two vectors: `dot(a,b) / (||a||·||b||)`.
///
/// Vectors of unequal length fail with a dimension mismatch; if either vector
/// is all zeros the similarity is defined as 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> NoemaResult<f32> {
    if a.len() != b.len() {
        return Err(NoemaError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        Ok(0.0)
    } else {
        Ok(dot / (norm_a * norm_b))
    }
}

// ---------------------------------------------------------------------------
// EmbeddingProvider: pluggable text-to-vector capability
// ---------------------------------------------------------------------------

/// Capability interface for turning text into a dense vector. Real
/// deployments wire up a model-backed provider; when none is supplied the
/// engine falls back to [`HashEmbedder`].
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for the given text.
    async fn generate_embedding(&self, text: &str) -> NoemaResult<Vec<f32>>;

    /// Dimensionality of vectors produced by this provider.
    fn dimensions(&self) -> usize;
}

// ---------------------------------------------------------------------------
// HashEmbedder: deterministic pseudo-embedding fallback
// ---------------------------------------------------------------------------

/// Deterministic placeholder embedder derived from SHA-256 of the input.
///
/// The output carries no semantic meaning; it exists so that cache
/// fingerprinting and similarity plumbing keep working when no real provider
/// is configured. Identical text always yields an identical unit vector.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn fill(&self, text: &str) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.dimensions);
        let mut counter: u32 = 0;

        while values.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(counter.to_le_bytes());
            hasher.update(text.as_bytes());
            let digest = hasher.finalize();

            for byte in digest.iter() {
                if values.len() == self.dimensions {
                    break;
                }
                // Map [0, 255] onto [-1, 1].
                values.push(*byte as f32 / 127.5 - 1.0);
            }
            counter += 1;
        }

        let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut values {
                *v /= norm;
            }
        }
        values
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn generate_embedding(&self, text: &str) -> NoemaResult<Vec<f32>> {
        Ok(self.fill(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
