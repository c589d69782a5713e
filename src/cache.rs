use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::config::SemanticCacheConfig;
use crate::model::embedding::{cosine_similarity, EmbeddingProvider};
use crate::model::value::resolve_path;

// ---------------------------------------------------------------------------
// SemanticCache: exact-keyed result cache with embedding-similarity fallback
// ---------------------------------------------------------------------------

/// How a cache hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Exact,
    Semantic,
}

/// A successful cache lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: Value,
    pub source: CacheSource,
    /// Cosine similarity to the cached query, present for semantic hits.
    pub similarity: Option<f32>,
    pub confidence: f64,
}

/// Criteria accepted by [`SemanticCache::invalidate`].
#[derive(Debug, Clone)]
pub enum InvalidationCriteria {
    /// Remove the entry under one exact fingerprint.
    ExactKey(String),
    /// Remove entries whose context carries this value at the given path.
    Context { path: String, value: Value },
    /// Remove entries inserted before the timestamp.
    OlderThan(DateTime<Utc>),
    /// Remove entries whose payload references this entity.
    Entity(Uuid),
}

/// Knobs for one insertion.
#[derive(Debug, Clone, Default)]
pub struct CachePut {
    pub ttl: Option<Duration>,
    pub confidence: Option<f64>,
    /// Entity ids the payload was derived from; drives entity invalidation.
    pub entity_refs: HashSet<Uuid>,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    context: Value,
    inserted_at: DateTime<Utc>,
    ttl: Duration,
    confidence: f64,
    query_embedding: Vec<f32>,
    entity_refs: HashSet<Uuid>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.inserted_at > ttl,
            Err(_) => false,
        }
    }
}

/// Observable cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

#[derive(Default)]
struct Counters {
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

/// Capacity-bounded result cache keyed by query fingerprints, with an
/// approximate lookup path over query embeddings when no exact key matches.
///
/// Reads never fail: any internal error degrades to a miss and is logged at
/// `warn`. The interior map uses per-shard locking, so lookups proceed
/// against concurrent insertions.
pub struct SemanticCache {
    entries: DashMap<String, CacheEntry>,
    config: SemanticCacheConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    counters: Counters,
}

impl SemanticCache {
    pub fn new(config: SemanticCacheConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            embedder,
            counters: Counters::default(),
        }
    }

    /// Stable fingerprint over the canonical serialization of
    /// `(query, context)`. serde_json object keys are ordered, so two
    /// structurally equal inputs always produce the same digest.
    pub fn fingerprint(query: &Value, context: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(context.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }

    /// Look up a result, preferring the exact fingerprint and falling back
    /// to the most similar cached query above the threshold.
    pub async fn lookup(
        &self,
        query: &Value,
        context: &Value,
        threshold_override: Option<f32>,
    ) -> Option<CacheHit> {
        let now = Utc::now();
        let key = Self::fingerprint(query, context);

        // Step 1: exact key. The shard guard must drop before any removal.
        let exact_expired = {
            match self.entries.get(&key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(CacheHit {
                        value: entry.value.clone(),
                        source: CacheSource::Exact,
                        similarity: None,
                        confidence: entry.confidence,
                    });
                }
                Some(_) => true,
                None => false,
            }
        };
        if exact_expired && self.entries.remove(&key).is_some() {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        }

        // Step 2: approximate key.
        let threshold =
            threshold_override.unwrap_or(self.config.default_similarity_threshold);
        let query_embedding = match self.embed(query, context).await {
            Some(embedding) => embedding,
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let mut expired: Vec<String> = Vec::new();
        let mut best: Option<(f32, CacheEntry)> = None;
        for item in self.entries.iter() {
            if item.value().is_expired(now) {
                expired.push(item.key().clone());
                continue;
            }
            let similarity =
                match cosine_similarity(&query_embedding, &item.value().query_embedding) {
                    Ok(similarity) => similarity,
                    Err(_) => continue,
                };
            if similarity < threshold {
                continue;
            }
            if best.as_ref().is_none_or(|(s, _)| similarity > *s) {
                best = Some((similarity, item.value().clone()));
            }
        }

        for key in expired {
            if self.entries.remove(&key).is_some() {
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        match best {
            Some((similarity, entry)) => {
                self.counters.semantic_hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheHit {
                    value: adapt_scores(entry.value, similarity),
                    source: CacheSource::Semantic,
                    similarity: Some(similarity),
                    confidence: entry.confidence,
                })
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a result for `(query, context)`. Errors degrade to a no-op.
    pub async fn insert(&self, query: &Value, context: &Value, value: Value, put: CachePut) {
        if self.config.max_size == 0 {
            return;
        }
        let Some(query_embedding) = self.embed(query, context).await else {
            return;
        };

        let key = Self::fingerprint(query, context);
        let entry = CacheEntry {
            value,
            context: context.clone(),
            inserted_at: Utc::now(),
            ttl: put.ttl.unwrap_or_else(|| self.config.default_ttl()),
            confidence: put.confidence.unwrap_or(1.0),
            query_embedding,
            entity_refs: put.entity_refs,
        };

        self.entries.insert(key, entry);
        self.evict_over_capacity();
    }

    /// Remove entries matching the criteria; returns how many were dropped.
    /// Runs inside the caller's write critical section, so a conflicting
    /// mutation is never observable before its invalidation completes.
    pub fn invalidate(&self, criteria: &InvalidationCriteria) -> usize {
        let keys: Vec<String> = match criteria {
            InvalidationCriteria::ExactKey(key) => {
                if self.entries.contains_key(key) {
                    vec![key.clone()]
                } else {
                    Vec::new()
                }
            }
            InvalidationCriteria::Context { path, value } => self
                .entries
                .iter()
                .filter(|item| {
                    resolve_path(&item.value().context, path)
                        .map(|found| found == value)
                        .unwrap_or(false)
                })
                .map(|item| item.key().clone())
                .collect(),
            InvalidationCriteria::OlderThan(cutoff) => self
                .entries
                .iter()
                .filter(|item| item.value().inserted_at < *cutoff)
                .map(|item| item.key().clone())
                .collect(),
            InvalidationCriteria::Entity(id) => self
                .entries
                .iter()
                .filter(|item| item.value().entity_refs.contains(id))
                .map(|item| item.key().clone())
                .collect(),
        };

        let mut removed = 0;
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.counters
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let exact = self.counters.exact_hits.load(Ordering::Relaxed);
        let semantic = self.counters.semantic_hits.load(Ordering::Relaxed);
        CacheStats {
            size: self.entries.len(),
            hits: exact + semantic,
            exact_hits: exact,
            semantic_hits: semantic,
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }

    async fn embed(&self, query: &Value, context: &Value) -> Option<Vec<f32>> {
        let text = match (query, context) {
            // Plain-text queries embed as-is so semantically close phrasings
            // land near each other under a real provider.
            (Value::String(text), Value::Null) => text.clone(),
            (Value::String(text), _) => format!("{text}\n{context}"),
            _ => format!("{query}\n{context}"),
        };
        match self.embedder.generate_embedding(&text).await {
            Ok(embedding) => Some(embedding),
            Err(err) => {
                warn!(error = %err, "cache embedding failed; degrading to miss");
                None
            }
        }
    }

    // Strictly-oldest-first eviction until under capacity.
    fn evict_over_capacity(&self) {
        while self.entries.len() > self.config.max_size {
            let oldest: Option<String> = self
                .entries
                .iter()
                .min_by_key(|item| item.value().inserted_at)
                .map(|item| item.key().clone());
            match oldest {
                Some(key) => {
                    if self.entries.remove(&key).is_some() {
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                None => break,
            }
        }
    }
}

/// Scale per-item `score` fields by the hit similarity so downstream ranking
/// is calibrated to the true query. Everything else is left untouched.
fn adapt_scores(value: Value, similarity: f32) -> Value {
    match value {
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| adapt_scores(item, similarity))
                .collect(),
        ),
        Value::Object(mut map) => {
            if let Some(score) = map.get("score").and_then(Value::as_f64) {
                if let Some(scaled) =
                    serde_json::Number::from_f64(score * f64::from(similarity))
                {
                    map.insert("score".to_string(), Value::Number(scaled));
                }
            }
            if let Some(items) = map.remove("items") {
                map.insert("items".to_string(), adapt_scores(items, similarity));
            }
            Value::Object(map)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::embedding::HashEmbedder;
    use async_trait::async_trait;
    use serde_json::json;

    fn cache_with(config: SemanticCacheConfig) -> SemanticCache {
        let dims = config.embedding_dimensions;
        SemanticCache::new(config, Arc::new(HashEmbedder::new(dims)))
    }

    fn small_cache(max_size: usize) -> SemanticCache {
        cache_with(SemanticCacheConfig {
            max_size,
            embedding_dimensions: 32,
            ..SemanticCacheConfig::default()
        })
    }

    #[tokio::test]
    async fn exact_hit_round_trip() {
        let cache = small_cache(16);
        let query = json!({"type": "node", "criteria": {"properties.name": {"op": "eq", "value": "AI"}}});
        let context = json!({"op": "execute_query"});

        cache
            .insert(&query, &context, json!([1, 2, 3]), CachePut::default())
            .await;

        let hit = cache.lookup(&query, &context, None).await.unwrap();
        assert_eq!(hit.source, CacheSource::Exact);
        assert_eq!(hit.value, json!([1, 2, 3]));
        assert_eq!(cache.stats().exact_hits, 1);
    }

    /// Provider that maps any text onto one of two fixed vectors so the
    /// similarity between "cat" and "feline" is controllable.
    struct PairedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PairedEmbedder {
        async fn generate_embedding(&self, text: &str) -> crate::error::NoemaResult<Vec<f32>> {
            Ok(match text {
                t if t.contains("cat") => vec![1.0, 0.0, 0.05],
                t if t.contains("feline") => vec![0.95, 0.0, 0.3],
                _ => vec![0.0, 1.0, 0.0],
            })
        }

        fn dimensions(&self) -> usize {
            3
        }
    }

    #[tokio::test]
    async fn semantic_hit_attaches_similarity() {
        let config = SemanticCacheConfig {
            embedding_dimensions: 3,
            ..SemanticCacheConfig::default()
        };
        let cache = SemanticCache::new(config, Arc::new(PairedEmbedder));

        cache
            .insert(
                &json!("cat"),
                &Value::Null,
                json!([{"score": 1.0}]),
                CachePut::default(),
            )
            .await;

        let hit = cache.lookup(&json!("feline"), &Value::Null, None).await.unwrap();
        assert_eq!(hit.source, CacheSource::Semantic);
        let similarity = hit.similarity.unwrap();
        assert!(similarity >= 0.85);

        // Scores were rescaled by the similarity.
        let score = hit.value[0]["score"].as_f64().unwrap();
        assert!((score - f64::from(similarity)).abs() < 1e-6);

        let miss = cache.lookup(&json!("submarine"), &Value::Null, None).await;
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn eviction_is_strictly_oldest_first() {
        let cache = small_cache(2);
        for (i, name) in ["first", "second", "third"].iter().enumerate() {
            cache
                .insert(&json!(name), &Value::Null, json!(i), CachePut::default())
                .await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&json!("first"), &Value::Null, Some(1.1)).await.is_none());
        assert!(cache.lookup(&json!("second"), &Value::Null, Some(1.1)).await.is_some());
        assert!(cache.lookup(&json!("third"), &Value::Null, Some(1.1)).await.is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_skipped_and_dropped() {
        let cache = small_cache(16);
        cache
            .insert(
                &json!("ephemeral"),
                &Value::Null,
                json!(1),
                CachePut {
                    ttl: Some(Duration::from_millis(5)),
                    ..CachePut::default()
                },
            )
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.lookup(&json!("ephemeral"), &Value::Null, None).await.is_none());
        assert_eq!(cache.len(), 0);
        assert!(cache.stats().expirations >= 1);
    }

    #[tokio::test]
    async fn invalidation_by_entity_and_context() {
        let cache = small_cache(16);
        let entity = Uuid::new_v4();

        cache
            .insert(
                &json!("q1"),
                &json!({"scope": "a"}),
                json!("r1"),
                CachePut {
                    entity_refs: HashSet::from([entity]),
                    ..CachePut::default()
                },
            )
            .await;
        cache
            .insert(&json!("q2"), &json!({"scope": "b"}), json!("r2"), CachePut::default())
            .await;

        assert_eq!(cache.invalidate(&InvalidationCriteria::Entity(entity)), 1);
        assert_eq!(
            cache.invalidate(&InvalidationCriteria::Context {
                path: "scope".into(),
                value: json!("b"),
            }),
            1
        );
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidation_by_age() {
        let cache = small_cache(16);
        cache
            .insert(&json!("old"), &Value::Null, json!(1), CachePut::default())
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        cache
            .insert(&json!("new"), &Value::Null, json!(2), CachePut::default())
            .await;

        assert_eq!(cache.invalidate(&InvalidationCriteria::OlderThan(cutoff)), 1);
        assert!(cache.lookup(&json!("new"), &Value::Null, Some(1.1)).await.is_some());
    }
}
