use crate::error::{NoemaError, NoemaResult};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Engine configuration: one typed struct per subsystem, file + env loadable
// ---------------------------------------------------------------------------

/// Top-level configuration for a noema engine instance.
///
/// Every field has a default, so `NoemaConfig::default()` yields a fully
/// working in-memory engine. Values can also be loaded from a `noema.*`
/// config file and `NOEMA__`-prefixed environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoemaConfig {
    pub graph: GraphConfig,
    pub indexing: IndexingConfig,
    pub semantic_cache: SemanticCacheConfig,
    pub query_processor: QueryProcessorConfig,
    pub advanced_query: AdvancedQueryConfig,
}

impl Default for NoemaConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            indexing: IndexingConfig::default(),
            semantic_cache: SemanticCacheConfig::default(),
            query_processor: QueryProcessorConfig::default(),
            advanced_query: AdvancedQueryConfig::default(),
        }
    }
}

/// Graph store behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// When true, deleting a node removes its incident edges. When false,
    /// deletion of a node with incident edges fails with an integrity error.
    pub cascade_delete: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            cascade_delete: false,
        }
    }
}

/// Index manager limits and toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub max_indexes: usize,
    pub vector_dimensions: usize,
    pub vector_distance_metric: String,
    pub enable_full_text: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_indexes: 100,
            vector_dimensions: 768,
            vector_distance_metric: "cosine".to_string(),
            enable_full_text: true,
        }
    }
}

/// Semantic cache sizing and similarity thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SemanticCacheConfig {
    pub default_ttl_ms: u64,
    pub max_size: usize,
    pub default_similarity_threshold: f32,
    pub embedding_dimensions: usize,
}

impl SemanticCacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 3_600_000,
            max_size: 1000,
            default_similarity_threshold: 0.85,
            embedding_dimensions: 768,
        }
    }
}

/// Structured query planning and execution limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryProcessorConfig {
    pub max_query_cache_size: usize,
    pub max_result_size: usize,
    pub default_timeout_ms: u64,
}

impl QueryProcessorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl Default for QueryProcessorConfig {
    fn default() -> Self {
        Self {
            max_query_cache_size: 100,
            max_result_size: 10_000,
            default_timeout_ms: 30_000,
        }
    }
}

/// Path finding, pattern matching, and semantic search limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvancedQueryConfig {
    pub max_path_length: usize,
    pub max_recursion_depth: usize,
    pub enable_semantic_search: bool,
    pub max_results_per_query: usize,
    pub timeout_ms: u64,
}

impl AdvancedQueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AdvancedQueryConfig {
    fn default() -> Self {
        Self {
            max_path_length: 10,
            max_recursion_depth: 5,
            enable_semantic_search: true,
            max_results_per_query: 1000,
            timeout_ms: 30_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration from an optional file plus `NOEMA__` environment
/// variables. Missing sources fall back to defaults.
pub fn load_config(path: Option<&Path>) -> NoemaResult<NoemaConfig> {
    let mut builder = Config::builder()
        .add_source(File::with_name("noema").required(false))
        .add_source(Environment::with_prefix("NOEMA").separator("__"));

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }

    let config = builder
        .build()
        .map_err(|err| NoemaError::Config(err.to_string()))?;

    let parsed: NoemaConfig = config
        .try_deserialize()
        .map_err(|err| NoemaError::Config(err.to_string()))?;

    validate(&parsed)?;
    Ok(parsed)
}

fn validate(config: &NoemaConfig) -> NoemaResult<()> {
    if config.indexing.vector_dimensions == 0 {
        return Err(NoemaError::Config(
            "indexing.vector_dimensions must be positive".to_string(),
        ));
    }
    if config.indexing.vector_distance_metric != "cosine" {
        return Err(NoemaError::Config(format!(
            "unsupported indexing.vector_distance_metric '{}'; expected 'cosine'",
            config.indexing.vector_distance_metric
        )));
    }
    let threshold = config.semantic_cache.default_similarity_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(NoemaError::Config(format!(
            "semantic_cache.default_similarity_threshold {} outside [0, 1]",
            threshold
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_keys() {
        let config = NoemaConfig::default();
        assert_eq!(config.advanced_query.max_path_length, 10);
        assert_eq!(config.advanced_query.max_recursion_depth, 5);
        assert!(config.advanced_query.enable_semantic_search);
        assert_eq!(config.advanced_query.max_results_per_query, 1000);
        assert_eq!(config.advanced_query.timeout_ms, 30_000);
        assert_eq!(config.query_processor.max_query_cache_size, 100);
        assert_eq!(config.query_processor.max_result_size, 10_000);
        assert_eq!(config.query_processor.default_timeout_ms, 30_000);
        assert_eq!(config.semantic_cache.default_ttl_ms, 3_600_000);
        assert_eq!(config.semantic_cache.max_size, 1000);
        assert_eq!(config.semantic_cache.default_similarity_threshold, 0.85);
        assert_eq!(config.semantic_cache.embedding_dimensions, 768);
        assert_eq!(config.indexing.max_indexes, 100);
        assert_eq!(config.indexing.vector_dimensions, 768);
        assert_eq!(config.indexing.vector_distance_metric, "cosine");
        assert!(config.indexing.enable_full_text);
        assert!(!config.graph.cascade_delete);
    }

    #[test]
    fn rejects_unknown_distance_metric() {
        let mut config = NoemaConfig::default();
        config.indexing.vector_distance_metric = "manhattan".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = NoemaConfig::default();
        config.semantic_cache.default_similarity_threshold = 1.5;
        assert!(validate(&config).is_err());
    }
}
