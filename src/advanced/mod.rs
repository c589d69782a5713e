pub mod paths;
pub mod pattern;
pub mod semantic;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::AdvancedQueryConfig;
use crate::error::{NoemaError, NoemaResult};
use crate::index::IndexManager;
use crate::model::embedding::EmbeddingProvider;
use crate::query::QueryOptions;
use crate::store::GraphStore;

pub use paths::{GraphPath, PathOptions};
pub use pattern::{
    EdgeConstraint, GraphPattern, NodeConstraint, PatternComplexity, PatternMatch,
};
pub use semantic::{ScoredNode, SemanticQuery, SemanticSearchOptions};

// ---------------------------------------------------------------------------
// AdvancedQueryEngine: path finding, pattern matching, semantic search
// ---------------------------------------------------------------------------

/// The advanced query surface over store, indexes, and embeddings. Holds no
/// mutable state of its own; every call runs against the live components.
pub struct AdvancedQueryEngine {
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) indexes: Arc<IndexManager>,
    pub(crate) embedder: Arc<dyn EmbeddingProvider>,
    pub(crate) config: AdvancedQueryConfig,
    /// Shared with the facade's writers; held in read mode across one
    /// frontier expansion (or one seed binding) and released between them.
    pub(crate) write_gate: Arc<tokio::sync::RwLock<()>>,
}

impl AdvancedQueryEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        indexes: Arc<IndexManager>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: AdvancedQueryConfig,
    ) -> Self {
        Self {
            store,
            indexes,
            embedder,
            config,
            write_gate: Arc::new(tokio::sync::RwLock::new(())),
        }
    }

    /// Share the facade's writer gate so searches see committed snapshots.
    pub fn with_write_gate(mut self, gate: Arc<tokio::sync::RwLock<()>>) -> Self {
        self.write_gate = gate;
        self
    }

    /// Dispatch a tagged advanced query and serialize its results, so the
    /// facade can cache them uniformly.
    pub async fn execute(
        &self,
        spec: &AdvancedQuerySpec,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<Value>> {
        match spec {
            AdvancedQuerySpec::Paths {
                start,
                end,
                options,
            } => {
                let paths = self.find_paths(start, end, options, opts).await?;
                paths
                    .iter()
                    .map(|p| serde_json::to_value(p).map_err(NoemaError::from))
                    .collect()
            }
            AdvancedQuerySpec::Pattern { pattern } => {
                let matches = self.find_patterns(pattern, opts).await?;
                matches
                    .iter()
                    .map(|m| serde_json::to_value(m).map_err(NoemaError::from))
                    .collect()
            }
            AdvancedQuerySpec::Semantic { query, options } => {
                let hits = self.semantic_search(query, options, opts).await?;
                hits.iter()
                    .map(|h| serde_json::to_value(h).map_err(NoemaError::from))
                    .collect()
            }
        }
    }

    pub(crate) fn op_ctx(&self, opts: &QueryOptions) -> OpCtx {
        let timeout = opts.timeout.unwrap_or_else(|| self.config.timeout());
        OpCtx {
            deadline: Instant::now() + timeout,
            timeout,
            cancellation: opts
                .cancellation
                .clone()
                .unwrap_or_else(CancellationToken::new),
        }
    }

    pub(crate) fn result_cap(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.config.max_results_per_query)
            .min(self.config.max_results_per_query)
    }
}

/// A tagged advanced query, the input of `execute_advanced_query`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdvancedQuerySpec {
    Paths {
        start: uuid::Uuid,
        end: uuid::Uuid,
        #[serde(default)]
        options: PathOptions,
    },
    Pattern {
        pattern: GraphPattern,
    },
    Semantic {
        query: SemanticQuery,
        #[serde(default)]
        options: SemanticSearchOptions,
    },
}

/// Deadline and cancellation scope for one advanced operation. Checked
/// between frontier expansions and candidate extensions so long searches
/// stay cooperative.
pub(crate) struct OpCtx {
    deadline: Instant,
    timeout: Duration,
    cancellation: CancellationToken,
}

impl OpCtx {
    pub(crate) fn checkpoint(&self) -> NoemaResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(NoemaError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(NoemaError::Timeout(self.timeout));
        }
        Ok(())
    }
}
