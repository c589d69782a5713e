//! noema: an in-process knowledge-graph engine.
//!
//! A directed labeled property graph with secondary indexes (property,
//! full-text, vector, temporal), a cost-based structured query processor,
//! advanced search (path finding, pattern matching, semantic similarity),
//! and a semantic result cache with approximate lookup. The [`NoemaEngine`]
//! facade coordinates all of it behind a single async surface.

pub mod advanced;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod index;
pub mod model;
pub mod query;
pub mod store;

pub use advanced::{
    AdvancedQuerySpec, EdgeConstraint, GraphPath, GraphPattern, NodeConstraint, PathOptions,
    PatternComplexity, PatternMatch, ScoredNode, SemanticQuery, SemanticSearchOptions,
};
pub use cache::{CacheSource, CacheStats, InvalidationCriteria};
pub use config::{load_config, NoemaConfig};
pub use engine::{EngineStats, NoemaEngine, NoemaEngineBuilder, SemanticSearchResult};
pub use error::{ErrorKind, NoemaError, NoemaResult};
pub use event::GraphEvent;
pub use index::{IndexKind, IndexSpec, IndexTarget};
pub use model::{
    cosine_similarity, Criteria, Edge, EdgePatch, EdgeType, EmbeddingProvider, HashEmbedder,
    Node, NodePatch, NodeType, Predicate,
};
pub use query::{
    Aggregation, Direction, EdgeStep, FilterCondition, PatternSegment, QueryExplanation,
    QueryMetadata, QueryOptions, QueryResult, QueryShape, QuerySpec, SortDirection, SortKey,
};
pub use store::{CascadePolicy, GraphStore, InMemoryGraphStore};
