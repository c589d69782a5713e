use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::advanced::AdvancedQueryEngine;
use crate::error::{NoemaError, NoemaResult};
use crate::index::IndexTarget;
use crate::model::embedding::cosine_similarity;
use crate::model::node::Node;
use crate::query::QueryOptions;

// ---------------------------------------------------------------------------
// Semantic search: vector similarity with text and containment fallbacks
// ---------------------------------------------------------------------------

const DEFAULT_THRESHOLD: f32 = 0.7;
const DEFAULT_LIMIT: usize = 10;

/// What to search by: raw text, a precomputed vector, or the stored
/// embedding of an existing node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticQuery {
    Text(String),
    Embedding(Vec<f32>),
    Node(Uuid),
}

/// Options for `semantic_search` and `find_similar_nodes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticSearchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    /// Which named embedding to compare against; defaults to the default
    /// embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_kind: Option<String>,
}

/// A node with its similarity (or text-match) score, descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredNode {
    pub node: Node,
    pub score: f32,
}

impl AdvancedQueryEngine {
    /// Similarity search over node embeddings.
    ///
    /// Preference order: a declared vector index, then a pairwise scan of
    /// nodes carrying embeddings. Text queries that match nothing by vector
    /// fall back to the full-text index, or to per-property substring
    /// containment when none exists.
    pub async fn semantic_search(
        &self,
        query: &SemanticQuery,
        options: &SemanticSearchOptions,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<ScoredNode>> {
        if !self.config.enable_semantic_search {
            return Err(NoemaError::Unsupported(
                "semantic search is disabled (advanced_query.enable_semantic_search)".into(),
            ));
        }
        let ctx = self.op_ctx(opts);
        let limit = self
            .result_cap(options.limit.or(Some(DEFAULT_LIMIT)));
        let threshold = options.threshold.unwrap_or(DEFAULT_THRESHOLD);
        let kind = options.embedding_kind.as_deref().unwrap_or("default");

        let (embedding, exclude) = self.resolve_query_embedding(query).await?;

        let mut hits = if let Some(index_name) =
            self.indexes.find_vector_index(IndexTarget::Node).await
        {
            let scored = self
                .indexes
                .vector_top_k(&index_name, &embedding, limit.saturating_add(1), threshold)
                .await?;
            let mut hydrated = Vec::with_capacity(scored.len());
            for (id, score) in scored {
                ctx.checkpoint()?;
                if exclude == Some(id) {
                    continue;
                }
                if let Some(node) = self.store.get_node(&id).await? {
                    hydrated.push(ScoredNode { node, score });
                }
            }
            hydrated
        } else {
            self.scan_by_similarity(&embedding, kind, threshold, exclude)
                .await?
        };

        if hits.is_empty() {
            if let SemanticQuery::Text(text) = query {
                hits = self.text_fallback(text, limit).await?;
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Nodes most similar to an existing node, excluding itself.
    pub async fn find_similar_nodes(
        &self,
        node_id: &Uuid,
        options: &SemanticSearchOptions,
        opts: &QueryOptions,
    ) -> NoemaResult<Vec<ScoredNode>> {
        self.semantic_search(&SemanticQuery::Node(*node_id), options, opts)
            .await
    }

    async fn resolve_query_embedding(
        &self,
        query: &SemanticQuery,
    ) -> NoemaResult<(Vec<f32>, Option<Uuid>)> {
        match query {
            SemanticQuery::Text(text) => {
                Ok((self.embedder.generate_embedding(text).await?, None))
            }
            SemanticQuery::Embedding(embedding) => {
                if embedding.is_empty() {
                    return Err(NoemaError::InvalidArgument(
                        "query embedding must not be empty".into(),
                    ));
                }
                Ok((embedding.clone(), None))
            }
            SemanticQuery::Node(id) => {
                let node = self
                    .store
                    .get_node(id)
                    .await?
                    .ok_or(NoemaError::NodeNotFound(*id))?;
                let embedding = node.embedding("default").ok_or_else(|| {
                    NoemaError::InvalidArgument(format!("node {id} carries no embedding"))
                })?;
                Ok((embedding.to_vec(), Some(*id)))
            }
        }
    }

    /// Brute-force fallback: every node carrying the requested embedding
    /// kind, compared pairwise. Nodes with mismatched dimensions are skipped
    /// rather than failing the whole search.
    async fn scan_by_similarity(
        &self,
        embedding: &[f32],
        kind: &str,
        threshold: f32,
        exclude: Option<Uuid>,
    ) -> NoemaResult<Vec<ScoredNode>> {
        let nodes = self.store.scan_nodes().await?;
        let mut hits: Vec<ScoredNode> = Vec::new();
        for node in nodes {
            if exclude == Some(node.id) {
                continue;
            }
            let Some(candidate) = node.embedding(kind) else {
                continue;
            };
            let Ok(score) = cosine_similarity(embedding, candidate) else {
                continue;
            };
            if score >= threshold {
                hits.push(ScoredNode { node, score });
            }
        }
        Ok(hits)
    }

    /// Text search without embeddings: full-text index when declared,
    /// otherwise substring containment over string-valued properties with
    /// score = number of matching properties.
    async fn text_fallback(&self, text: &str, limit: usize) -> NoemaResult<Vec<ScoredNode>> {
        if let Some(index_name) = self.indexes.find_full_text_index(IndexTarget::Node).await {
            let scored = self.indexes.full_text_top_k(&index_name, text, limit).await?;
            let mut hits = Vec::with_capacity(scored.len());
            for (id, score) in scored {
                if let Some(node) = self.store.get_node(&id).await? {
                    hits.push(ScoredNode {
                        node,
                        score: score as f32,
                    });
                }
            }
            return Ok(hits);
        }

        let needle = text.to_lowercase();
        let nodes = self.store.scan_nodes().await?;
        let mut hits: Vec<ScoredNode> = Vec::new();
        for node in nodes {
            let matching = node
                .properties
                .values()
                .filter_map(|value| value.as_str())
                .filter(|s| s.to_lowercase().contains(&needle))
                .count();
            if matching > 0 {
                hits.push(ScoredNode {
                    node,
                    score: matching as f32,
                });
            }
        }
        Ok(hits)
    }
}
