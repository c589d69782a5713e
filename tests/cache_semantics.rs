//! Semantic cache behavior through the facade: exact hits on repeat,
//! approximate hits for near-identical queries, and invalidation on write.

use async_trait::async_trait;
use noema::{
    CacheSource, Node, NodeType, NoemaConfig, NoemaEngine, NoemaResult, QueryOptions,
    SemanticQuery, SemanticSearchOptions,
};
use std::sync::Arc;

/// Embedding provider with fixed directions: anything mentioning "cat" and
/// anything mentioning "feline" land at cosine ~0.95; other text is
/// orthogonal.
struct PairedEmbedder;

#[async_trait]
impl noema::EmbeddingProvider for PairedEmbedder {
    async fn generate_embedding(&self, text: &str) -> NoemaResult<Vec<f32>> {
        let needle = text.to_lowercase();
        Ok(if needle.contains("feline") {
            vec![0.9493, 0.0, 0.3143]
        } else if needle.contains("cat") {
            vec![1.0, 0.0, 0.0]
        } else {
            vec![0.0, 1.0, 0.0]
        })
    }

    fn dimensions(&self) -> usize {
        3
    }
}

async fn engine_with_paired_embedder() -> NoemaEngine {
    let mut config = NoemaConfig::default();
    config.semantic_cache.embedding_dimensions = 3;
    let engine = NoemaEngine::builder(config)
        .with_embedding_provider(Arc::new(PairedEmbedder))
        .build();
    engine.initialize().await.unwrap();

    // A couple of nodes carrying embeddings so searches return something.
    engine
        .add_node(
            Node::new(NodeType::Concept)
                .with_property("name", "cat")
                .with_embedding(vec![1.0, 0.0, 0.0]),
        )
        .await
        .unwrap();
    engine
        .add_node(
            Node::new(NodeType::Concept)
                .with_property("name", "dog")
                .with_embedding(vec![0.0, 1.0, 0.0]),
        )
        .await
        .unwrap();
    engine
}

#[tokio::test]
async fn exact_then_semantic_cache_hits() {
    let engine = engine_with_paired_embedder().await;
    let options = SemanticSearchOptions::default();
    let opts = QueryOptions::default();

    // First call misses and populates.
    let first = engine
        .semantic_search(&SemanticQuery::Text("cat".into()), &options, &opts)
        .await
        .unwrap();
    assert!(first.cache_source.is_none());
    assert_eq!(first.items.len(), 1);
    assert_eq!(first.items[0].node.properties["name"], "cat");

    // Identical query: exact hit.
    let second = engine
        .semantic_search(&SemanticQuery::Text("cat".into()), &options, &opts)
        .await
        .unwrap();
    assert_eq!(second.cache_source, Some(CacheSource::Exact));
    assert_eq!(second.items.len(), 1);

    // Near-identical query: semantic hit with the similarity attached.
    let third = engine
        .semantic_search(&SemanticQuery::Text("feline".into()), &options, &opts)
        .await
        .unwrap();
    assert_eq!(third.cache_source, Some(CacheSource::Semantic));
    let similarity = third.similarity.unwrap();
    assert!(similarity >= 0.85, "similarity {similarity} below threshold");
    assert_eq!(third.items.len(), 1);
}

#[tokio::test]
async fn unrelated_query_misses_the_cache() {
    let engine = engine_with_paired_embedder().await;
    let options = SemanticSearchOptions::default();
    let opts = QueryOptions::default();

    engine
        .semantic_search(&SemanticQuery::Text("cat".into()), &options, &opts)
        .await
        .unwrap();

    let other = engine
        .semantic_search(&SemanticQuery::Text("submarine".into()), &options, &opts)
        .await
        .unwrap();
    assert!(other.cache_source.is_none());

    let stats = engine.stats().await.unwrap();
    assert!(stats.cache.misses >= 1);
}

#[tokio::test]
async fn caller_can_raise_the_similarity_threshold() {
    let engine = engine_with_paired_embedder().await;
    let options = SemanticSearchOptions::default();

    engine
        .semantic_search(
            &SemanticQuery::Text("cat".into()),
            &options,
            &QueryOptions::default(),
        )
        .await
        .unwrap();

    // At a 0.99 threshold the 0.95 pair no longer qualifies.
    let strict = QueryOptions {
        similarity_threshold: Some(0.99),
        ..QueryOptions::default()
    };
    let result = engine
        .semantic_search(&SemanticQuery::Text("feline".into()), &options, &strict)
        .await
        .unwrap();
    assert!(result.cache_source.is_none());
}

#[tokio::test]
async fn mutating_a_cited_node_invalidates_cached_search() {
    let engine = engine_with_paired_embedder().await;
    let options = SemanticSearchOptions::default();
    let opts = QueryOptions::default();

    let first = engine
        .semantic_search(&SemanticQuery::Text("cat".into()), &options, &opts)
        .await
        .unwrap();
    let cited = first.items[0].node.id;

    engine.delete_node(&cited).await.unwrap();

    let after = engine
        .semantic_search(&SemanticQuery::Text("cat".into()), &options, &opts)
        .await
        .unwrap();
    assert!(after.cache_source.is_none());
    assert!(after.items.is_empty());
}

#[tokio::test]
async fn clear_and_stats_cover_the_cache_surface() {
    let engine = engine_with_paired_embedder().await;
    let options = SemanticSearchOptions::default();
    let opts = QueryOptions::default();

    engine
        .semantic_search(&SemanticQuery::Text("cat".into()), &options, &opts)
        .await
        .unwrap();
    assert!(engine.stats().await.unwrap().cache.size >= 1);

    let removed = engine.clear_cache().unwrap();
    assert!(removed >= 1);
    assert_eq!(engine.stats().await.unwrap().cache.size, 0);
}
