//! Plan enumeration and selection through `explain_query`: candidate costs
//! follow the cost table and the cheapest plan is marked selected.

use noema::{
    Edge, EdgeType, IndexSpec, IndexTarget, Node, NodeType, NoemaEngine, QueryOptions,
    QueryShape, QuerySpec,
};
use uuid::Uuid;

async fn chain_engine() -> (NoemaEngine, Vec<Uuid>) {
    let engine = NoemaEngine::in_memory();
    engine.initialize().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..7 {
        let id = engine
            .add_node(Node::new(NodeType::Concept).with_property("i", i))
            .await
            .unwrap();
        ids.push(id);
    }
    for pair in ids.windows(2) {
        engine
            .add_edge(Edge::new(EdgeType::RelatedTo, pair[0], pair[1]))
            .await
            .unwrap();
    }
    (engine, ids)
}

fn deep_traversal(start: Uuid, end: Uuid) -> QuerySpec {
    let mut spec = QuerySpec::traversal(start);
    if let QueryShape::Traversal {
        end_id,
        edge_types,
        max_depth,
        ..
    } = &mut spec.shape
    {
        *end_id = Some(end);
        *edge_types = Some(vec![EdgeType::RelatedTo]);
        *max_depth = 6;
    }
    spec
}

#[tokio::test]
async fn bidirectional_wins_at_depth_six_without_an_index() {
    let (engine, ids) = chain_engine().await;
    let explanation = engine
        .explain_query(&deep_traversal(ids[0], ids[6]))
        .await
        .unwrap();

    let labels: Vec<&str> = explanation
        .candidates
        .iter()
        .map(|c| c.label.as_str())
        .collect();
    assert_eq!(labels, vec!["basic", "bidirectional"]);

    let basic = &explanation.candidates[0];
    let bidirectional = &explanation.candidates[1];
    // Cost table: breadth-first 100 per depth, bidirectional 50 per depth.
    assert_eq!(basic.cost, 600);
    assert_eq!(bidirectional.cost, 300);
    assert!(!basic.selected);
    assert!(bidirectional.selected);
}

#[tokio::test]
async fn composite_index_adds_a_cheaper_candidate() {
    let (engine, ids) = chain_engine().await;
    engine
        .create_index(
            "edges_by_source",
            IndexSpec::Property {
                target: IndexTarget::Edge,
                keys: vec!["source_id".into(), "edge_type".into()],
            },
        )
        .await
        .unwrap();

    let explanation = engine
        .explain_query(&deep_traversal(ids[0], ids[6]))
        .await
        .unwrap();

    let labels: Vec<&str> = explanation
        .candidates
        .iter()
        .map(|c| c.label.as_str())
        .collect();
    assert_eq!(labels, vec!["basic", "index", "bidirectional"]);

    let costs: Vec<u64> = explanation.candidates.iter().map(|c| c.cost).collect();
    assert_eq!(costs, vec![600, 60, 300]);

    let selected: Vec<&str> = explanation
        .candidates
        .iter()
        .filter(|c| c.selected)
        .map(|c| c.label.as_str())
        .collect();
    assert_eq!(selected, vec!["index"]);
}

#[tokio::test]
async fn explain_never_executes_or_caches() {
    let (engine, ids) = chain_engine().await;

    engine
        .explain_query(&deep_traversal(ids[0], ids[6]))
        .await
        .unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.cache.size, 0);
    assert_eq!(stats.cache.hits, 0);
    assert_eq!(stats.nodes, 7);
    assert_eq!(stats.edges, 6);
}

#[tokio::test]
async fn selected_plans_agree_on_results() {
    let (engine, ids) = chain_engine().await;
    let spec = deep_traversal(ids[0], ids[6]);

    // Bidirectional (selected) and the basic plan must agree; force a fresh
    // execution for each by bypassing the cache.
    let selected = engine
        .execute_query(&spec, &QueryOptions::default().bypassing_cache())
        .await
        .unwrap();
    assert_eq!(selected.items.len(), 1);
    assert_eq!(
        selected.items[0]["id"],
        serde_json::json!(ids[6].to_string())
    );

    // With an index created, the index plan takes over and still agrees.
    engine
        .create_index(
            "edges_by_source",
            IndexSpec::Property {
                target: IndexTarget::Edge,
                keys: vec!["source_id".into(), "edge_type".into()],
            },
        )
        .await
        .unwrap();
    let indexed = engine
        .execute_query(&spec, &QueryOptions::default().bypassing_cache())
        .await
        .unwrap();
    assert_eq!(indexed.items, selected.items);
}

#[tokio::test]
async fn invalid_specs_are_rejected_before_execution() {
    let (engine, _) = chain_engine().await;

    let invalid = QuerySpec::new(QueryShape::Node {
        id: None,
        criteria: None,
    });
    let err = engine.explain_query(&invalid).await.unwrap_err();
    assert_eq!(err.kind(), noema::ErrorKind::InvalidQuery);

    let err = engine
        .execute_query(&invalid, &QueryOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), noema::ErrorKind::InvalidQuery);
}
