//! End-to-end CRUD round-trip: nodes, an edge, a traversal, and the default
//! reject-on-delete policy for nodes with incident edges.

use noema::{
    Edge, EdgeType, ErrorKind, Node, NodeType, NoemaEngine, QueryOptions, QueryShape, QuerySpec,
};
use serde_json::json;

async fn live_engine() -> NoemaEngine {
    let engine = NoemaEngine::in_memory();
    engine.initialize().await.unwrap();
    engine
}

fn isa_traversal(start: uuid::Uuid) -> QuerySpec {
    let mut spec = QuerySpec::traversal(start);
    if let QueryShape::Traversal {
        edge_types,
        max_depth,
        ..
    } = &mut spec.shape
    {
        *edge_types = Some(vec![EdgeType::IsA]);
        *max_depth = 1;
    }
    spec
}

#[tokio::test]
async fn crud_round_trip_with_reject_cascade() {
    let engine = live_engine().await;

    let x = engine
        .add_node(Node::new(NodeType::Concept).with_property("name", "AI"))
        .await
        .unwrap();
    let y = engine
        .add_node(Node::new(NodeType::Concept).with_property("name", "ML"))
        .await
        .unwrap();
    let e = engine
        .add_edge(Edge::new(EdgeType::IsA, y, x))
        .await
        .unwrap();

    // ML --IsA--> AI is reachable in one outgoing hop.
    let result = engine
        .execute_query(&isa_traversal(y), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0]["id"], json!(x.to_string()));
    assert_eq!(result.items[0]["properties"]["name"], json!("AI"));

    // Deleting the referenced node is rejected while the edge exists.
    let err = engine.delete_node(&x).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IntegrityViolation);
    assert!(engine.get_node(&x).await.unwrap().is_some());

    engine.delete_edge(&e).await.unwrap();
    engine.delete_node(&x).await.unwrap();
    assert!(engine.get_node(&x).await.unwrap().is_none());
    assert!(engine.get_edge(&e).await.unwrap().is_none());

    // The identical traversal now yields nothing, including through the
    // cache: the deletion invalidated every entry citing the node.
    let result = engine
        .execute_query(&isa_traversal(y), &QueryOptions::default())
        .await
        .unwrap();
    assert!(result.items.is_empty());
}

#[tokio::test]
async fn node_properties_round_trip_and_indexes_follow() {
    let engine = live_engine().await;
    engine
        .create_index(
            "by_name",
            noema::IndexSpec::Property {
                target: noema::IndexTarget::Node,
                keys: vec!["properties.name".into()],
            },
        )
        .await
        .unwrap();

    let node = Node::new(NodeType::Entity)
        .with_property("name", "Turing")
        .with_property("born", 1912);
    let id = engine.add_node(node.clone()).await.unwrap();

    let fetched = engine.get_node(&id).await.unwrap().unwrap();
    assert_eq!(fetched.properties, node.properties);

    // The declared property index saw the insert.
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.indexes["by_name"].entries, 1);

    // Delete removes the node from store and indexes alike.
    engine.delete_node(&id).await.unwrap();
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.indexes["by_name"].entries, 0);
    assert_eq!(stats.nodes, 0);
}

#[tokio::test]
async fn cascade_policy_can_be_selected_by_config() {
    let mut config = noema::NoemaConfig::default();
    config.graph.cascade_delete = true;
    let engine = NoemaEngine::builder(config).build();
    engine.initialize().await.unwrap();

    let a = engine.add_node(Node::new(NodeType::Concept)).await.unwrap();
    let b = engine.add_node(Node::new(NodeType::Concept)).await.unwrap();
    let e = engine
        .add_edge(Edge::new(EdgeType::RelatedTo, a, b))
        .await
        .unwrap();

    engine.delete_node(&a).await.unwrap();
    assert!(engine.get_edge(&e).await.unwrap().is_none());
    assert_eq!(engine.stats().await.unwrap().edges, 0);
}
