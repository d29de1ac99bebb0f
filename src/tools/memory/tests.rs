use super::*;
use crate::db::Database;
use serde_json::json;

fn registry() -> ToolRegistry {
    let db = Arc::new(Database::open_in_memory().expect("open db"));
    let graph = Arc::new(KnowledgeGraph::new(db).expect("graph"));
    let mut registry = ToolRegistry::new();
    MemoryTool::register_all(&mut registry, &graph);
    registry
}

fn ctx() -> InvocationContext {
    InvocationContext::new("mcp")
}

#[tokio::test]
async fn test_all_ops_registered() {
    let registry = registry();
    for op in MemoryOp::ALL {
        assert!(
            registry.get("memory", op.name()).is_some(),
            "memory_{} missing from registry",
            op.name()
        );
    }
}

#[tokio::test]
async fn test_store_search_roundtrip_through_tools() {
    let registry = registry();
    let store = registry.lookup("memory", "store").expect("store tool");
    let stored = store
        .invoke(
            json!({"content": "Machine learning is a subset of AI", "tags": ["ml"]}),
            &ctx(),
        )
        .await
        .expect("store");
    let id = stored["id"].as_str().expect("id").to_string();

    let search = registry.lookup("memory", "search").expect("search tool");
    let found = search
        .invoke(json!({"query": "machine learning", "search_mode": "fulltext"}), &ctx())
        .await
        .expect("search");
    assert_eq!(found["results"][0]["node"]["id"], id.as_str());
    assert!(found["results"][0]["relevance_score"].as_f64().expect("score") > 0.0);
}

#[tokio::test]
async fn test_link_and_children_through_tools() {
    let registry = registry();
    let store = registry.lookup("memory", "store").expect("store tool");
    let parent = store
        .invoke(json!({"content": "parent node"}), &ctx())
        .await
        .expect("store")["id"]
        .as_str()
        .expect("id")
        .to_string();
    let child = store
        .invoke(json!({"content": "child node"}), &ctx())
        .await
        .expect("store")["id"]
        .as_str()
        .expect("id")
        .to_string();

    let link = registry.lookup("memory", "link").expect("link tool");
    let linked = link
        .invoke(
            json!({"source_id": parent, "target_id": child, "relation": "parent_of"}),
            &ctx(),
        )
        .await
        .expect("link");
    assert_eq!(linked["created"], true);

    let children = registry.lookup("memory", "children").expect("children tool");
    let result = children.invoke(json!({"id": parent}), &ctx()).await.expect("children");
    assert_eq!(result["total"], 1);
    assert_eq!(result["nodes"][0]["id"], child.as_str());
}

#[tokio::test]
async fn test_invalid_search_mode_rejected() {
    let registry = registry();
    let search = registry.lookup("memory", "search").expect("search tool");
    let err = search
        .invoke(json!({"query": "x", "search_mode": "vector"}), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_parameter");
}

#[tokio::test]
async fn test_get_missing_node_suggests_search() {
    let registry = registry();
    let get = registry.lookup("memory", "get").expect("get tool");
    let err = get.invoke(json!({"id": "ghost"}), &ctx()).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
