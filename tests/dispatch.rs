//! Tool aggregation and dispatch across registered servers

use std::sync::Arc;

use serde_json::{Map, Value, json};

use scp_hub::Error;
use scp_hub::registry::PERMISSION_SERVER_NAME;

mod common;
use common::{ScriptedClient, StaticProber, hub_with, hub_with_servers, registration};

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn falls_back_to_the_server_exposing_the_tool() {
    let client = Arc::new(
        ScriptedClient::default()
            .with_tools("first", &["other"])
            .with_tools("second", &["T"]),
    );
    let hub = hub_with_servers(client.clone(), &["first", "second"]).await;

    let content = hub.call_tool("T", args(json!({"x": 1}))).await.unwrap();
    assert_eq!(content[0]["text"], "second:T");
    assert_eq!(client.calls(), vec![("second".to_string(), "T".to_string())]);
    assert_eq!(client.last_arguments().unwrap()["x"], 1);
}

#[tokio::test]
async fn unreachable_server_is_skipped() {
    let client = Arc::new(
        ScriptedClient::default()
            .with_tools("first", &["T"])
            .with_tools("second", &["T"])
            .unreachable("first"),
    );
    let hub = hub_with_servers(client.clone(), &["first", "second"]).await;

    let content = hub.call_tool("T", Map::new()).await.unwrap();
    assert_eq!(content[0]["text"], "second:T");
}

#[tokio::test]
async fn missing_tool_everywhere_is_not_found() {
    let client = Arc::new(
        ScriptedClient::default()
            .with_tools("first", &["a"])
            .with_tools("second", &["b"]),
    );
    let hub = hub_with_servers(client, &["first", "second"]).await;

    let err = hub.call_tool("T", Map::new()).await.unwrap_err();
    assert!(matches!(err, Error::ToolNotFound { ref tool, server: None } if tool == "T"));
}

#[tokio::test]
async fn qualified_name_targets_one_server() {
    let client = Arc::new(
        ScriptedClient::default()
            .with_tools("first", &["T"])
            .with_tools("second", &["T"]),
    );
    let hub = hub_with_servers(client.clone(), &["first", "second"]).await;

    let content = hub.call_tool("second.T", Map::new()).await.unwrap();
    assert_eq!(content[0]["text"], "second:T");

    let err = hub.call_tool("first.missing", Map::new()).await.unwrap_err();
    assert!(
        matches!(err, Error::ToolNotFound { server: Some(ref s), .. } if s == "first"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn unknown_server_is_reported() {
    let hub = hub_with_servers(Arc::new(ScriptedClient::default()), &["first"]).await;
    let err = hub.call_tool("ghost.T", Map::new()).await.unwrap_err();
    assert!(matches!(err, Error::ServerNotFound(ref name) if name == "ghost"));

    let err = hub.list_tools(Some("ghost")).await.unwrap_err();
    assert!(matches!(err, Error::ServerNotFound(_)));
}

#[tokio::test]
async fn permission_tool_on_other_server_is_denied() {
    let client = Arc::new(ScriptedClient::default().with_tools("other", &["ask_for_permission"]));
    let hub = hub_with_servers(client.clone(), &["other"]).await;

    let err = hub
        .call_tool("other.ask_for_permission", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(client.calls().is_empty());
}

#[tokio::test]
async fn bare_permission_tool_goes_to_permission_service() {
    let client = Arc::new(
        ScriptedClient::default()
            .with_tools("other", &["ask_for_permission"])
            .with_tools(PERMISSION_SERVER_NAME, &["ask_for_permission"]),
    );
    let hub = hub_with_servers(client.clone(), &["other"]).await;
    hub.bootstrap(Some(registration(PERMISSION_SERVER_NAME, 8010)))
        .await
        .unwrap();

    let content = hub.call_tool("ask_for_permission", Map::new()).await.unwrap();
    assert_eq!(
        content[0]["text"],
        format!("{PERMISSION_SERVER_NAME}:ask_for_permission")
    );
}

#[tokio::test]
async fn empty_tool_name_is_invalid() {
    let hub = hub_with_servers(Arc::new(ScriptedClient::default()), &[]).await;
    let err = hub.call_tool("", Map::new()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn catalog_is_namespaced_and_skips_unhealthy_servers() {
    let client = Arc::new(
        ScriptedClient::default()
            .with_tools("up", &["a", "b"])
            .with_tools("down", &["c"]),
    );
    let hub = hub_with(client, StaticProber::with_down(&["down"]));
    hub.register(registration("up", 6101)).await.unwrap();
    hub.register(registration("down", 6102)).await.unwrap();

    let names: Vec<String> = hub
        .list_tools(None)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["up.a", "up.b"]);

    let servers: Vec<String> = hub
        .healthy_servers()
        .await
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(servers, vec!["up"]);
}

#[tokio::test]
async fn failing_catalog_marks_server_unhealthy() {
    let client = Arc::new(
        ScriptedClient::default()
            .with_tools("flaky", &["a"])
            .unreachable("flaky"),
    );
    let hub = hub_with_servers(client, &["flaky"]).await;

    assert!(hub.list_tools(None).await.unwrap().is_empty());
    assert!(hub.healthy_servers().await.is_empty());
}
