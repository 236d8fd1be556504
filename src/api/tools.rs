//! Aggregated tool catalog and dispatch endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::Result;
use crate::hub::Hub;
use crate::tools::{Content, ToolDescriptor};

#[derive(Debug, Deserialize)]
pub struct ToolsQuery {
    pub server_name: Option<String>,
}

async fn list_tools(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<ToolsQuery>,
) -> Result<Json<Vec<ToolDescriptor>>> {
    let server_name = query.server_name.as_deref().filter(|s| !s.is_empty());
    Ok(Json(hub.list_tools(server_name).await?))
}

/// Split `{name, ...arguments}` into the tool name and its arguments
pub(crate) fn take_tool_name(mut body: Map<String, Value>) -> (String, Map<String, Value>) {
    let name = match body.remove("name") {
        Some(Value::String(name)) => name,
        _ => String::new(),
    };
    (name, body)
}

async fn call_tool(
    State(hub): State<Arc<Hub>>,
    payload: std::result::Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<Json<Content>> {
    let Json(body) = payload?;
    let (name, arguments) = take_tool_name(body);
    Ok(Json(hub.call_tool(&name, arguments).await?))
}

/// Build the tool router
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/call_tool", post(call_tool))
        .with_state(hub)
}
