//! Worker-side endpoint exposing a device's actions as tools
//!
//! Serves the same `/health`, `/tools` and `/tools/call_tool` surface the hub
//! expects from a `direct` backend.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    routing::{get, post},
};
use serde_json::{Map, Value};

use super::tools::take_tool_name;
use crate::Result;
use crate::commands::DeviceToolset;
use crate::tools::{Content, ToolDescriptor};

async fn list_tools(State(toolset): State<Arc<DeviceToolset>>) -> Json<Vec<ToolDescriptor>> {
    Json(toolset.tools())
}

async fn call_tool(
    State(toolset): State<Arc<DeviceToolset>>,
    payload: std::result::Result<Json<Map<String, Value>>, JsonRejection>,
) -> Result<Json<Content>> {
    let Json(body) = payload?;
    let (name, arguments) = take_tool_name(body);
    if name.is_empty() {
        return Err(crate::Error::Validation("Tool name not provided".to_string()));
    }
    Ok(Json(toolset.call_content(&name, arguments).await?))
}

/// Build the worker router
pub fn router(toolset: Arc<DeviceToolset>) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/call_tool", post(call_tool))
        .with_state(toolset)
        .merge(super::health::router())
}
