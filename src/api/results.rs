//! Result store endpoints used by workers and clients

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;

use crate::Result;
use crate::hub::Hub;

#[derive(Debug, Serialize)]
pub struct SetResultResponse {
    pub message: &'static str,
    pub request_id: String,
}

async fn get_result(
    State(hub): State<Arc<Hub>>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>> {
    Ok(Json(hub.get_result(&request_id).await?))
}

async fn set_result(
    State(hub): State<Arc<Hub>>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Json<SetResultResponse>> {
    let Json(payload) = payload?;
    let request_id = hub.set_result(payload).await?;
    Ok(Json(SetResultResponse {
        message: "Result stored",
        request_id,
    }))
}

/// Build the result router
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/get_server_result/{*request_id}", get(get_result))
        .route("/set_result/", post(set_result))
        .with_state(hub)
}
