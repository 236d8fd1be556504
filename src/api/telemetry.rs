//! Inspection of recent device status messages

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};

use crate::hub::Hub;
use crate::telemetry::StatusUpdate;

async fn status_updates(State(hub): State<Arc<Hub>>) -> Json<Vec<StatusUpdate>> {
    Json(
        hub.telemetry()
            .map(|bridge| bridge.status_updates())
            .unwrap_or_default(),
    )
}

/// Build the telemetry router; empty history when no bridge is configured
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/status_updates", get(status_updates))
        .with_state(hub)
}
