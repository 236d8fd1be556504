//! Server registration endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hub::Hub;
use crate::registry::{BackendServer, PortRequest, Registration, ServerKind};
use crate::{Error, Result};

/// Body of `POST /register_server`
#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub server_url: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub server_description: String,
    #[serde(default)]
    pub server_port: Option<Value>,
    #[serde(default, rename = "type")]
    pub kind: Option<ServerKind>,
}

impl RegisterRequest {
    /// Convert into a registry entry
    ///
    /// # Errors
    ///
    /// Returns a validation error for a port that is neither a number nor a
    /// numeric string
    pub fn into_registration(self) -> Result<Registration> {
        let port = match self.server_port {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(
                n.as_i64()
                    .ok_or_else(|| Error::Validation(format!("invalid server_port: {n}")))?,
            ),
            Some(Value::String(s)) => Some(
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| Error::Validation(format!("invalid server_port: {s}")))?,
            ),
            Some(other) => {
                return Err(Error::Validation(format!("invalid server_port: {other}")));
            }
        };

        Ok(Registration {
            name: self.server_name,
            url: self.server_url,
            description: self.server_description,
            port: PortRequest::from_wire(port)?,
            kind: self.kind.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: &'static str,
    pub server: BackendServer,
}

/// Entry of `GET /servers`
#[derive(Debug, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub url: String,
    pub description: String,
    pub port: u16,
}

async fn register(
    State(hub): State<Arc<Hub>>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let Json(request) = payload?;
    let server = hub.register(request.into_registration()?).await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "Server registered successfully",
            server,
        }),
    ))
}

async fn list_servers(State(hub): State<Arc<Hub>>) -> Json<Vec<ServerSummary>> {
    let servers = hub
        .healthy_servers()
        .await
        .into_iter()
        .map(|s| ServerSummary {
            name: s.name,
            url: s.url,
            description: s.description,
            port: s.port,
        })
        .collect();
    Json(servers)
}

/// Build the registration router
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/register_server", post(register))
        .route("/servers", get(list_servers))
        .with_state(hub)
}
