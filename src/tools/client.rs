//! Transport clients for talking to backend servers

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::rpc::{RpcRequest, find_response};
use super::types::{Content, ToolDescriptor};
use crate::registry::{BackendServer, ServerKind};
use crate::{Error, Result};

/// Timeout applied to every worker call
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Lists and invokes tools on one backend server
#[async_trait]
pub trait ToolClient: Send + Sync {
    /// Fetch the server's tool catalog (names are not namespaced)
    async fn list_tools(&self, server: &BackendServer) -> Result<Vec<ToolDescriptor>>;

    /// Invoke a tool, returning its content items as-is
    async fn call_tool(
        &self,
        server: &BackendServer,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Content>;
}

fn transport_err(server: &BackendServer, e: impl std::fmt::Display) -> Error {
    Error::Transport(format!("{}: {e}", server.name))
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(CALL_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// Accept either a bare array or an object holding the array under `key`
fn unwrap_array(value: Value, key: &str) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Some(items),
            _ => None,
        },
        _ => None,
    }
}

/// Plain HTTP JSON transport for `direct` servers
#[derive(Debug, Clone)]
pub struct HttpToolClient {
    client: reqwest::Client,
}

impl HttpToolClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: build_client(),
        }
    }
}

impl Default for HttpToolClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolClient for HttpToolClient {
    async fn list_tools(&self, server: &BackendServer) -> Result<Vec<ToolDescriptor>> {
        let url = format!("{}/tools", server.base_url());
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| transport_err(server, e))?;

        let body: Value = resp.json().await.map_err(|e| transport_err(server, e))?;
        let items = unwrap_array(body, "tools")
            .ok_or_else(|| transport_err(server, "tool list is not an array"))?;

        items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| transport_err(server, e)))
            .collect()
    }

    async fn call_tool(
        &self,
        server: &BackendServer,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Content> {
        let mut body = arguments;
        body.insert("name".to_string(), Value::String(name.to_string()));

        let url = format!("{}/tools/call_tool", server.base_url());
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| transport_err(server, e))?;

        let value: Value = resp.json().await.map_err(|e| transport_err(server, e))?;
        unwrap_array(value, "content").ok_or_else(|| transport_err(server, "response has no content"))
    }
}

/// JSON-RPC transport for `pubsub` servers
///
/// Requests are posted to `{url}:{port}/messages`; the reply may come back
/// as JSON or as an event stream.
#[derive(Debug)]
pub struct RpcToolClient {
    client: reqwest::Client,
    next_id: AtomicI64,
}

impl RpcToolClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: build_client(),
            next_id: AtomicI64::new(1),
        }
    }

    async fn request(
        &self,
        server: &BackendServer,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let request = RpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let url = format!("{}/messages", server.base_url());

        let body = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(&request)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| transport_err(server, e))?
            .text()
            .await
            .map_err(|e| transport_err(server, e))?;

        let response = find_response(&body, &request.id)
            .ok_or_else(|| transport_err(server, format!("no response to {method}")))?;

        if let Some(err) = response.error {
            return Err(transport_err(
                server,
                format!("{method} failed ({}): {}", err.code, err.message),
            ));
        }
        response
            .result
            .ok_or_else(|| transport_err(server, format!("{method} returned no result")))
    }
}

impl Default for RpcToolClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolClient for RpcToolClient {
    async fn list_tools(&self, server: &BackendServer) -> Result<Vec<ToolDescriptor>> {
        let result = self.request(server, "tools/list", Some(json!({}))).await?;
        let items = unwrap_array(result, "tools")
            .ok_or_else(|| transport_err(server, "tools/list result has no tools"))?;

        items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| transport_err(server, e)))
            .collect()
    }

    async fn call_tool(
        &self,
        server: &BackendServer,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Content> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request(server, "tools/call", Some(params)).await?;
        unwrap_array(result, "content")
            .ok_or_else(|| transport_err(server, "tools/call result has no content"))
    }
}

/// Transport client per server kind
#[derive(Clone)]
pub struct Transports {
    direct: Arc<dyn ToolClient>,
    pubsub: Arc<dyn ToolClient>,
}

impl std::fmt::Debug for Transports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transports").finish_non_exhaustive()
    }
}

impl Transports {
    #[must_use]
    pub fn new(direct: Arc<dyn ToolClient>, pubsub: Arc<dyn ToolClient>) -> Self {
        Self { direct, pubsub }
    }

    /// Use the same client for every kind
    #[must_use]
    pub fn uniform(client: Arc<dyn ToolClient>) -> Self {
        Self {
            direct: client.clone(),
            pubsub: client,
        }
    }

    /// Client for the server's kind
    #[must_use]
    pub fn for_server(&self, server: &BackendServer) -> &dyn ToolClient {
        match server.kind {
            ServerKind::Direct => self.direct.as_ref(),
            ServerKind::Pubsub => self.pubsub.as_ref(),
        }
    }
}

impl Default for Transports {
    fn default() -> Self {
        Self::new(Arc::new(HttpToolClient::new()), Arc::new(RpcToolClient::new()))
    }
}
