//! Tool call dispatch with fallback across candidate servers

use serde_json::{Map, Value};

use super::ToolGateway;
use super::types::{Content, split_qualified};
use crate::registry::{BackendServer, PERMISSION_SERVER_NAME};
use crate::{Error, Result};

/// Tool only the permission service may serve
pub const PERMISSION_TOOL: &str = "ask_for_permission";

impl ToolGateway {
    /// Invoke `server.tool` or a bare `tool` on the first server exposing it
    ///
    /// Candidates are tried in registry order. A candidate whose catalog
    /// lacks the tool, or whose call fails in transport, is skipped.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` when the permission tool is addressed to
    /// another server, `ServerNotFound` for an unknown named server and
    /// `ToolNotFound` when no candidate serves the tool
    pub async fn call_tool(&self, qualified: &str, arguments: Map<String, Value>) -> Result<Content> {
        let (server_name, tool) = split_qualified(qualified);
        if tool.is_empty() {
            return Err(Error::Validation("Tool name not provided".to_string()));
        }

        if tool == PERMISSION_TOOL && server_name.is_some_and(|s| s != PERMISSION_SERVER_NAME) {
            return Err(Error::PermissionDenied("unauthorized server".to_string()));
        }

        let candidates = self.candidates(server_name, tool).await?;
        for server in &candidates {
            match self.try_call(server, tool, &arguments).await {
                Ok(Some(content)) => return Ok(content),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(server = %server.name, tool, error = %e, "tool call failed, trying next server");
                }
            }
        }

        Err(Error::ToolNotFound {
            tool: tool.to_string(),
            server: server_name.map(str::to_string),
        })
    }

    async fn candidates(&self, server_name: Option<&str>, tool: &str) -> Result<Vec<BackendServer>> {
        if let Some(name) = server_name {
            return self
                .registry
                .get(name)
                .await
                .map(|s| vec![s])
                .ok_or_else(|| Error::ServerNotFound(name.to_string()));
        }

        if tool == PERMISSION_TOOL {
            return Ok(self
                .registry
                .get(PERMISSION_SERVER_NAME)
                .await
                .into_iter()
                .collect());
        }

        Ok(self.registry.healthy(&self.health).await)
    }

    /// `Ok(None)` when the server does not expose the tool
    async fn try_call(
        &self,
        server: &BackendServer,
        tool: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Option<Content>> {
        let client = self.transports.for_server(server);

        let catalog = client.list_tools(server).await.inspect_err(|_| {
            self.health.mark_unhealthy(&server.name);
        })?;
        if !catalog.iter().any(|t| t.name == tool) {
            return Ok(None);
        }

        let content = client.call_tool(server, tool, arguments.clone()).await?;
        tracing::debug!(server = %server.name, tool, "tool call succeeded");
        Ok(Some(content))
    }
}
