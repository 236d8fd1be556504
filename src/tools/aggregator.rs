//! Tool catalog aggregation across backend servers

use futures::future::join_all;

use super::ToolGateway;
use super::types::ToolDescriptor;
use crate::registry::BackendServer;
use crate::{Error, Result};

impl ToolGateway {
    /// List namespaced tools from one server or from every healthy server
    ///
    /// A backend that fails to answer is marked unhealthy and contributes
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns `ServerNotFound` when a named server is not registered
    pub async fn list_tools(&self, server_name: Option<&str>) -> Result<Vec<ToolDescriptor>> {
        let servers = match server_name {
            Some(name) => vec![
                self.registry
                    .get(name)
                    .await
                    .ok_or_else(|| Error::ServerNotFound(name.to_string()))?,
            ],
            None => self.registry.healthy(&self.health).await,
        };

        let catalogs = join_all(servers.iter().map(|server| self.catalog(server))).await;
        Ok(catalogs.into_iter().flatten().collect())
    }

    /// Namespaced catalog of one server, empty on failure
    async fn catalog(&self, server: &BackendServer) -> Vec<ToolDescriptor> {
        match self.transports.for_server(server).list_tools(server).await {
            Ok(tools) => tools.iter().map(|t| t.namespaced(&server.name)).collect(),
            Err(e) => {
                tracing::warn!(server = %server.name, error = %e, "failed to list tools");
                self.health.mark_unhealthy(&server.name);
                Vec::new()
            }
        }
    }
}
