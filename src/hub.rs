//! The hub: registry, health cache, tool gateway and result store in one place

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::registry::{
    BackendServer, HealthMonitor, HttpProber, Prober, Registration, ServerRegistry, SnapshotStore,
};
use crate::results::{MemoryBackend, ResultBridge, ResultStore};
use crate::telemetry::TelemetryBridge;
use crate::tools::{Content, ToolDescriptor, ToolGateway, Transports};
use crate::{Error, Result};

/// Shared hub state, constructed once and handed out by `Arc`
pub struct Hub {
    registry: Arc<ServerRegistry>,
    health: Arc<HealthMonitor>,
    tools: ToolGateway,
    results: Arc<dyn ResultBridge>,
    telemetry: Option<Arc<TelemetryBridge>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.registry)
            .field("telemetry", &self.telemetry.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Hub`]
#[derive(Default)]
pub struct HubBuilder {
    snapshot: Option<SnapshotStore>,
    prober: Option<Arc<dyn Prober>>,
    transports: Option<Transports>,
    results: Option<Arc<dyn ResultBridge>>,
    telemetry: Option<Arc<TelemetryBridge>>,
}

impl HubBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist the registry to this snapshot file
    #[must_use]
    pub fn snapshot(mut self, snapshot: SnapshotStore) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = Some(prober);
        self
    }

    #[must_use]
    pub fn transports(mut self, transports: Transports) -> Self {
        self.transports = Some(transports);
        self
    }

    #[must_use]
    pub fn results(mut self, results: Arc<dyn ResultBridge>) -> Self {
        self.results = Some(results);
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: Arc<TelemetryBridge>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build the hub; unset parts fall back to HTTP probing, the default
    /// transports and an in-memory result store
    #[must_use]
    pub fn build(self) -> Hub {
        let registry = Arc::new(ServerRegistry::new(self.snapshot));
        let prober = self.prober.unwrap_or_else(|| Arc::new(HttpProber::new()));
        let health = Arc::new(HealthMonitor::new(prober));
        let tools = ToolGateway::new(
            registry.clone(),
            health.clone(),
            self.transports.unwrap_or_default(),
        );
        let results = self
            .results
            .unwrap_or_else(|| Arc::new(ResultStore::new(Arc::new(MemoryBackend::new()))));

        Hub {
            registry,
            health,
            tools,
            results,
            telemetry: self.telemetry,
            shutdown: CancellationToken::new(),
        }
    }
}

impl Hub {
    #[must_use]
    pub fn builder() -> HubBuilder {
        HubBuilder::new()
    }

    /// Install the permission service and load the persisted registry
    ///
    /// The permission entry bypasses the reserved-name check. Snapshot
    /// entries are loaded afterwards; unhealthy ones are dropped from the
    /// live table.
    ///
    /// # Errors
    ///
    /// Returns an error if the permission entry is invalid or the snapshot
    /// cannot be read
    pub async fn bootstrap(&self, permission: Option<Registration>) -> Result<Vec<BackendServer>> {
        if let Some(permission) = permission {
            let server = self.registry.insert_reserved(permission).await?;
            tracing::info!(url = %server.base_url(), "permission service registered");
        }
        self.registry.load(&self.health).await
    }

    /// Register or replace a backend server
    ///
    /// # Errors
    ///
    /// See [`ServerRegistry::register`]
    pub async fn register(&self, registration: Registration) -> Result<BackendServer> {
        let server = self.registry.register(registration).await?;
        self.health.forget(&server.name);
        Ok(server)
    }

    /// Registered servers that currently pass their health check
    pub async fn healthy_servers(&self) -> Vec<BackendServer> {
        self.registry.healthy(&self.health).await
    }

    /// See [`ToolGateway::list_tools`]
    ///
    /// # Errors
    ///
    /// Returns `ServerNotFound` for an unknown server name
    pub async fn list_tools(&self, server_name: Option<&str>) -> Result<Vec<ToolDescriptor>> {
        self.tools.list_tools(server_name).await
    }

    /// See [`ToolGateway::call_tool`]
    ///
    /// # Errors
    ///
    /// Returns a validation, permission or not-found error
    pub async fn call_tool(&self, name: &str, arguments: Map<String, Value>) -> Result<Content> {
        self.tools.call_tool(name, arguments).await
    }

    /// Append a worker-reported payload under its `requestId`
    ///
    /// Inline files are uploaded to blob storage and replaced by their URLs.
    ///
    /// # Errors
    ///
    /// Returns a validation error without a `requestId`, or a storage error
    pub async fn set_result(&self, payload: Value) -> Result<String> {
        let request_id = payload
            .get("requestId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::Validation("Missing requestId".to_string()))?;

        self.results.put(&request_id, payload).await?;
        tracing::debug!(request_id = %request_id, "result stored");
        Ok(request_id)
    }

    /// Stored results for `request_id`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if nothing is stored for the id
    pub async fn get_result(&self, request_id: &str) -> Result<Value> {
        self.results
            .get(request_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no result for request {request_id}")))
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    #[must_use]
    pub fn results(&self) -> &Arc<dyn ResultBridge> {
        &self.results
    }

    #[must_use]
    pub fn telemetry(&self) -> Option<&Arc<TelemetryBridge>> {
        self.telemetry.as_ref()
    }

    /// Token cancelled by [`Hub::shutdown`]
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop background loops and the callback worker
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(telemetry) = &self.telemetry {
            telemetry.shutdown();
        }
        tracing::info!("hub shut down");
    }
}
