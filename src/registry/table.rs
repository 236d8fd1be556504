//! In-memory server table with snapshot persistence

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::RwLock;

use super::health::HealthMonitor;
use super::ports::{PortAllocator, host_from_url};
use super::store::SnapshotStore;
use super::types::{BackendServer, PortRequest, Registration};
use crate::{Error, Result};

/// Name reserved for the permission service
pub const PERMISSION_SERVER_NAME: &str = "PermissionServer";

/// Registry of backend servers
///
/// Iteration order is insertion order, so fallback dispatch visits servers
/// in the order they registered.
#[derive(Debug)]
pub struct ServerRegistry {
    servers: RwLock<IndexMap<String, BackendServer>>,
    snapshot: Option<SnapshotStore>,
    ports: Arc<PortAllocator>,
}

impl ServerRegistry {
    /// Create a registry persisted to the given snapshot
    #[must_use]
    pub fn new(snapshot: Option<SnapshotStore>) -> Self {
        Self {
            servers: RwLock::new(IndexMap::new()),
            snapshot,
            ports: Arc::new(PortAllocator::new()),
        }
    }

    /// Create a registry without persistence
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Register a backend server and save the snapshot
    ///
    /// # Errors
    ///
    /// Returns `NameReserved` for the permission-service name, a validation
    /// error for missing fields, `PortExhaustion` when auto allocation fails,
    /// or an IO error if the snapshot cannot be written
    pub async fn register(&self, registration: Registration) -> Result<BackendServer> {
        if registration.name == PERMISSION_SERVER_NAME {
            return Err(Error::NameReserved(registration.name));
        }
        registration.validate()?;
        self.insert(registration).await
    }

    /// Register the permission service, bypassing the reserved-name check
    ///
    /// # Errors
    ///
    /// Same as [`Self::register`] apart from `NameReserved`
    pub async fn insert_reserved(&self, mut registration: Registration) -> Result<BackendServer> {
        PERMISSION_SERVER_NAME.clone_into(&mut registration.name);
        registration.validate()?;
        self.insert(registration).await
    }

    async fn insert(&self, registration: Registration) -> Result<BackendServer> {
        let port = match registration.port {
            PortRequest::Fixed(port) => port,
            PortRequest::Auto => {
                let ports = self.ports.clone();
                let host = host_from_url(&registration.url);
                tokio::task::spawn_blocking(move || ports.allocate(&host))
                    .await
                    .map_err(|e| Error::Config(format!("port allocation task failed: {e}")))??
            }
        };

        let server = BackendServer {
            name: registration.name,
            url: registration.url,
            port,
            description: registration.description,
            kind: registration.kind,
        };

        // the table only changes once the snapshot holding the entry is saved
        let mut servers = self.servers.write().await;
        let mut next = servers.clone();
        next.insert(server.name.clone(), server.clone());
        if let Some(snapshot) = &self.snapshot {
            snapshot.write(&next)?;
        }
        *servers = next;
        drop(servers);

        tracing::info!(
            server = %server.name,
            url = %server.base_url(),
            kind = %server.kind,
            "registered server"
        );
        Ok(server)
    }

    /// Load the snapshot into memory, keeping only healthy servers
    ///
    /// Entries that fail their health probe are left out of the table but
    /// stay in the snapshot until the next save. Returns the loaded servers.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read
    pub async fn load(&self, health: &HealthMonitor) -> Result<Vec<BackendServer>> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(Vec::new());
        };

        let stored = snapshot.read()?;
        let mut loaded = Vec::new();
        for (name, server) in stored {
            if name == PERMISSION_SERVER_NAME {
                continue;
            }
            if health.is_healthy(&server).await {
                loaded.push(server);
            } else {
                tracing::warn!(server = %name, "dropping unhealthy server from snapshot load");
            }
        }

        let mut servers = self.servers.write().await;
        for server in &loaded {
            servers.insert(server.name.clone(), server.clone());
        }
        drop(servers);

        tracing::info!(count = loaded.len(), "loaded servers from snapshot");
        Ok(loaded)
    }

    /// Get a server by name
    pub async fn get(&self, name: &str) -> Option<BackendServer> {
        self.servers.read().await.get(name).cloned()
    }

    /// Whether a server with this name is registered
    pub async fn contains(&self, name: &str) -> bool {
        self.servers.read().await.contains_key(name)
    }

    /// All registered servers in registration order
    pub async fn list(&self) -> Vec<BackendServer> {
        self.servers.read().await.values().cloned().collect()
    }

    /// All registered servers that pass a health check
    pub async fn healthy(&self, health: &HealthMonitor) -> Vec<BackendServer> {
        let mut healthy = Vec::new();
        for server in self.list().await {
            if health.is_healthy(&server).await {
                healthy.push(server);
            }
        }
        healthy
    }

    /// Number of registered servers
    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }

    /// Drop every server from memory without touching the snapshot
    pub async fn clear(&self) {
        self.servers.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;

    use super::*;
    use crate::registry::{Prober, ServerKind};

    struct ByName;

    #[async_trait]
    impl Prober for ByName {
        async fn probe(&self, server: &BackendServer) -> bool {
            !server.name.starts_with("dead")
        }
    }

    fn registration(name: &str, port: PortRequest) -> Registration {
        Registration {
            name: name.to_string(),
            url: "http://127.0.0.1".to_string(),
            description: format!("{name} worker"),
            port,
            kind: ServerKind::Direct,
        }
    }

    #[tokio::test]
    async fn reserved_name_is_rejected() {
        let registry = ServerRegistry::in_memory();
        let err = registry
            .register(registration(PERMISSION_SERVER_NAME, PortRequest::Fixed(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameReserved(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn reserved_insert_bypasses_check() {
        let registry = ServerRegistry::in_memory();
        let server = registry
            .insert_reserved(registration("anything", PortRequest::Fixed(7000)))
            .await
            .unwrap();
        assert_eq!(server.name, PERMISSION_SERVER_NAME);
        assert!(registry.contains(PERMISSION_SERVER_NAME).await);
    }

    #[tokio::test]
    async fn auto_port_is_allocated() {
        let registry = ServerRegistry::in_memory();
        let server = registry
            .register(registration("lab", PortRequest::Auto))
            .await
            .unwrap();
        assert!(server.port >= 5000);
    }

    #[tokio::test]
    async fn reregistration_replaces_entry_in_place() {
        let registry = ServerRegistry::in_memory();
        registry
            .register(registration("a", PortRequest::Fixed(1)))
            .await
            .unwrap();
        registry
            .register(registration("b", PortRequest::Fixed(2)))
            .await
            .unwrap();
        registry
            .register(registration("a", PortRequest::Fixed(3)))
            .await
            .unwrap();

        let servers = registry.list().await;
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "a");
        assert_eq!(servers[0].port, 3);
    }

    #[tokio::test]
    async fn load_drops_unhealthy_but_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let writer = ServerRegistry::new(Some(SnapshotStore::new(&path)));
        for name in ["alive", "dead_one"] {
            writer
                .register(registration(name, PortRequest::Fixed(6000)))
                .await
                .unwrap();
        }

        let health = HealthMonitor::new(Arc::new(ByName));
        let reader = ServerRegistry::new(Some(SnapshotStore::new(&path)));
        let loaded = reader.load(&health).await.unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "alive");
        assert!(reader.get("dead_one").await.is_none());
        assert_eq!(SnapshotStore::new(&path).read().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_snapshot_write_leaves_table_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let registry = ServerRegistry::new(Some(SnapshotStore::new(blocker.join("servers.json"))));
        let result = registry
            .register(registration("lab", PortRequest::Fixed(6000)))
            .await;

        assert!(result.is_err());
        assert!(!registry.contains("lab").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_auto_registrations_get_distinct_ports() {
        let registry = Arc::new(ServerRegistry::in_memory());
        let tasks: Vec<_> = (0..16)
            .map(|n| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .register(registration(&format!("lab{n}"), PortRequest::Auto))
                        .await
                        .map(|server| server.port)
                })
            })
            .collect();

        let mut ports = HashSet::new();
        for task in tasks {
            let port = task.await.unwrap().unwrap();
            assert!(ports.insert(port), "port {port} handed out twice");
        }
        assert_eq!(registry.len().await, 16);
    }
}
