//! Cached liveness checks for backend servers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mini_moka::sync::Cache;

use super::types::{BackendServer, HealthRecord, ServerKind};

/// How long a probe result is reused
pub const HEALTH_TTL: Duration = Duration::from_secs(30);

/// Probe timeout for direct servers
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness probe for one server
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe the server, returning `true` when it answered healthy
    async fn probe(&self, server: &BackendServer) -> bool;
}

/// Probes `GET {url}:{port}/health` over HTTP
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    /// Create a prober with the default timeout
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, server: &BackendServer) -> bool {
        let url = format!("{}/health", server.base_url());
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(server = %server.name, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Time-bounded health cache wrapping a [`Prober`]
pub struct HealthMonitor {
    prober: Arc<dyn Prober>,
    cache: Cache<String, HealthRecord>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor with the standard 30 s TTL
    #[must_use]
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self::with_ttl(prober, HEALTH_TTL)
    }

    /// Create a monitor with a custom TTL
    #[must_use]
    pub fn with_ttl(prober: Arc<dyn Prober>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(4096)
            .time_to_live(ttl)
            .build();
        Self { prober, cache }
    }

    /// Whether the server is currently considered healthy
    ///
    /// Pubsub servers are always healthy. Direct servers reuse a cached
    /// record while it is fresh and are probed otherwise.
    pub async fn is_healthy(&self, server: &BackendServer) -> bool {
        if server.kind == ServerKind::Pubsub {
            return true;
        }

        if let Some(record) = self.cache.get(&server.name) {
            return record.is_healthy;
        }

        let healthy = self.prober.probe(server).await;
        self.record(&server.name, healthy);
        if !healthy {
            tracing::warn!(server = %server.name, url = %server.base_url(), "server unhealthy");
        }
        healthy
    }

    /// Store a health result for the server
    pub fn record(&self, server_name: &str, is_healthy: bool) {
        self.cache.insert(
            server_name.to_string(),
            HealthRecord {
                server_name: server_name.to_string(),
                last_checked_at: chrono::Utc::now(),
                is_healthy,
            },
        );
    }

    /// Mark a server unhealthy after a failed call
    pub fn mark_unhealthy(&self, server_name: &str) {
        self.record(server_name, false);
    }

    /// Drop any cached record so the next check probes again
    pub fn forget(&self, server_name: &str) {
        self.cache.invalidate(&server_name.to_string());
    }

    /// Cached record for the server, if fresh
    #[must_use]
    pub fn cached(&self, server_name: &str) -> Option<HealthRecord> {
        self.cache.get(&server_name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    struct Toggle {
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Prober for Toggle {
        async fn probe(&self, _server: &BackendServer) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn server(kind: ServerKind) -> BackendServer {
        BackendServer {
            name: "lab".to_string(),
            url: "http://127.0.0.1".to_string(),
            port: 1,
            description: "lab".to_string(),
            kind,
        }
    }

    fn toggle(healthy: bool) -> Arc<Toggle> {
        Arc::new(Toggle {
            healthy: AtomicBool::new(healthy),
            probes: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn cached_result_is_reused_within_ttl() {
        let prober = toggle(true);
        let monitor = HealthMonitor::new(prober.clone());
        let server = server(ServerKind::Direct);

        assert!(monitor.is_healthy(&server).await);
        prober.healthy.store(false, Ordering::SeqCst);
        assert!(monitor.is_healthy(&server).await);
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_record_is_probed_again() {
        let prober = toggle(true);
        let monitor = HealthMonitor::with_ttl(prober.clone(), Duration::from_millis(20));
        let server = server(ServerKind::Direct);

        assert!(monitor.is_healthy(&server).await);
        prober.healthy.store(false, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!monitor.is_healthy(&server).await);
        assert_eq!(prober.probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pubsub_servers_are_never_probed() {
        let prober = toggle(false);
        let monitor = HealthMonitor::new(prober.clone());
        assert!(monitor.is_healthy(&server(ServerKind::Pubsub)).await);
        assert_eq!(prober.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mark_unhealthy_overrides_cache() {
        let prober = toggle(true);
        let monitor = HealthMonitor::new(prober.clone());
        let server = server(ServerKind::Direct);

        assert!(monitor.is_healthy(&server).await);
        monitor.mark_unhealthy("lab");
        assert!(!monitor.is_healthy(&server).await);

        monitor.forget("lab");
        assert!(monitor.cached("lab").is_none());
        assert!(monitor.is_healthy(&server).await);
    }

    #[tokio::test]
    async fn http_probe_of_closed_port_is_unhealthy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let server = BackendServer {
            port,
            ..server(ServerKind::Direct)
        };
        assert!(!HttpProber::new().probe(&server).await);
    }
}
