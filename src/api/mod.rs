//! HTTP API server for the hub

mod error;
pub mod health;
pub mod results;
pub mod servers;
pub mod telemetry;
pub mod tools;
pub mod worker;

pub use error::ErrorResponse;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::hub::Hub;

/// Default listen address
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8000;

/// Configuration for building an API server
pub struct ApiServerBuilder {
    hub: Arc<Hub>,
    host: String,
    port: u16,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }

    /// Set the listen host
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the listen port
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        ApiServer {
            hub: self.hub,
            host: self.host,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    hub: Arc<Hub>,
    host: String,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .merge(servers::router(self.hub.clone()))
            .merge(tools::router(self.hub.clone()))
            .merge(results::router(self.hub.clone()))
            .merge(telemetry::router(self.hub.clone()))
            .merge(health::router());
        with_layers(router)
    }

    /// Run the API server until `shutdown` is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(addr = %addr, "API server listening");
        serve(listener, self.router(), shutdown).await
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

/// CORS and request tracing shared by the hub and worker routers
pub fn with_layers(router: Router) -> Router {
    // CORS layer for cross-origin requests from browser clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(cors).layer(TraceLayer::new_for_http())
}

/// Serve `router` on an already bound listener until `shutdown` is cancelled
///
/// # Errors
///
/// Returns error if the server stops abnormally
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;
    Ok(())
}
