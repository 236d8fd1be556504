//! Backend server registry
//!
//! Tracks the worker servers known to the hub, persists them to a JSON
//! snapshot, caches their liveness and hands out dynamic ports.

mod health;
mod ports;
mod store;
mod table;
mod types;

pub use health::{HEALTH_TTL, HealthMonitor, HttpProber, PROBE_TIMEOUT, Prober};
pub use ports::{DEFAULT_PORT_END, DEFAULT_PORT_START, PortAllocator, host_from_url};
pub use store::SnapshotStore;
pub use table::{PERMISSION_SERVER_NAME, ServerRegistry};
pub use types::{BackendServer, HealthRecord, PortRequest, Registration, ServerKind};
