//! Result records keyed by request id
//!
//! Results are append-only JSON lists with a TTL refreshed on every write.
//! [`ResultStore`] is the in-process bridge over a key-value backend;
//! [`HubResultClient`] reaches the same records through a hub.

mod backend;
mod blob;
mod remote;
mod store;

pub use backend::{MemoryBackend, RESULT_TTL, RedisBackend, ResultBackend};
pub use blob::{BlobStorage, HttpBlobStorage, MemoryBlobStorage, object_url};
pub use remote::HubResultClient;
pub use store::{POLL_INTERVAL, ResultBridge, ResultStore};
