//! Pub/sub telemetry bridge
//!
//! Listens on the device status topic, writes every status payload into the
//! result store and fires per-request callbacks on a dedicated worker.

mod bridge;
mod callbacks;
mod confirm;
mod credentials;

pub use bridge::{
    MqttControlSink, MqttLink, MqttSettings, PUBLISH_TIMEOUT, STALE_AFTER, STATUS_HISTORY,
    SWEEP_INTERVAL, StatusUpdate, TelemetryBridge,
};
pub use callbacks::{CallbackHandler, CallbackWorker, DEFAULT_QUEUE_CAPACITY, callback};
pub use confirm::PublishConfirmations;
pub use credentials::{MqttCredentials, client_id, signature};
