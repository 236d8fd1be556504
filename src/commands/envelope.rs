//! Command envelope and queue parameters

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Maximum number of queued commands before the oldest are dropped
pub const QUEUE_MAX_LENGTH: i32 = 10_000;

/// Per-message time to live in the queue, in milliseconds
pub const QUEUE_MESSAGE_TTL_MS: i32 = 3_600_000;

/// A device command travelling through the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub request_id: String,
    pub device_name: String,
    pub device_action: String,
    #[serde(default)]
    pub device_params: Map<String, Value>,
    /// Unix time in seconds when the command was created
    #[serde(default)]
    pub timestamp: f64,
}

impl CommandEnvelope {
    /// Build an envelope with a fresh random request id
    ///
    /// # Errors
    ///
    /// Returns a validation error when the device or action is empty
    pub fn new(
        device_name: impl Into<String>,
        device_action: impl Into<String>,
        device_params: Map<String, Value>,
    ) -> Result<Self> {
        let device_name = device_name.into();
        let device_action = device_action.into();
        if device_name.trim().is_empty() || device_action.trim().is_empty() {
            return Err(Error::Validation(
                "device_name and device_action are required".to_string(),
            ));
        }

        #[allow(clippy::cast_precision_loss)]
        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

        Ok(Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            device_name,
            device_action,
            device_params,
            timestamp,
        })
    }

    /// Decode a delivery body
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` for invalid JSON or an empty device or
    /// action
    pub fn decode(body: &[u8]) -> Result<Self> {
        let envelope: Self =
            serde_json::from_slice(body).map_err(|e| Error::MalformedMessage(e.to_string()))?;
        if envelope.device_name.is_empty() || envelope.device_action.is_empty() {
            return Err(Error::MalformedMessage(format!(
                "request {} is missing device_name or device_action",
                envelope.request_id
            )));
        }
        Ok(envelope)
    }

    /// Encode for publishing
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the params cannot be encoded
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Durable queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub max_length: i32,
    pub message_ttl_ms: i32,
}

impl QueueSpec {
    /// Standard durable command queue
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_length: QUEUE_MAX_LENGTH,
            message_ttl_ms: QUEUE_MESSAGE_TTL_MS,
        }
    }
}
