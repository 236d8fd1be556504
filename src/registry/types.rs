//! Backend server registry types

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Transport used to reach a backend server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// Plain HTTP worker, health-probed
    #[default]
    #[serde(alias = "scp")]
    Direct,
    /// Event-stream worker, assumed healthy
    #[serde(alias = "sse")]
    Pubsub,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Pubsub => write!(f, "pubsub"),
        }
    }
}

/// A registered backend server exposing a catalog of tools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendServer {
    pub name: String,
    pub url: String,
    pub port: u16,
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: ServerKind,
}

impl BackendServer {
    /// Base URL including the port, e.g. `http://10.0.0.5:6100`
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}:{}", self.url.trim_end_matches('/'), self.port)
    }
}

/// Port requested at registration time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRequest {
    /// Pick a free local port
    Auto,
    /// Use the given port as-is
    Fixed(u16),
}

impl PortRequest {
    /// Interpret the wire value, where `-1` or an absent port means auto
    ///
    /// # Errors
    ///
    /// Returns a validation error for values outside `-1..=65535`
    pub fn from_wire(port: Option<i64>) -> Result<Self> {
        match port {
            None | Some(-1) => Ok(Self::Auto),
            Some(p) => u16::try_from(p)
                .map(Self::Fixed)
                .map_err(|_| Error::Validation(format!("invalid server_port: {p}"))),
        }
    }
}

/// Input for registering a backend server
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub url: String,
    pub description: String,
    pub port: PortRequest,
    pub kind: ServerKind,
}

impl Registration {
    /// Check required fields
    ///
    /// # Errors
    ///
    /// Returns a validation error when a required field is empty or the name
    /// cannot be used as a tool namespace
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("server_name", &self.name),
            ("server_url", &self.url),
            ("server_description", &self.description),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect();

        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        if self.name.contains('.') {
            return Err(Error::Validation(format!(
                "server name '{}' must not contain '.'",
                self.name
            )));
        }

        Ok(())
    }
}

/// Cached liveness of one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    pub server_name: String,
    pub last_checked_at: chrono::DateTime<chrono::Utc>,
    pub is_healthy: bool,
}
