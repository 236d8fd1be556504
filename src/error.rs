//! Error types for the SCP hub

use thiserror::Error;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the hub, the command engine and the telemetry bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or invalid input fields
    #[error("invalid input: {0}")]
    Validation(String),

    /// Attempt to register under the reserved permission-service name
    #[error("reserved server name: {0}")]
    NameReserved(String),

    /// Caller is not allowed to invoke the requested tool
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Backend server not registered
    #[error("server '{0}' not found")]
    ServerNotFound(String),

    /// No candidate server exposes the tool
    #[error("{}", tool_not_found_message(.tool, .server.as_deref()))]
    ToolNotFound {
        tool: String,
        server: Option<String>,
    },

    /// Generic missing resource (stored results)
    #[error("not found: {0}")]
    NotFound(String),

    /// No local port in the requested range could be bound
    #[error("no available port in range {start}-{end}")]
    PortExhaustion { start: u16, end: u16 },

    /// Broker connection could not be established or was lost
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Broker channel-level failure
    #[error("broker channel error: {0}")]
    Channel(String),

    /// Undecodable command envelope
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Action handler failed; the command should be redelivered
    #[error("handler error: {0}")]
    Handler(String),

    /// Result store or blob storage failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Worker transport failure (network or protocol)
    #[error("transport error: {0}")]
    Transport(String),

    /// Pub/sub client failure
    #[error("pubsub error: {0}")]
    PubSub(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn tool_not_found_message(tool: &str, server: Option<&str>) -> String {
    server.map_or_else(
        || format!("Tool '{tool}' not found"),
        |server| format!("Tool '{tool}' not found on server '{server}'"),
    )
}

impl Error {
    /// Whether a broker consumer should reconnect after this error
    #[must_use]
    pub const fn is_reconnectable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_) | Self::Channel(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<lapin::Error> for Error {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::ProtocolError(_) => Self::Channel(e.to_string()),
            _ => Self::BrokerUnavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_not_found_is_scoped_to_server() {
        let bare = Error::ToolNotFound {
            tool: "T".to_string(),
            server: None,
        };
        assert_eq!(bare.to_string(), "Tool 'T' not found");

        let scoped = Error::ToolNotFound {
            tool: "T".to_string(),
            server: Some("lab".to_string()),
        };
        assert_eq!(scoped.to_string(), "Tool 'T' not found on server 'lab'");
    }

    #[test]
    fn only_broker_errors_reconnect() {
        assert!(Error::BrokerUnavailable("down".into()).is_reconnectable());
        assert!(Error::Channel("closed".into()).is_reconnectable());
        assert!(!Error::Handler("boom".into()).is_reconnectable());
        assert!(!Error::Storage("full".into()).is_reconnectable());
    }
}
