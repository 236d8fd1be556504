//! TOML configuration file loading
//!
//! Supports `~/.config/scp-hub/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HubConfigFile {
    /// HTTP API listener
    #[serde(default)]
    pub api: ApiFileConfig,

    /// Server registry and permission service
    #[serde(default)]
    pub registry: RegistryFileConfig,

    /// Result store
    #[serde(default)]
    pub results: ResultsFileConfig,

    /// Blob storage for uploaded result files
    #[serde(default)]
    pub blob: BlobFileConfig,

    /// Command queue broker
    #[serde(default)]
    pub amqp: AmqpFileConfig,

    /// Telemetry broker
    #[serde(default)]
    pub mqtt: MqttFileConfig,

    /// Hub base URL used by workers to reach the result endpoints
    pub hub_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegistryFileConfig {
    /// JSON snapshot of registered servers
    pub snapshot_path: Option<String>,
    pub permission_url: Option<String>,
    pub permission_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultsFileConfig {
    /// `redis://` URL; results stay in memory when unset
    pub redis_url: Option<String>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlobFileConfig {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AmqpFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub virtual_host: Option<String>,
    pub queue: Option<String>,
    pub prefetch: Option<u16>,
    pub retry_interval_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MqttFileConfig {
    pub instance_id: Option<String>,
    pub endpoint: Option<String>,
    pub port: Option<u16>,
    pub group_id: Option<String>,
    pub device_id: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub control_topic: Option<String>,
    pub status_topic: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `HubConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HubConfigFile {
    config_file_path().map_or_else(HubConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Returns `HubConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> HubConfigFile {
    if !path.exists() {
        return HubConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HubConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HubConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/scp-hub/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("scp-hub").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_file_leaves_other_sections_default() {
        let parsed: HubConfigFile = toml::from_str(
            r#"
            hub_url = "http://hub:8000"

            [amqp]
            host = "mq.internal"
            queue = "lab_commands"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.hub_url.as_deref(), Some("http://hub:8000"));
        assert_eq!(parsed.amqp.host.as_deref(), Some("mq.internal"));
        assert!(parsed.amqp.port.is_none());
        assert!(parsed.mqtt.instance_id.is_none());
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();
        let loaded = load_config_file_from(file.path());
        assert!(loaded.hub_url.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let loaded = load_config_file_from(Path::new("/nonexistent/scp-hub.toml"));
        assert!(loaded.api.port.is_none());
    }
}
