//! Configuration management for the SCP hub

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::commands::AmqpSettings;
use crate::registry::{PERMISSION_SERVER_NAME, PortRequest, Registration, ServerKind};
use crate::results::RESULT_TTL;
use crate::telemetry::MqttSettings;
use crate::{Error, Result};

use file::HubConfigFile;

/// Default queue carrying device commands
pub const DEFAULT_QUEUE: &str = "scp_commands";

/// Default hub URL for workers
pub const DEFAULT_HUB_URL: &str = "http://127.0.0.1:8000";

/// Hub configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// Server registry configuration
    pub registry: RegistryConfig,

    /// Result store configuration
    pub results: ResultsConfig,

    /// Blob storage, when uploads are enabled
    pub blob: Option<BlobConfig>,

    /// Command queue configuration
    pub amqp: AmqpConfig,

    /// Telemetry bridge, when all required MQTT settings are present
    pub mqtt: Option<MqttSettings>,

    /// Hub base URL used by workers
    pub hub_url: String,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Where registered servers are persisted
    pub snapshot_path: PathBuf,
    /// Permission service registered at startup
    pub permission: Option<PermissionConfig>,
}

#[derive(Debug, Clone)]
pub struct PermissionConfig {
    pub url: String,
    /// `None` allocates a port
    pub port: Option<u16>,
}

impl PermissionConfig {
    /// Registry entry for the permission service
    #[must_use]
    pub fn registration(&self) -> Registration {
        Registration {
            name: PERMISSION_SERVER_NAME.to_string(),
            url: self.url.clone(),
            description: "Permission checks for privileged tools".to_string(),
            port: self.port.map_or(PortRequest::Auto, PortRequest::Fixed),
            kind: ServerKind::Direct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultsConfig {
    /// Redis URL; in-memory store when `None`
    pub redis_url: Option<String>,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub token: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub settings: AmqpSettings,
    pub queue: String,
    pub prefetch: u16,
    pub retry_interval: Duration,
    /// Consecutive failed connections tolerated; 0 retries forever
    pub max_retries: u32,
}

fn parsed<T: std::str::FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    env(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Config(format!("invalid value for {key}: {raw}")))
        })
        .transpose()
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an unparsable value
    pub fn load() -> Result<Self> {
        Self::from_sources(&|key| std::env::var(key).ok(), file::load_config_file())
    }

    /// Load configuration with an explicit TOML file
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an unparsable value
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::from_sources(
            &|key| std::env::var(key).ok(),
            file::load_config_file_from(path),
        )
    }

    /// Merge environment lookups over a parsed config file
    ///
    /// # Errors
    ///
    /// Returns error if an environment variable holds an unparsable value
    pub fn from_sources(env: &dyn Fn(&str) -> Option<String>, fc: HubConfigFile) -> Result<Self> {
        let env = &|key: &str| env(key).filter(|v| !v.is_empty());

        // API server config (env > toml > default)
        let api_server = ApiServerConfig {
            host: env("SCP_API_HOST")
                .or(fc.api.host)
                .unwrap_or_else(|| crate::api::DEFAULT_HOST.to_string()),
            port: parsed(env, "SCP_API_PORT")?
                .or(parsed(env, "PORT")?)
                .or(fc.api.port)
                .unwrap_or(crate::api::DEFAULT_PORT),
        };

        let permission = env("PERMISSION_SERVER_URL")
            .or(fc.registry.permission_url)
            .map(|url| -> Result<PermissionConfig> {
                Ok(PermissionConfig {
                    url,
                    port: parsed(env, "PERMISSION_SERVER_PORT")?.or(fc.registry.permission_port),
                })
            })
            .transpose()?;

        let registry = RegistryConfig {
            snapshot_path: env("STORAGE_FILE_PATH")
                .or(fc.registry.snapshot_path)
                .map_or_else(|| PathBuf::from("servers.json"), PathBuf::from),
            permission,
        };

        let results = ResultsConfig {
            redis_url: env("REDIS_URL")
                .or_else(|| redis_url_from_parts(env))
                .or(fc.results.redis_url),
            ttl: parsed::<u64>(env, "RESULT_TTL_SECS")?
                .or(fc.results.ttl_secs)
                .map_or(RESULT_TTL, Duration::from_secs),
        };

        let blob = match (
            env("OSS_BUCKET_NAME").or(fc.blob.bucket),
            env("OSS_ENDPOINT").or(fc.blob.endpoint),
        ) {
            (Some(bucket), Some(endpoint)) => Some(BlobConfig {
                endpoint,
                bucket,
                prefix: env("OSS_PREFIX")
                    .or(fc.blob.prefix)
                    .unwrap_or_else(|| "results".to_string()),
                token: env("OSS_TOKEN").or(fc.blob.token).map(SecretString::from),
            }),
            _ => None,
        };

        let amqp = AmqpConfig {
            settings: AmqpSettings {
                host: env("AMQP_HOST")
                    .or(fc.amqp.host)
                    .unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parsed(env, "AMQP_PORT")?.or(fc.amqp.port).unwrap_or(5672),
                username: env("AMQP_USERNAME")
                    .or(fc.amqp.username)
                    .unwrap_or_else(|| "guest".to_string()),
                password: SecretString::from(
                    env("AMQP_PASSWORD")
                        .or(fc.amqp.password)
                        .unwrap_or_else(|| "guest".to_string()),
                ),
                virtual_host: env("AMQP_VHOST")
                    .or(fc.amqp.virtual_host)
                    .unwrap_or_else(|| "/".to_string()),
            },
            queue: env("AMQP_QUEUE")
                .or(fc.amqp.queue)
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            prefetch: parsed(env, "AMQP_PREFETCH")?.or(fc.amqp.prefetch).unwrap_or(1),
            retry_interval: parsed::<u64>(env, "AMQP_RETRY_INTERVAL_SECS")?
                .or(fc.amqp.retry_interval_secs)
                .map_or(Duration::from_secs(5), Duration::from_secs),
            max_retries: parsed(env, "AMQP_MAX_RETRIES")?
                .or(fc.amqp.max_retries)
                .unwrap_or(0),
        };

        let mqtt = mqtt_settings(env, fc.mqtt)?;

        Ok(Self {
            api_server,
            registry,
            results,
            blob,
            amqp,
            mqtt,
            hub_url: env("SCP_HUB_URL")
                .or(fc.hub_url)
                .unwrap_or_else(|| DEFAULT_HUB_URL.to_string()),
        })
    }
}

/// `REDIS_HOST` and friends, as a `redis://` URL
fn redis_url_from_parts(env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    let host = env("REDIS_HOST")?;
    let port = env("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
    let db = env("REDIS_DB").unwrap_or_else(|| "0".to_string());
    let auth = match (env("REDIS_USERNAME"), env("REDIS_PASSWORD")) {
        (Some(user), Some(password)) => format!("{user}:{password}@"),
        (None, Some(password)) => format!(":{password}@"),
        _ => String::new(),
    };
    Some(format!("redis://{auth}{host}:{port}/{db}"))
}

/// Telemetry settings; `None` unless instance, endpoint, group, device and
/// both keys are all set
fn mqtt_settings(
    env: &dyn Fn(&str) -> Option<String>,
    fc: file::MqttFileConfig,
) -> Result<Option<MqttSettings>> {
    let port = parsed(env, "MQTT_PORT")?.or(fc.port).unwrap_or(1883);
    let control_topic = env("MQTT_DEVICE_CONTROL_TOPIC")
        .or(fc.control_topic)
        .unwrap_or_else(|| "device_control".to_string());
    let status_topic = env("MQTT_DEVICE_STATUS_TOPIC")
        .or(fc.status_topic)
        .unwrap_or_else(|| "device_status".to_string());

    let (
        Some(instance_id),
        Some(host),
        Some(group_id),
        Some(device_id),
        Some(access_key),
        Some(secret_key),
    ) = (
        env("MQTT_INSTANCE_ID").or(fc.instance_id),
        env("MQTT_ENDPOINT").or(fc.endpoint),
        env("MQTT_GROUP_ID").or(fc.group_id),
        env("MQTT_DEVICE_ID").or(fc.device_id),
        env("MQTT_AK").or(fc.access_key),
        env("MQTT_SK").or(fc.secret_key),
    )
    else {
        return Ok(None);
    };

    Ok(Some(MqttSettings {
        host,
        port,
        instance_id,
        group_id,
        device_id,
        access_key,
        secret_key: SecretString::from(secret_key),
        control_topic,
        status_topic,
        keep_alive: Duration::from_secs(120),
        reconnect_delay: Duration::from_secs(5),
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn load(vars: &[(&str, &str)], fc: HubConfigFile) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_sources(&|key| vars.get(key).cloned(), fc)
    }

    #[test]
    fn defaults_without_any_source() {
        let config = load(&[], HubConfigFile::default()).unwrap();
        assert_eq!(config.api_server.port, 8000);
        assert_eq!(config.registry.snapshot_path, PathBuf::from("servers.json"));
        assert!(config.registry.permission.is_none());
        assert!(config.results.redis_url.is_none());
        assert_eq!(config.results.ttl, RESULT_TTL);
        assert!(config.blob.is_none());
        assert_eq!(config.amqp.queue, DEFAULT_QUEUE);
        assert_eq!(config.amqp.settings.virtual_host, "/");
        assert!(config.mqtt.is_none());
        assert_eq!(config.hub_url, DEFAULT_HUB_URL);
    }

    #[test]
    fn env_overrides_file() {
        let mut fc = HubConfigFile::default();
        fc.api.port = Some(9000);
        fc.amqp.host = Some("file-host".to_string());

        let config = load(&[("SCP_API_PORT", "9100")], fc).unwrap();
        assert_eq!(config.api_server.port, 9100);
        assert_eq!(config.amqp.settings.host, "file-host");
    }

    #[test]
    fn invalid_number_is_a_config_error() {
        let err = load(&[("AMQP_PORT", "many")], HubConfigFile::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn redis_url_is_built_from_parts() {
        let config = load(
            &[("REDIS_HOST", "cache"), ("REDIS_PASSWORD", "pw"), ("REDIS_DB", "2")],
            HubConfigFile::default(),
        )
        .unwrap();
        assert_eq!(config.results.redis_url.as_deref(), Some("redis://:pw@cache:6379/2"));
    }

    #[test]
    fn mqtt_requires_every_credential() {
        let partial = load(&[("MQTT_INSTANCE_ID", "i")], HubConfigFile::default()).unwrap();
        assert!(partial.mqtt.is_none());

        let full = load(
            &[
                ("MQTT_INSTANCE_ID", "mqtt-cn-01"),
                ("MQTT_ENDPOINT", "broker.example"),
                ("MQTT_GROUP_ID", "GID_lab"),
                ("MQTT_DEVICE_ID", "dev1"),
                ("MQTT_AK", "ak"),
                ("MQTT_SK", "sk"),
            ],
            HubConfigFile::default(),
        )
        .unwrap();
        let mqtt = full.mqtt.unwrap();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.status_topic, "device_status");
        assert_eq!(mqtt.secret_key.expose_secret(), "sk");
    }

    #[test]
    fn permission_service_from_env() {
        let config = load(
            &[("PERMISSION_SERVER_URL", "http://127.0.0.1"), ("PERMISSION_SERVER_PORT", "8010")],
            HubConfigFile::default(),
        )
        .unwrap();
        let registration = config.registry.permission.unwrap().registration();
        assert_eq!(registration.name, PERMISSION_SERVER_NAME);
        assert_eq!(registration.port, PortRequest::Fixed(8010));
    }
}
