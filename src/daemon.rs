//! Process wiring for the hub and worker commands

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiServerBuilder};
use crate::commands::{
    ActionRegistry, AmqpBroker, Broker, CommandConsumer, CommandPublisher, CommandSink,
    ConsumerConfig, DeviceToolset, QueueSink, QueueSpec,
};
use crate::config::Config;
use crate::hub::Hub;
use crate::registry::SnapshotStore;
use crate::results::{
    HttpBlobStorage, HubResultClient, MemoryBackend, RedisBackend, ResultBackend, ResultBridge,
    ResultStore,
};
use crate::telemetry::{MqttLink, TelemetryBridge};
use crate::{Error, Result};

/// Channel a command is published on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandTransport {
    /// Durable AMQP queue
    #[default]
    Queue,
    /// MQTT control topic
    Control,
}

/// Hub process: HTTP API plus, when configured, the telemetry bridge
pub struct Daemon {
    config: Config,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Result store selected by configuration
    ///
    /// # Errors
    ///
    /// Returns a storage error if Redis is configured but unreachable
    pub async fn result_store(config: &Config) -> Result<ResultStore> {
        let backend: Arc<dyn ResultBackend> = match &config.results.redis_url {
            Some(url) => Arc::new(RedisBackend::connect(url).await?),
            None => {
                tracing::warn!("no redis configured, results are kept in memory");
                Arc::new(MemoryBackend::new())
            }
        };

        let mut store = ResultStore::new(backend).with_ttl(config.results.ttl);
        if let Some(blob) = &config.blob {
            store = store.with_blobs(Arc::new(HttpBlobStorage::new(
                &blob.endpoint,
                &blob.bucket,
                &blob.prefix,
                blob.token.clone(),
            )));
        }
        Ok(store)
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the result store, the snapshot or the listener fail
    pub async fn run(self) -> Result<()> {
        let results: Arc<dyn ResultBridge> = Arc::new(Self::result_store(&self.config).await?);

        let mut builder = Hub::builder()
            .snapshot(SnapshotStore::new(&self.config.registry.snapshot_path))
            .results(results.clone());

        let mut link = None;
        if let Some(mqtt) = &self.config.mqtt {
            let bridge = Arc::new(TelemetryBridge::new(results)?);
            link = Some((bridge.clone(), MqttLink::new(mqtt)?));
            builder = builder.telemetry(bridge);
        }

        let hub = Arc::new(builder.build());
        let permission = self
            .config
            .registry
            .permission
            .as_ref()
            .map(crate::config::PermissionConfig::registration);
        hub.bootstrap(permission).await?;

        let shutdown = hub.shutdown_token();
        let telemetry = link.map(|(bridge, link)| {
            tracing::info!("starting telemetry bridge");
            tokio::spawn(bridge.run(link, shutdown.clone()))
        });

        let server = ApiServerBuilder::new(hub.clone())
            .host(&self.config.api_server.host)
            .port(self.config.api_server.port)
            .build()
            .spawn(shutdown.clone());

        tracing::info!("scp hub ready");
        wait_for_ctrl_c(&shutdown).await;

        hub.shutdown();
        if let Some(telemetry) = telemetry {
            log_task_result("telemetry bridge", telemetry.await);
        }
        log_task_result("api server", server.await);
        Ok(())
    }
}

/// Options for [`run_worker`]
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub device: String,
    /// Serve the device's tools and register with the hub on this port
    pub tools_port: Option<u16>,
    /// URL the hub should use to reach this worker
    pub advertise_url: String,
}

/// Consume commands for one device, writing results through the hub
///
/// # Errors
///
/// Returns error if the consumer gives up reconnecting or the tool endpoint
/// cannot be started
pub async fn run_worker(config: &Config, options: WorkerOptions) -> Result<()> {
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.amqp.settings.clone()));
    let results: Arc<dyn ResultBridge> = Arc::new(HubResultClient::new(&config.hub_url));
    let actions = Arc::new(ActionRegistry::echo(&options.device));
    let queue = QueueSpec::durable(&config.amqp.queue);

    let consumer = CommandConsumer::new(
        broker.clone(),
        actions.clone(),
        results.clone(),
        ConsumerConfig {
            queue: queue.clone(),
            prefetch: config.amqp.prefetch,
            retry_interval: config.amqp.retry_interval,
            max_retries: config.amqp.max_retries,
        },
    );

    let shutdown = CancellationToken::new();
    let endpoint = match options.tools_port {
        Some(port) => {
            let publisher = Arc::new(CommandPublisher::new(
                Arc::new(QueueSink::new(broker, queue)),
                results,
            ));
            let toolset = Arc::new(DeviceToolset::new(actions, publisher));
            let listener = TcpListener::bind(("0.0.0.0", port)).await?;
            let port = listener.local_addr()?.port();
            let router = api::with_layers(api::worker::router(toolset));
            let handle = tokio::spawn(api::serve(listener, router, shutdown.clone()));
            tracing::info!(port, device = %options.device, "worker tool endpoint listening");

            register_with_hub(&config.hub_url, &options, port).await?;
            Some(handle)
        }
        None => None,
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { wait_for_ctrl_c(&shutdown).await }
    });

    let outcome = consumer.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Some(endpoint) = endpoint {
        log_task_result("worker tool endpoint", endpoint.await);
    }
    outcome
}

async fn register_with_hub(hub_url: &str, options: &WorkerOptions, port: u16) -> Result<()> {
    let url = format!("{}/register_server", hub_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(&json!({
            "server_url": options.advertise_url,
            "server_name": options.device,
            "server_description": format!("device worker for {}", options.device),
            "server_port": port,
            "type": "direct",
        }))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Transport(format!(
            "hub registration failed ({status}): {body}"
        )));
    }
    tracing::info!(hub = hub_url, device = %options.device, "registered with hub");
    Ok(())
}

/// Publish one command and optionally wait for its result
///
/// # Errors
///
/// Returns a validation error for empty names or a broker error when the
/// command cannot be published
pub async fn send_command(
    config: &Config,
    transport: CommandTransport,
    device: &str,
    action: &str,
    params: Map<String, Value>,
    wait: Option<Duration>,
) -> Result<(String, Option<Value>)> {
    let results: Arc<dyn ResultBridge> = Arc::new(HubResultClient::new(&config.hub_url));
    let shutdown = CancellationToken::new();

    let (sink, driver) = match transport {
        CommandTransport::Queue => {
            let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(config.amqp.settings.clone()));
            let sink: Arc<dyn CommandSink> =
                Arc::new(QueueSink::new(broker, QueueSpec::durable(&config.amqp.queue)));
            (sink, None)
        }
        CommandTransport::Control => {
            let settings = config
                .mqtt
                .as_ref()
                .ok_or_else(|| Error::Config("mqtt is not configured".to_string()))?;
            let (sink, handle) = MqttLink::new(settings)?.drive(shutdown.clone());
            let sink: Arc<dyn CommandSink> = Arc::new(sink);
            (sink, Some(handle))
        }
    };

    let publisher = CommandPublisher::new(sink, results);
    let outcome = async {
        let request_id = publisher.send(device, action, params).await?;
        let result = match wait {
            Some(timeout) => publisher.wait_for_result(&request_id, timeout).await?,
            None => None,
        };
        Ok::<_, Error>((request_id, result))
    }
    .await;

    shutdown.cancel();
    if let Some(driver) = driver {
        let _ = driver.await;
    }
    outcome
}

/// Fetch stored results from the hub
///
/// # Errors
///
/// Returns a transport error if the hub cannot be reached
pub async fn fetch_result(config: &Config, request_id: &str) -> Result<Option<Value>> {
    HubResultClient::new(&config.hub_url).get(request_id).await
}

async fn wait_for_ctrl_c(shutdown: &CancellationToken) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                shutdown.cancelled().await;
            }
        },
    }
}

fn log_task_result(name: &str, joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => tracing::debug!(task = name, "task finished"),
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "task failed"),
        Err(e) => tracing::error!(task = name, error = %e, "task panicked"),
    }
}
