//! Status topic listener feeding the result store

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::callbacks::{CallbackHandler, CallbackWorker};
use super::confirm::PublishConfirmations;
use super::credentials::MqttCredentials;
use crate::commands::{CommandEnvelope, CommandPublisher, CommandSink};
use crate::results::ResultBridge;
use crate::{Error, Result};

/// Number of status messages kept for inspection
pub const STATUS_HISTORY: usize = 100;

/// Age after which callbacks and pending commands are swept
pub const STALE_AFTER: Duration = Duration::from_secs(3600);

/// How often the staleness sweep runs
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// How long a control publish may wait for the broker's acknowledgement
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub instance_id: String,
    pub group_id: String,
    pub device_id: String,
    pub access_key: String,
    pub secret_key: SecretString,
    pub control_topic: String,
    pub status_topic: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

/// Client half and event loop of one broker connection
pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    status_topic: String,
    control_topic: String,
    reconnect_delay: Duration,
    confirmations: Arc<PublishConfirmations>,
}

impl std::fmt::Debug for MqttLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttLink")
            .field("status_topic", &self.status_topic)
            .field("control_topic", &self.control_topic)
            .finish_non_exhaustive()
    }
}

impl MqttLink {
    /// Prepare a connection; nothing is sent until the bridge runs
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the credentials cannot be signed
    pub fn new(settings: &MqttSettings) -> Result<Self> {
        let creds = MqttCredentials::sign(
            &settings.group_id,
            &settings.device_id,
            &settings.instance_id,
            &settings.access_key,
            &settings.secret_key,
        )?;

        let mut options = MqttOptions::new(&creds.client_id, &settings.host, settings.port);
        options.set_credentials(creds.username, creds.password.expose_secret());
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, 64);
        Ok(Self {
            client,
            eventloop,
            status_topic: settings.status_topic.clone(),
            control_topic: settings.control_topic.clone(),
            reconnect_delay: settings.reconnect_delay,
            confirmations: Arc::new(PublishConfirmations::new()),
        })
    }

    /// Publisher sink writing envelopes to the control topic
    ///
    /// Deliveries are confirmed by whichever task polls this link.
    #[must_use]
    pub fn control_sink(&self) -> MqttControlSink {
        MqttControlSink {
            client: self.client.clone(),
            topic: self.control_topic.clone(),
            confirmations: self.confirmations.clone(),
            order: Arc::new(tokio::sync::Mutex::new(())),
            timeout: PUBLISH_TIMEOUT,
        }
    }

    /// Publish-only use: poll the connection in the background
    ///
    /// The returned sink stays usable until `shutdown` is cancelled.
    #[must_use]
    pub fn drive(self, shutdown: CancellationToken) -> (MqttControlSink, JoinHandle<()>) {
        let sink = self.control_sink();
        let Self {
            client,
            mut eventloop,
            reconnect_delay,
            confirmations,
            ..
        } = self;

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(event) => confirmations.observe(&event),
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt connection error");
                        confirmations.fail_all(&e.to_string());
                        tokio::select! {
                            () = shutdown.cancelled() => break,
                            () = tokio::time::sleep(reconnect_delay) => {}
                        }
                    }
                }
            }
            confirmations.fail_all("mqtt link closed");
            let _ = client.disconnect().await;
        });
        (sink, handle)
    }
}

/// Sends command envelopes on the control topic
///
/// A delivery succeeds once the broker acknowledges the publish. A dropped
/// connection or no acknowledgement within the timeout is `BrokerUnavailable`.
#[derive(Debug, Clone)]
pub struct MqttControlSink {
    client: AsyncClient,
    topic: String,
    confirmations: Arc<PublishConfirmations>,
    order: Arc<tokio::sync::Mutex<()>>,
    timeout: Duration,
}

impl MqttControlSink {
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CommandSink for MqttControlSink {
    async fn deliver(&self, envelope: &CommandEnvelope) -> Result<()> {
        let body = envelope.encode()?;
        let confirmed = {
            let _order = self.order.lock().await;
            let confirmed = self.confirmations.expect();
            if let Err(e) = self
                .client
                .publish(&self.topic, QoS::AtLeastOnce, false, body)
                .await
            {
                self.confirmations.withdraw();
                return Err(Error::BrokerUnavailable(e.to_string()));
            }
            confirmed
        };

        match tokio::time::timeout(self.timeout, confirmed).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::BrokerUnavailable("mqtt link closed".to_string())),
            Err(_) => Err(Error::BrokerUnavailable(format!(
                "publish not acknowledged within {:?}",
                self.timeout
            ))),
        }
    }
}

/// A status message as received
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusUpdate {
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub payload: Value,
}

struct Registration {
    handler: CallbackHandler,
    registered_at: Instant,
    watcher: Option<JoinHandle<()>>,
}

/// Registered callbacks, each fired at most once
struct CallbackTable {
    entries: Mutex<HashMap<String, Registration>>,
    worker: CallbackWorker,
}

impl CallbackTable {
    fn fire(&self, request_id: &str, payload: Value) -> bool {
        let registration = self
            .entries
            .lock()
            .ok()
            .and_then(|mut entries| entries.remove(request_id));
        let Some(registration) = registration else {
            return false;
        };
        if let Some(watcher) = registration.watcher {
            watcher.abort();
        }
        match self.worker.enqueue(request_id, registration.handler, payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(request_id, error = %e, "failed to queue callback");
                false
            }
        }
    }
}

/// Bridges the status topic into the result store and callbacks
pub struct TelemetryBridge {
    results: Arc<dyn ResultBridge>,
    callbacks: Arc<CallbackTable>,
    history: Mutex<VecDeque<StatusUpdate>>,
    publisher: Option<Arc<CommandPublisher>>,
}

impl std::fmt::Debug for TelemetryBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBridge")
            .field("callbacks", &self.callback_count())
            .finish_non_exhaustive()
    }
}

impl TelemetryBridge {
    /// Create a bridge with its own callback worker thread
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be started
    pub fn new(results: Arc<dyn ResultBridge>) -> Result<Self> {
        Ok(Self {
            results,
            callbacks: Arc::new(CallbackTable {
                entries: Mutex::new(HashMap::new()),
                worker: CallbackWorker::spawn(super::callbacks::DEFAULT_QUEUE_CAPACITY)?,
            }),
            history: Mutex::new(VecDeque::with_capacity(STATUS_HISTORY)),
            publisher: None,
        })
    }

    /// Sweep this publisher's pending requests along with stale callbacks
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<CommandPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Handle one status message
    ///
    /// The payload is kept in the history, stored under its `request_id`
    /// and handed to the request's callback, if any. Returns the request id.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` if the payload is not JSON
    pub async fn handle_status(&self, raw: &[u8]) -> Result<Option<String>> {
        let payload: Value =
            serde_json::from_slice(raw).map_err(|e| Error::MalformedMessage(e.to_string()))?;
        self.remember(&payload);

        let Some(request_id) = payload
            .get("request_id")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            tracing::debug!("status message without request_id");
            return Ok(None);
        };

        match self.results.put(&request_id, payload.clone()).await {
            Ok(()) => tracing::info!(request_id = %request_id, "status stored"),
            Err(e) => tracing::warn!(request_id = %request_id, error = %e, "failed to store status"),
        }
        self.callbacks.fire(&request_id, payload);
        Ok(Some(request_id))
    }

    fn remember(&self, payload: &Value) {
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        if history.len() >= STATUS_HISTORY {
            history.pop_front();
        }
        history.push_back(StatusUpdate {
            received_at: chrono::Utc::now(),
            payload: payload.clone(),
        });
    }

    /// Most recent status messages, oldest first
    #[must_use]
    pub fn status_updates(&self) -> Vec<StatusUpdate> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Install the callback for `request_id`, replacing any previous one
    ///
    /// The callback fires once, on the next status message for the request
    /// or the next result written to a store that supports notifications.
    /// Must be called within a tokio runtime.
    pub fn register_callback(&self, request_id: &str, handler: CallbackHandler) {
        let updates = self.results.subscribe(request_id);
        let Ok(mut entries) = self.callbacks.entries.lock() else {
            return;
        };

        let watcher = updates.map(|rx| spawn_watcher(self.callbacks.clone(), request_id.to_string(), rx));
        let previous = entries.insert(
            request_id.to_string(),
            Registration {
                handler,
                registered_at: Instant::now(),
                watcher,
            },
        );
        if let Some(watcher) = previous.and_then(|p| p.watcher) {
            watcher.abort();
        }
        tracing::debug!(request_id, "callback registered");
    }

    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.entries.lock().map_or(0, |e| e.len())
    }

    /// Callbacks queued or running on the worker
    #[must_use]
    pub fn active_callbacks(&self) -> usize {
        self.callbacks.worker.active()
    }

    /// Remove callbacks and pending commands older than `max_age`
    ///
    /// Running callbacks older than `max_age` are cancelled. Returns the
    /// number of removed registrations and pending commands.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        if let Ok(mut entries) = self.callbacks.entries.lock() {
            let now = Instant::now();
            entries.retain(|_, registration| {
                let keep = now.duration_since(registration.registered_at) < max_age;
                if !keep {
                    if let Some(watcher) = &registration.watcher {
                        watcher.abort();
                    }
                    removed += 1;
                }
                keep
            });
        }
        self.callbacks.worker.cancel_older_than(max_age);
        if let Some(publisher) = &self.publisher {
            removed += publisher.sweep(max_age).await;
        }
        if removed > 0 {
            tracing::info!(removed, "cleaned up stale requests");
        }
        removed
    }

    /// Stop the callback worker, cancelling running callbacks
    pub fn shutdown(&self) {
        if let Ok(mut entries) = self.callbacks.entries.lock() {
            for registration in entries.values() {
                if let Some(watcher) = &registration.watcher {
                    watcher.abort();
                }
            }
            entries.clear();
        }
        self.callbacks.worker.shutdown();
    }

    /// Listen on the status topic until shutdown
    ///
    /// Refused connections and network errors are logged and retried after
    /// the link's reconnect delay. A rejected subscription is retried once.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok` once `shutdown` fires
    pub async fn run(self: Arc<Self>, link: MqttLink, shutdown: CancellationToken) -> Result<()> {
        let MqttLink {
            client,
            mut eventloop,
            status_topic,
            reconnect_delay,
            confirmations,
            ..
        } = link;

        let sweeper = tokio::spawn({
            let bridge = self.clone();
            let shutdown = shutdown.clone();
            async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            bridge.sweep(STALE_AFTER).await;
                        }
                    }
                }
            }
        });

        let mut resubscribed = false;
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = eventloop.poll() => event,
            };

            if let Ok(event) = &event {
                confirmations.observe(event);
            }
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(topic = %status_topic, "connected to mqtt broker");
                    resubscribed = false;
                    if let Err(e) = client.subscribe(&status_topic, QoS::AtLeastOnce).await {
                        tracing::error!(topic = %status_topic, error = %e, "subscribe request failed");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let rejected = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    if !rejected {
                        tracing::info!(topic = %status_topic, "subscribed to status topic");
                    } else if resubscribed {
                        tracing::error!(topic = %status_topic, "subscription rejected again");
                    } else {
                        resubscribed = true;
                        tracing::warn!(topic = %status_topic, "subscription rejected, retrying");
                        let client = client.clone();
                        let topic = status_topic.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                                tracing::error!(topic = %topic, error = %e, "resubscribe failed");
                            }
                        });
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == status_topic {
                        if let Err(e) = self.handle_status(&publish.payload).await {
                            tracing::error!(error = %e, "invalid status message");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    match &e {
                        ConnectionError::ConnectionRefused(code) => {
                            tracing::error!(?code, "mqtt connection refused");
                        }
                        other => tracing::warn!(error = %other, "mqtt connection error"),
                    }
                    confirmations.fail_all(&e.to_string());
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }

        confirmations.fail_all("mqtt link closed");
        let _ = client.disconnect().await;
        sweeper.abort();
        tracing::info!("telemetry bridge stopped");
        Ok(())
    }
}

fn spawn_watcher(
    table: Arc<CallbackTable>,
    request_id: String,
    mut updates: broadcast::Receiver<Value>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(payload) => {
                    table.fire(&request_id, payload);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
