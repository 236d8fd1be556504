//! Command consumer with automatic reconnect
//!
//! ```text
//! Disconnected -> Connecting -> Consuming -> Reconnecting -> Connecting ...
//!                                         \-> Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::actions::ActionRegistry;
use super::broker::{Broker, Delivery, Subscription};
use super::envelope::{CommandEnvelope, QueueSpec};
use crate::Result;
use crate::results::ResultBridge;

/// Lifecycle state of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    Reconnecting { attempt: u32 },
    Stopped,
}

/// Consumer settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: QueueSpec,
    pub prefetch: u16,
    pub retry_interval: Duration,
    /// Consecutive failed connections tolerated; 0 retries forever
    pub max_retries: u32,
}

impl ConsumerConfig {
    #[must_use]
    pub fn new(queue: QueueSpec) -> Self {
        Self {
            queue,
            prefetch: 1,
            retry_interval: Duration::from_secs(5),
            max_retries: 0,
        }
    }
}

/// What to do with a delivery after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
}

/// Executes queued commands and stores their results
pub struct CommandConsumer {
    broker: Arc<dyn Broker>,
    actions: Arc<ActionRegistry>,
    results: Arc<dyn ResultBridge>,
    config: ConsumerConfig,
    state: watch::Sender<ConsumerState>,
}

impl std::fmt::Debug for CommandConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandConsumer")
            .field("queue", &self.config.queue.name)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl CommandConsumer {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        actions: Arc<ActionRegistry>,
        results: Arc<dyn ResultBridge>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            actions,
            results,
            config,
            state: watch::Sender::new(ConsumerState::Disconnected),
        }
    }

    /// Watch the consumer's state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        tracing::debug!(queue = %self.config.queue.name, ?state, "consumer state");
        self.state.send_replace(state);
    }

    /// Consume until shutdown or an unrecoverable error
    ///
    /// Connection and channel failures are retried every `retry_interval`
    /// until `max_retries` consecutive attempts have failed.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted or on a failure
    /// that cannot be fixed by reconnecting
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut retries = 0_u32;

        loop {
            if shutdown.is_cancelled() {
                self.set_state(ConsumerState::Stopped);
                return Ok(());
            }

            self.set_state(ConsumerState::Connecting);
            let err = match self.session(&shutdown, &mut retries).await {
                Ok(()) => {
                    self.set_state(ConsumerState::Stopped);
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_reconnectable() {
                tracing::error!(queue = %self.config.queue.name, error = %err, "consumer stopped");
                self.set_state(ConsumerState::Stopped);
                return Err(err);
            }

            retries += 1;
            if self.config.max_retries > 0 && retries >= self.config.max_retries {
                tracing::error!(
                    queue = %self.config.queue.name,
                    retries,
                    error = %err,
                    "giving up after reaching max retries"
                );
                self.set_state(ConsumerState::Stopped);
                return Err(err);
            }

            tracing::warn!(
                queue = %self.config.queue.name,
                error = %err,
                retry_in = ?self.config.retry_interval,
                "consumer connection error, reconnecting"
            );
            self.set_state(ConsumerState::Reconnecting { attempt: retries });

            tokio::select! {
                () = shutdown.cancelled() => {
                    self.set_state(ConsumerState::Stopped);
                    return Ok(());
                }
                () = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    async fn session(&self, shutdown: &CancellationToken, retries: &mut u32) -> Result<()> {
        let mut subscription = self
            .broker
            .consume(&self.config.queue, self.config.prefetch)
            .await?;
        *retries = 0;
        self.set_state(ConsumerState::Consuming);
        tracing::info!(queue = %self.config.queue.name, "consumer started, waiting for messages");

        let outcome = self.consume_loop(subscription.as_mut(), shutdown).await;
        subscription.close().await;
        outcome
    }

    async fn consume_loop(
        &self,
        subscription: &mut dyn Subscription,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            let delivery = tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                next = subscription.next() => next?,
            };
            self.settle(delivery.as_ref()).await?;
        }
    }

    async fn settle(&self, delivery: &dyn Delivery) -> Result<()> {
        match self.process(delivery.body()).await {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue => delivery.nack(true).await,
        }
    }

    /// Execute one delivery body and decide its fate
    ///
    /// Malformed bodies are dropped. A failing action is requeued. A result
    /// that cannot be stored is logged and the command still acknowledged.
    pub async fn process(&self, body: &[u8]) -> Disposition {
        let envelope = match CommandEnvelope::decode(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                let preview: String = String::from_utf8_lossy(body).chars().take(100).collect();
                tracing::error!(error = %e, body = %preview, "dropping malformed command");
                return Disposition::Ack;
            }
        };

        let request_id = envelope.request_id;
        let mut params = envelope.device_params;
        params.insert("request_id".to_string(), Value::String(request_id.clone()));
        tracing::info!(
            request_id = %request_id,
            device = %envelope.device_name,
            action = %envelope.device_action,
            "processing command"
        );

        let result = match self
            .actions
            .dispatch(&envelope.device_name, &envelope.device_action, params)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(request_id = %request_id, error = %e, "action failed, requeueing");
                return Disposition::Requeue;
            }
        };

        match self.results.put(&request_id, result).await {
            Ok(()) => tracing::info!(request_id = %request_id, "result published"),
            Err(e) => tracing::warn!(request_id = %request_id, error = %e, "failed to publish result"),
        }
        Disposition::Ack
    }
}
