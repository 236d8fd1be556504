//! Command publisher with pending-request tracking

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::broker::Broker;
use super::envelope::{CommandEnvelope, QueueSpec};
use crate::results::ResultBridge;
use crate::{Error, Result};

/// Default bound on outstanding commands
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Age after which a pending request is swept
pub const PENDING_MAX_AGE: Duration = Duration::from_secs(3600);

/// Destination for outbound command envelopes
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn deliver(&self, envelope: &CommandEnvelope) -> Result<()>;
}

/// Publishes envelopes to a durable broker queue
pub struct QueueSink {
    broker: Arc<dyn Broker>,
    queue: QueueSpec,
}

impl QueueSink {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, queue: QueueSpec) -> Self {
        Self { broker, queue }
    }
}

#[async_trait]
impl CommandSink for QueueSink {
    async fn deliver(&self, envelope: &CommandEnvelope) -> Result<()> {
        self.broker.publish(&self.queue, envelope.encode()?).await
    }
}

/// A command sent by this publisher
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: String,
    pub envelope: CommandEnvelope,
    pub created_at: Instant,
    pub completed: bool,
    pub response: Option<Value>,
}

/// Sends device commands and waits for their results
pub struct CommandPublisher {
    sink: Arc<dyn CommandSink>,
    results: Arc<dyn ResultBridge>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    max_pending: usize,
}

impl std::fmt::Debug for CommandPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPublisher")
            .field("max_pending", &self.max_pending)
            .finish_non_exhaustive()
    }
}

impl CommandPublisher {
    #[must_use]
    pub fn new(sink: Arc<dyn CommandSink>, results: Arc<dyn ResultBridge>) -> Self {
        Self {
            sink,
            results,
            pending: Mutex::new(HashMap::new()),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Publish a command and return its request id
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty device or action, and
    /// `BrokerUnavailable` when publishing fails. A failed send leaves no
    /// pending entry behind.
    pub async fn send(
        &self,
        device_name: &str,
        device_action: &str,
        device_params: Map<String, Value>,
    ) -> Result<String> {
        let envelope = CommandEnvelope::new(device_name, device_action, device_params)?;
        let request_id = envelope.request_id.clone();

        self.track(PendingRequest {
            request_id: request_id.clone(),
            envelope: envelope.clone(),
            created_at: Instant::now(),
            completed: false,
            response: None,
        })
        .await;

        if let Err(e) = self.sink.deliver(&envelope).await {
            self.pending.lock().await.remove(&request_id);
            tracing::error!(request_id = %request_id, device = device_name, error = %e, "failed to publish command");
            return Err(match e {
                Error::BrokerUnavailable(_) => e,
                other => Error::BrokerUnavailable(other.to_string()),
            });
        }

        tracing::info!(request_id = %request_id, device = device_name, action = device_action, "published command");
        Ok(request_id)
    }

    async fn track(&self, request: PendingRequest) {
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_pending {
            let now = Instant::now();
            pending.retain(|_, p| now.duration_since(p.created_at) < PENDING_MAX_AGE);
        }
        if pending.len() >= self.max_pending {
            let oldest = pending
                .values()
                .min_by_key(|p| (!p.completed, p.created_at))
                .map(|p| p.request_id.clone());
            if let Some(oldest) = oldest {
                tracing::warn!(request_id = %oldest, "pending table full, evicting");
                pending.remove(&oldest);
            }
        }
        pending.insert(request.request_id.clone(), request);
    }

    /// Wait up to `timeout` for the result of `request_id`
    ///
    /// Returns `None` on timeout. Work in flight is never cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the result store cannot be read
    pub async fn wait_for_result(&self, request_id: &str, timeout: Duration) -> Result<Option<Value>> {
        let record = self.results.wait_for(request_id, timeout).await?;
        match &record {
            Some(response) => {
                if let Some(pending) = self.pending.lock().await.get_mut(request_id) {
                    pending.completed = true;
                    pending.response = Some(response.clone());
                }
            }
            None => tracing::warn!(request_id, ?timeout, "timed out waiting for result"),
        }
        Ok(record)
    }

    /// Snapshot of a pending request
    pub async fn pending(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.lock().await.get(request_id).cloned()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Drop pending requests older than `max_age`, returning how many went
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        let now = Instant::now();
        pending.retain(|_, p| now.duration_since(p.created_at) < max_age);
        before - pending.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::commands::MemoryBroker;
    use crate::results::{MemoryBackend, ResultStore};

    fn publisher(broker: &MemoryBroker) -> CommandPublisher {
        let sink = Arc::new(QueueSink::new(Arc::new(broker.clone()), QueueSpec::durable("lab1")));
        let results = Arc::new(ResultStore::new(Arc::new(MemoryBackend::new())));
        CommandPublisher::new(sink, results)
    }

    #[tokio::test]
    async fn send_records_pending_and_publishes() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let id = publisher.send("lab1", "ping", Map::new()).await.unwrap();
        assert_eq!(broker.depth("lab1").await, 1);

        let pending = publisher.pending(&id).await.unwrap();
        assert_eq!(pending.envelope.device_action, "ping");
        assert!(!pending.completed);
    }

    #[tokio::test]
    async fn failed_send_rolls_back() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(1);
        let publisher = publisher(&broker);

        let err = publisher.send("lab1", "ping", Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable(_)));
        assert_eq!(publisher.pending_count().await, 0);
    }

    #[tokio::test]
    async fn empty_action_is_rejected_before_publishing() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        assert!(matches!(
            publisher.send("lab1", "", Map::new()).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(broker.published(), 0);
    }

    #[tokio::test]
    async fn pending_table_is_bounded() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker).with_max_pending(2);
        for _ in 0..5 {
            publisher.send("lab1", "ping", Map::new()).await.unwrap();
        }
        assert_eq!(publisher.pending_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_old_requests() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.send("lab1", "ping", json!({"n": 1}).as_object().cloned().unwrap()).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        publisher.send("lab1", "ping", Map::new()).await.unwrap();

        assert_eq!(publisher.sweep(Duration::from_secs(5)).await, 1);
        assert_eq!(publisher.pending_count().await, 1);
    }
}
