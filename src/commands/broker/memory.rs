//! In-process broker with queue semantics close to AMQP
//!
//! Queues drop their oldest message past `max_length`, expire messages
//! after their TTL and return requeued messages to the head. Connections can
//! be severed or refused to exercise reconnect paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::{Broker, Delivery, Subscription};
use crate::commands::envelope::QueueSpec;
use crate::{Error, Result};

struct Message {
    body: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
    notify: Notify,
    generation: AtomicU64,
    refuse_connects: AtomicUsize,
    published: AtomicUsize,
}

impl Shared {
    async fn requeue(&self, queue: &str, message: Message) {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_front(message);
        self.notify.notify_waiters();
    }
}

/// Broker living entirely in this process
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("generation", &self.shared.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently waiting in `queue`
    pub async fn depth(&self, queue: &str) -> usize {
        self.shared
            .queues
            .lock()
            .await
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Total messages accepted by `publish`
    #[must_use]
    pub fn published(&self) -> usize {
        self.shared.published.load(Ordering::SeqCst)
    }

    /// Sever every open subscription
    pub fn disconnect_all(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connections(&self, count: usize) {
        self.shared.refuse_connects.store(count, Ordering::SeqCst);
    }

    fn check_connect(&self) -> Result<()> {
        let refused = self
            .shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(Error::BrokerUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &QueueSpec, body: Vec<u8>) -> Result<()> {
        self.check_connect()?;

        let ttl = Duration::from_millis(u64::try_from(queue.message_ttl_ms).unwrap_or(0));
        let max_length = usize::try_from(queue.max_length).unwrap_or(usize::MAX);

        let mut queues = self.shared.queues.lock().await;
        let messages = queues.entry(queue.name.clone()).or_default();
        while max_length > 0 && messages.len() >= max_length {
            messages.pop_front();
        }
        messages.push_back(Message {
            body,
            expires_at: Instant::now() + ttl,
        });
        drop(queues);

        self.shared.published.fetch_add(1, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &QueueSpec, prefetch: u16) -> Result<Box<dyn Subscription>> {
        self.check_connect()?;
        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            queue: queue.name.clone(),
            generation: self.shared.generation.load(Ordering::SeqCst),
            credit: Arc::new(Semaphore::new(usize::from(prefetch.max(1)))),
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    generation: u64,
    credit: Arc<Semaphore>,
}

impl MemorySubscription {
    fn ensure_connected(&self) -> Result<()> {
        if self.shared.generation.load(Ordering::SeqCst) == self.generation {
            Ok(())
        } else {
            Err(Error::BrokerUnavailable("connection lost".to_string()))
        }
    }

    async fn pop(&self) -> Option<Message> {
        let mut queues = self.shared.queues.lock().await;
        let messages = queues.get_mut(&self.queue)?;
        let now = Instant::now();
        while let Some(message) = messages.pop_front() {
            if message.expires_at > now {
                return Some(message);
            }
        }
        None
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Box<dyn Delivery>> {
        self.ensure_connected()?;
        let permit = self
            .credit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Channel("subscription closed".to_string()))?;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_connected()?;
            if let Some(message) = self.pop().await {
                return Ok(Box::new(MemoryDelivery {
                    shared: self.shared.clone(),
                    queue: self.queue.clone(),
                    body: message.body,
                    expires_at: message.expires_at,
                    settled: AtomicBool::new(false),
                    _permit: permit,
                }));
            }

            notified.await;
        }
    }

    async fn close(&mut self) {
        self.credit.close();
    }
}

struct MemoryDelivery {
    shared: Arc<Shared>,
    queue: String,
    body: Vec<u8>,
    expires_at: Instant,
    settled: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&self) -> Result<()> {
        self.settled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) || !requeue {
            return Ok(());
        }
        let message = Message {
            body: self.body.clone(),
            expires_at: self.expires_at,
        };
        self.shared.requeue(&self.queue, message).await;
        Ok(())
    }
}
