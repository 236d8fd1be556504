//! Message broker abstraction for the durable command queue

mod amqp;
mod memory;

use async_trait::async_trait;

pub use amqp::{AmqpBroker, AmqpSettings};
pub use memory::MemoryBroker;

use super::envelope::QueueSpec;
use crate::Result;

/// A broker holding durable command queues
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare the queue and publish a persistent message to it
    async fn publish(&self, queue: &QueueSpec, body: Vec<u8>) -> Result<()>;

    /// Open a dedicated connection, declare the queue and start consuming
    ///
    /// At most `prefetch` deliveries are outstanding at a time.
    async fn consume(&self, queue: &QueueSpec, prefetch: u16) -> Result<Box<dyn Subscription>>;
}

/// An open consumer on one queue
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery
    ///
    /// Returns a `BrokerUnavailable` or `Channel` error when the connection
    /// is lost.
    async fn next(&mut self) -> Result<Box<dyn Delivery>>;

    /// Close the channel and connection
    async fn close(&mut self);
}

/// One received message awaiting acknowledgement
#[async_trait]
pub trait Delivery: Send + Sync {
    fn body(&self) -> &[u8];

    /// Acknowledge, removing the message from the queue
    async fn ack(&self) -> Result<()>;

    /// Reject, optionally returning the message to the queue
    async fn nack(&self, requeue: bool) -> Result<()>;
}
