//! Device command engine
//!
//! A [`CommandPublisher`] places [`CommandEnvelope`]s on a durable queue and
//! a [`CommandConsumer`] executes them against an [`ActionRegistry`], writing
//! each result to the result store under the command's request id.

mod actions;
pub mod broker;
mod consumer;
mod device_tools;
mod envelope;
mod publisher;

pub use actions::{Action, ActionHandler, ActionKind, ActionRegistry, ActionResult, MessageStatus};
pub use broker::{AmqpBroker, AmqpSettings, Broker, Delivery, MemoryBroker, Subscription};
pub use consumer::{CommandConsumer, ConsumerConfig, ConsumerState, Disposition};
pub use device_tools::{DeviceToolset, SYNC_WAIT};
pub use envelope::{CommandEnvelope, QUEUE_MAX_LENGTH, QUEUE_MESSAGE_TTL_MS, QueueSpec};
pub use publisher::{
    CommandPublisher, CommandSink, DEFAULT_MAX_PENDING, PENDING_MAX_AGE, PendingRequest, QueueSink,
};
