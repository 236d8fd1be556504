//! SCP Hub - tool registry and command plumbing for laboratory devices
//!
//! This library provides the core functionality for the hub and its workers:
//! - Backend server registry with health caching and dynamic ports
//! - Tool aggregation and dispatch across registered servers
//! - Durable command queue with publisher and reconnecting consumer
//! - Result store with blob upload for inline files
//! - Telemetry bridge from the device status topic
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    HTTP API                         │
//! │  register │ servers │ tools │ call_tool │ results   │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                      Hub                            │
//! │  Registry │ Health cache │ Tool gateway │ Results   │
//! └──────┬─────────────────────────────────────┬────────┘
//!        │                                     │
//! ┌──────▼──────────────┐           ┌──────────▼────────┐
//! │  Command queue      │           │  Status topic     │
//! │  publish / consume  │           │  bridge+callbacks │
//! └─────────────────────┘           └───────────────────┘
//! ```

pub mod api;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hub;
pub mod registry;
pub mod results;
pub mod telemetry;
pub mod tools;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use hub::{Hub, HubBuilder};
pub use registry::{BackendServer, Registration, ServerKind, ServerRegistry};
pub use results::{ResultBridge, ResultStore};
pub use tools::{ToolDescriptor, ToolGateway};
