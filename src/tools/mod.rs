//! Tool aggregation and dispatch
//!
//! [`ToolGateway`] merges the catalogs of all healthy backend servers under
//! `server.tool` names and routes calls to the first server able to serve
//! them.

mod aggregator;
mod client;
mod dispatcher;
mod rpc;
mod types;

use std::sync::Arc;

pub use client::{CALL_TIMEOUT, HttpToolClient, RpcToolClient, ToolClient, Transports};
pub use dispatcher::PERMISSION_TOOL;
pub use rpc::{RequestId, RpcErrorBody, RpcRequest, RpcResponse, find_response};
pub use types::{Content, ToolDescriptor, split_qualified, text_content};

use crate::registry::{HealthMonitor, ServerRegistry};

/// Lists and invokes tools across the registered servers
#[derive(Debug, Clone)]
pub struct ToolGateway {
    registry: Arc<ServerRegistry>,
    health: Arc<HealthMonitor>,
    transports: Transports,
}

impl ToolGateway {
    #[must_use]
    pub const fn new(
        registry: Arc<ServerRegistry>,
        health: Arc<HealthMonitor>,
        transports: Transports,
    ) -> Self {
        Self {
            registry,
            health,
            transports,
        }
    }
}
