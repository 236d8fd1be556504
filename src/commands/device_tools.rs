//! Device actions exposed as callable tools
//!
//! Calling a device tool publishes a command for the device and either
//! returns right away (`async_flag`) or waits for the result.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use super::actions::{ActionRegistry, ActionResult, MessageStatus};
use super::publisher::CommandPublisher;
use crate::tools::{Content, ToolDescriptor, text_content};
use crate::{Error, Result};

/// How long a synchronous tool call waits for its result
pub const SYNC_WAIT: Duration = Duration::from_secs(20);

/// Tools backed by a device's action table
#[derive(Debug, Clone)]
pub struct DeviceToolset {
    actions: Arc<ActionRegistry>,
    publisher: Arc<CommandPublisher>,
    wait: Duration,
}

impl DeviceToolset {
    #[must_use]
    pub fn new(actions: Arc<ActionRegistry>, publisher: Arc<CommandPublisher>) -> Self {
        Self {
            actions,
            publisher,
            wait: SYNC_WAIT,
        }
    }

    #[must_use]
    pub const fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.actions.tools()
    }

    /// Run a device tool and describe the outcome as an [`ActionResult`]
    ///
    /// # Errors
    ///
    /// Returns `ToolNotFound` for an unknown action and the publisher's
    /// error when the command cannot be sent
    pub async fn call(&self, name: &str, mut arguments: Map<String, Value>) -> Result<ActionResult> {
        if self.actions.get(name).is_none() {
            return Err(Error::ToolNotFound {
                tool: name.to_string(),
                server: None,
            });
        }

        let async_flag = arguments
            .remove("async_flag")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let request_id = self
            .publisher
            .send(self.actions.device_name(), name, arguments)
            .await?;

        if async_flag {
            return Ok(ActionResult::new(
                request_id,
                MessageStatus::Intermediate,
                "async operation submitted, fetch the result by request id",
            )
            .with_method(name));
        }

        let outcome = match self.publisher.wait_for_result(&request_id, self.wait).await? {
            Some(record) => ActionResult::new(request_id, MessageStatus::Final, "success").with_result(record),
            None => ActionResult::new(
                request_id,
                MessageStatus::Intermediate,
                "result not ready in time, fetch it asynchronously",
            ),
        };
        Ok(outcome.with_method(name))
    }

    /// Run a device tool and wrap the outcome as tool content
    ///
    /// # Errors
    ///
    /// Same as [`Self::call`]
    pub async fn call_content(&self, name: &str, arguments: Map<String, Value>) -> Result<Content> {
        let outcome = self.call(name, arguments).await?;
        Ok(vec![text_content(serde_json::to_string(&outcome)?)])
    }
}
