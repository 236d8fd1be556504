//! Device action table and action results
//!
//! A device exposes a fixed set of named actions, registered at startup.
//! Each action is tagged as a device, agent or data action.

use std::sync::Arc;

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::tools::ToolDescriptor;
use crate::{Error, Result};

/// Category of a registered action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Device,
    Agent,
    Data,
}

/// Status code carried by an [`ActionResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum MessageStatus {
    Final,
    Intermediate,
    Error,
}

impl From<MessageStatus> for i8 {
    fn from(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Final => 1,
            MessageStatus::Intermediate => 2,
            MessageStatus::Error => -1,
        }
    }
}

impl TryFrom<i8> for MessageStatus {
    type Error = String;

    fn try_from(code: i8) -> std::result::Result<Self, String> {
        match code {
            1 => Ok(Self::Final),
            2 => Ok(Self::Intermediate),
            -1 => Ok(Self::Error),
            other => Err(format!("unknown message status {other}")),
        }
    }
}

/// Result record reported for a device action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub message: String,
    pub request_id: String,
    pub index: u32,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub method: String,
    pub message_status: MessageStatus,
}

impl ActionResult {
    #[must_use]
    pub fn new(request_id: impl Into<String>, status: MessageStatus, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            request_id: request_id.into(),
            index: 0,
            result: Value::Null,
            method: String::new(),
            message_status: status,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(request_id, MessageStatus::Error, message)
    }

    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Async action implementation receiving the command params
pub type ActionHandler =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A registered action
#[derive(Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub description: String,
    pub input_schema: Value,
    handler: ActionHandler,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Actions served by one device
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    device_name: String,
    actions: IndexMap<String, Action>,
}

impl ActionRegistry {
    #[must_use]
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            actions: IndexMap::new(),
        }
    }

    /// Register an action, replacing any action with the same name
    #[must_use]
    pub fn with_action<F, Fut>(
        mut self,
        kind: ActionKind,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.actions.insert(
            name.into(),
            Action {
                kind,
                description: description.into(),
                input_schema,
                handler,
            },
        );
        self
    }

    /// Built-in device answering `ping` and `echo`
    #[must_use]
    pub fn echo(device_name: impl Into<String>) -> Self {
        Self::new(device_name)
            .with_action(
                ActionKind::Device,
                "ping",
                "Check that the device is reachable",
                json!({"type": "object", "properties": {}}),
                |_| async { Ok(json!({"ok": true})) },
            )
            .with_action(
                ActionKind::Device,
                "echo",
                "Return the given params",
                json!({"type": "object", "additionalProperties": true}),
                |params| async move { Ok(Value::Object(params)) },
            )
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub fn get(&self, action: &str) -> Option<&Action> {
        self.actions.get(action)
    }

    /// Registered actions as tool descriptors
    #[must_use]
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.actions
            .iter()
            .map(|(name, action)| {
                ToolDescriptor::new(name.clone(), action.description.clone(), action.input_schema.clone())
            })
            .collect()
    }

    /// Run an action
    ///
    /// An unknown device or action yields an error [`ActionResult`] rather
    /// than an error, so the command is reported and not retried.
    ///
    /// # Errors
    ///
    /// Returns `Handler` when the action itself fails
    pub async fn dispatch(
        &self,
        device_name: &str,
        action: &str,
        params: Map<String, Value>,
    ) -> Result<Value> {
        let request_id = params
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if device_name != self.device_name {
            return Ok(ActionResult::error(request_id, format!("Unknown device: {device_name}")).to_value());
        }
        let Some(registered) = self.actions.get(action) else {
            return Ok(ActionResult::error(request_id, format!("Unknown action: {action}")).to_value());
        };

        tracing::info!(device = device_name, action, kind = ?registered.kind, request_id = %request_id, "executing action");
        (registered.handler)(params).await.map_err(|e| match e {
            Error::Handler(_) => e,
            other => Error::Handler(format!("{action}: {other}")),
        })
    }
}
