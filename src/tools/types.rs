//! Tool catalog types

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// A tool exposed by a backend server
///
/// After aggregation `name` is namespaced as `{server}.{tool}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_schema", alias = "input_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }

    /// Copy of this descriptor namespaced under a server
    #[must_use]
    pub fn namespaced(&self, server_name: &str) -> Self {
        Self {
            name: format!("{server_name}.{}", self.name),
            ..self.clone()
        }
    }
}

/// Content items returned by a tool call, passed through untouched
pub type Content = Vec<Value>;

/// A single text content item
#[must_use]
pub fn text_content(text: impl Into<String>) -> Value {
    json!({ "type": "text", "text": text.into() })
}

/// Split a qualified tool name on its first `.`
///
/// Returns `(None, name)` when the name has no server prefix.
#[must_use]
pub fn split_qualified(qualified: &str) -> (Option<&str>, &str) {
    match qualified.split_once('.') {
        Some((server, tool)) => (Some(server), tool),
        None => (None, qualified),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_on_first_dot_only() {
        assert_eq!(split_qualified("lab.run"), (Some("lab"), "run"));
        assert_eq!(split_qualified("lab.run.v2"), (Some("lab"), "run.v2"));
        assert_eq!(split_qualified("run"), (None, "run"));
    }

    #[test]
    fn descriptor_accepts_snake_case_schema() {
        let tool: ToolDescriptor =
            serde_json::from_str(r#"{"name":"t","input_schema":{"type":"object"}}"#).unwrap();
        assert_eq!(tool.input_schema, json!({"type": "object"}));
        assert!(tool.description.is_none());

        let out = serde_json::to_value(tool.namespaced("lab")).unwrap();
        assert_eq!(out["name"], "lab.t");
        assert!(out.get("inputSchema").is_some());
    }
}
