//! JSON-RPC 2.0 envelopes for event-stream workers

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC request id, a string or an integer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// Outgoing request
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    #[must_use]
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: RequestId::Number(id),
            method: method.into(),
            params,
        }
    }
}

/// Error object of a failed call
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

/// Incoming response, success or error
#[derive(Debug, Clone, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// Find the response to `id` in a response body
///
/// The body is either a plain JSON response or an event stream whose
/// `data:` lines carry JSON messages. Notifications and responses to other
/// ids are skipped.
#[must_use]
pub fn find_response(body: &str, id: &RequestId) -> Option<RpcResponse> {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<RpcResponse>(trimmed)
            .ok()
            .filter(|r| r.id.as_ref().is_none_or(|rid| rid == id));
    }

    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<RpcResponse>(data.trim()).ok())
        .find(|r| r.id.as_ref() == Some(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_json_response() {
        let body = r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#;
        let resp = find_response(body, &RequestId::Number(3)).unwrap();
        assert!(resp.result.is_some());
        assert!(find_response(body, &RequestId::Number(4)).is_none());
    }

    #[test]
    fn event_stream_response_skips_notifications() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":7,\"error\":{\"code\":-32601,\"message\":\"Method not found\"}}\n\n";
        let resp = find_response(body, &RequestId::Number(7)).unwrap();
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[test]
    fn request_serializes_without_empty_params() {
        let req = serde_json::to_value(RpcRequest::new(1, "tools/list", None)).unwrap();
        assert_eq!(req["jsonrpc"], "2.0");
        assert_eq!(req["id"], 1);
        assert!(req.get("params").is_none());
    }
}
