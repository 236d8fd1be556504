//! Result access through the hub's HTTP API

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::store::ResultBridge;
use crate::{Error, Result};

/// Reads and writes results via `GET /get_server_result/{id}` and
/// `POST /set_result/` on a hub
///
/// The hub reads the request id from the posted body, so an object payload
/// is stored with a `requestId` field added, and any other payload is stored
/// as `{"requestId": id, "result": payload}`. Readers see the stored form.
///
/// Waiting falls back to polling since no notifications cross the process
/// boundary.
#[derive(Debug, Clone)]
pub struct HubResultClient {
    client: reqwest::Client,
    hub_url: String,
}

impl HubResultClient {
    #[must_use]
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            hub_url: hub_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Hub URL with the given path segments appended, each escaped
    fn endpoint(&self, segments: &[&str]) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.hub_url)
            .map_err(|e| Error::Config(format!("invalid hub url {}: {e}", self.hub_url)))?;
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("hub url {} cannot take a path", self.hub_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ResultBridge for HubResultClient {
    async fn put(&self, request_id: &str, payload: Value) -> Result<()> {
        let body = match payload {
            Value::Object(mut map) => {
                map.insert("requestId".to_string(), Value::String(request_id.to_string()));
                Value::Object(map)
            }
            other => serde_json::json!({ "requestId": request_id, "result": other }),
        };

        let resp = self
            .client
            .post(self.endpoint(&["set_result", ""])?)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Storage(format!("hub rejected result ({status}): {text}")));
        }
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<Value>> {
        let resp = self
            .client
            .get(self.endpoint(&["get_server_result", request_id])?)
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(resp.json().await?)),
            s => Err(Error::Storage(format!("hub result lookup failed with status {s}"))),
        }
    }
}
