//! Result store bridge: append-only records with change notification

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::backend::{RESULT_TTL, ResultBackend};
use super::blob::BlobStorage;
use crate::{Error, Result};

/// Poll interval used when no notification channel is available
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Read and write access to result records
#[async_trait]
pub trait ResultBridge: Send + Sync {
    /// Append a payload to the record for `request_id`
    async fn put(&self, request_id: &str, payload: Value) -> Result<()>;

    /// Current record for `request_id`
    async fn get(&self, request_id: &str) -> Result<Option<Value>>;

    /// Notification channel fired on every write, when supported
    fn subscribe(&self, _request_id: &str) -> Option<broadcast::Receiver<Value>> {
        None
    }

    /// Wait until a record exists or `timeout` elapses
    ///
    /// Wakes on write notifications and also polls every two seconds so
    /// writes from other processes are seen.
    async fn wait_for(&self, request_id: &str, timeout: Duration) -> Result<Option<Value>> {
        let mut updates = self.subscribe(request_id);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(record) = self.get(request_id).await? {
                return Ok(Some(record));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = POLL_INTERVAL.min(deadline - now);

            let closed = match updates.as_mut() {
                Some(rx) => matches!(
                    tokio::time::timeout(nap, rx.recv()).await,
                    Ok(Err(broadcast::error::RecvError::Closed))
                ),
                None => {
                    tokio::time::sleep(nap).await;
                    false
                }
            };
            if closed {
                updates = None;
            }
        }
    }
}

/// Result store backed by a [`ResultBackend`]
///
/// Inline files are uploaded to blob storage before the payload is stored,
/// and every write is broadcast to local subscribers of the request id.
pub struct ResultStore {
    backend: Arc<dyn ResultBackend>,
    blobs: Option<Arc<dyn BlobStorage>>,
    ttl: Duration,
    watchers: Mutex<HashMap<String, broadcast::Sender<Value>>>,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("ttl", &self.ttl)
            .field("blobs", &self.blobs.is_some())
            .finish_non_exhaustive()
    }
}

impl ResultStore {
    #[must_use]
    pub fn new(backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            backend,
            blobs: None,
            ttl: RESULT_TTL,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Upload inline files to this storage
    #[must_use]
    pub fn with_blobs(mut self, blobs: Arc<dyn BlobStorage>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Override the record TTL
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace inline files under `result.data.files` with uploaded URLs
    ///
    /// Each inline file is `{"file": <base64>, "fileName": <name>}` and is
    /// stored as `{request_id}_{index}_{fileName}`. String entries are
    /// already references and are kept.
    ///
    /// # Errors
    ///
    /// Returns a validation error for undecodable files and a storage error
    /// if an upload fails or no blob storage is configured
    pub async fn externalize_files(&self, request_id: &str, payload: &mut Value) -> Result<()> {
        let Some(files) = payload
            .pointer_mut("/result/data/files")
            .and_then(Value::as_array_mut)
        else {
            return Ok(());
        };
        if files.iter().all(Value::is_string) {
            return Ok(());
        }

        let blobs = self
            .blobs
            .as_ref()
            .ok_or_else(|| Error::Storage("blob storage is not configured".to_string()))?;

        for (index, file) in files.iter_mut().enumerate() {
            if file.is_string() {
                continue;
            }
            let encoded = file
                .get("file")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation(format!("file {index} has no content")))?;
            let file_name = file
                .get("fileName")
                .and_then(Value::as_str)
                .unwrap_or("file");
            let data = STANDARD
                .decode(encoded)
                .map_err(|e| Error::Validation(format!("file {index} is not base64: {e}")))?;

            let key = format!("{request_id}_{index}_{file_name}");
            let url = blobs.upload(&key, data).await?;
            *file = Value::String(url);
        }
        Ok(())
    }

    fn notify(&self, request_id: &str, payload: &Value) {
        let Ok(mut watchers) = self.watchers.lock() else {
            return;
        };
        if let Some(tx) = watchers.get(request_id) {
            if tx.send(payload.clone()).is_err() {
                watchers.remove(request_id);
            }
        }
    }
}

#[async_trait]
impl ResultBridge for ResultStore {
    async fn put(&self, request_id: &str, mut payload: Value) -> Result<()> {
        self.externalize_files(request_id, &mut payload).await?;
        self.backend.append(request_id, payload.clone(), self.ttl).await?;
        tracing::debug!(request_id, "stored result");
        self.notify(request_id, &payload);
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<Value>> {
        self.backend.get(request_id).await
    }

    fn subscribe(&self, request_id: &str) -> Option<broadcast::Receiver<Value>> {
        let mut watchers = self.watchers.lock().ok()?;
        watchers.retain(|_, tx| tx.receiver_count() > 0);
        Some(
            watchers
                .entry(request_id.to_string())
                .or_insert_with(|| broadcast::channel(16).0)
                .subscribe(),
        )
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::results::{MemoryBackend, MemoryBlobStorage};

    fn store() -> ResultStore {
        ResultStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn put_put_get_appends() {
        let store = store();
        store.put("r", json!("A")).await.unwrap();
        store.put("r", json!("B")).await.unwrap();
        assert_eq!(store.get("r").await.unwrap(), Some(json!(["A", "B"])));
        assert_eq!(store.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn inline_files_are_uploaded() {
        let blobs = Arc::new(MemoryBlobStorage::new("mem://b"));
        let store = store().with_blobs(blobs.clone());

        let payload = json!({
            "requestId": "r1",
            "result": {"data": {"files": [
                {"file": STANDARD.encode(b"png"), "fileName": "plot.png"},
                "https://already/there"
            ]}}
        });
        store.put("r1", payload).await.unwrap();

        let record = store.get("r1").await.unwrap().unwrap();
        assert_eq!(
            record[0]["result"]["data"]["files"],
            json!(["mem://b/r1_0_plot.png", "https://already/there"])
        );
        assert_eq!(blobs.object("r1_0_plot.png").await, Some(b"png".to_vec()));
    }

    #[tokio::test]
    async fn inline_files_without_storage_fail() {
        let payload = json!({"result": {"data": {"files": [{"file": "AA==", "fileName": "x"}]}}});
        let err = store().put("r", payload).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_wakes_on_write() {
        let store = Arc::new(store());
        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.put("r", json!({"ok": true})).await.unwrap();
        });

        let started = Instant::now();
        let record = store.wait_for("r", Duration::from_secs(5)).await.unwrap();
        assert_eq!(record, Some(json!([{"ok": true}])));
        assert!(started.elapsed() < POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_unknown_id_times_out() {
        let record = store()
            .wait_for("unknown-id", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(record.is_none());
    }
}
