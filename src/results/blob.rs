//! Blob storage for binary result files

use std::collections::HashMap;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Object storage receiving uploaded result files
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Upload `data` under `key` and return its public URL
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String>;
}

/// Object URL in bucket-subdomain form
///
/// `https://{bucket}.{endpoint_host}/{prefix}/{key}`
#[must_use]
pub fn object_url(endpoint: &str, bucket: &str, prefix: &str, key: &str) -> String {
    let host = endpoint
        .split_once("://")
        .map_or(endpoint, |(_, rest)| rest)
        .trim_end_matches('/');
    let path = object_path(prefix, key);
    format!("https://{bucket}.{host}/{path}")
}

fn object_path(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Uploads objects with an HTTP `PUT` to a bucket endpoint
#[derive(Debug, Clone)]
pub struct HttpBlobStorage {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    prefix: String,
    token: Option<SecretString>,
}

impl HttpBlobStorage {
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        token: Option<SecretString>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
            token,
        }
    }
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String> {
        let url = object_url(&self.endpoint, &self.bucket, &self.prefix, key);

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Storage(format!(
                "upload of {key} failed with status {}",
                resp.status()
            )));
        }

        tracing::debug!(key, url = %url, "uploaded result file");
        Ok(url)
    }
}

/// Keeps uploaded objects in memory
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    base_url: String,
}

impl MemoryBlobStorage {
    /// Create a store whose URLs start with `base_url`
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            base_url: base_url.into(),
        }
    }

    /// Bytes stored under `key`
    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn upload(&self, key: &str, data: Vec<u8>) -> Result<String> {
        self.objects.lock().await.insert(key.to_string(), data);
        Ok(format!("{}/{key}", self.base_url.trim_end_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_uses_bucket_subdomain() {
        assert_eq!(
            object_url("https://oss-cn-hangzhou.aliyuncs.com", "lab", "scp-data", "r_0_a.png"),
            "https://lab.oss-cn-hangzhou.aliyuncs.com/scp-data/r_0_a.png"
        );
        assert_eq!(
            object_url("storage.local/", "b", "", "k"),
            "https://b.storage.local/k"
        );
    }

    #[tokio::test]
    async fn memory_storage_keeps_bytes() {
        let storage = MemoryBlobStorage::new("mem://blobs/");
        let url = storage.upload("k", vec![1, 2, 3]).await.unwrap();
        assert_eq!(url, "mem://blobs/k");
        assert_eq!(storage.object("k").await, Some(vec![1, 2, 3]));
    }
}
