//! Object storage existence checks.
//!
//! The artifact resolver only needs to know whether something exists under a
//! bucket and path; reading and writing objects is left to the task runners.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage request failed: {0}")]
    Request(String),

    #[error("Unexpected storage response {status}: {body}")]
    Response { status: u16, body: String },
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Request(err.to_string())
    }
}

#[async_trait]
pub trait StorageService: Send + Sync {
    /// Whether an object exists at `path` or under the directory `path/`.
    async fn exists(&self, bucket: &str, path: &str) -> Result<bool, StorageError>;
}

/// S3-compatible storage probed with ListObjectsV2.
#[derive(Clone)]
pub struct HttpStorage {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpStorage {
    pub fn new(endpoint: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

impl HttpStorage {
    /// ListObjectsV2 response body for at most one key under `prefix`.
    async fn list_one(&self, bucket: &str, prefix: &str) -> Result<Option<String>, StorageError> {
        let response = self
            .client
            .get(format!("{}/{}", self.endpoint, bucket))
            .query(&[("list-type", "2"), ("prefix", prefix), ("max-keys", "1")])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.text().await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StorageError::Response {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

#[async_trait]
impl StorageService for HttpStorage {
    async fn exists(&self, bucket: &str, path: &str) -> Result<bool, StorageError> {
        let path = path.trim_end_matches('/');

        let directory = format!("{}/", path);
        if let Some(body) = self.list_one(bucket, &directory).await? {
            if key_count(&body) > 0 {
                return Ok(true);
            }
        }

        // The exact key sorts before any sibling sharing its prefix.
        Ok(self
            .list_one(bucket, path)
            .await?
            .is_some_and(|body| first_key(&body) == Some(path)))
    }
}

/// Read `<KeyCount>` from a ListObjectsV2 response; falls back to counting
/// `<Key>` elements for servers that omit it.
fn key_count(body: &str) -> usize {
    if let Some(start) = body.find("<KeyCount>") {
        let rest = &body[start + "<KeyCount>".len()..];
        if let Some(end) = rest.find("</KeyCount>") {
            if let Ok(count) = rest[..end].trim().parse() {
                return count;
            }
        }
    }
    body.matches("<Key>").count()
}

fn first_key(body: &str) -> Option<&str> {
    let start = body.find("<Key>")? + "<Key>".len();
    let end = body[start..].find("</Key>")?;
    Some(&body[start..start + end])
}

/// In-memory storage holding a set of (bucket, path) objects.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashSet<(String, String)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, bucket: &str, path: &str) {
        self.objects
            .write()
            .await
            .insert((bucket.to_string(), path.to_string()));
    }
}

#[async_trait]
impl StorageService for MemoryStorage {
    async fn exists(&self, bucket: &str, path: &str) -> Result<bool, StorageError> {
        let path = path.trim_end_matches('/');
        Ok(self
            .objects
            .read()
            .await
            .iter()
            .any(|(b, p)| {
                b == bucket
                    && (p == path
                        || p.strip_prefix(path)
                            .is_some_and(|rest| rest.starts_with('/')))
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_count() {
        let body = "<ListBucketResult><Name>b</Name><KeyCount>1</KeyCount>\
                    <Contents><Key>p/dcm/1.dcm</Key></Contents></ListBucketResult>";
        assert_eq!(key_count(body), 1);
        assert_eq!(key_count("<ListBucketResult><KeyCount>0</KeyCount></ListBucketResult>"), 0);
        assert_eq!(key_count("<Contents><Key>a</Key></Contents>"), 1);
        assert_eq!(key_count(""), 0);
    }

    #[tokio::test]
    async fn test_memory_storage_prefix_match() {
        let storage = MemoryStorage::new();
        storage.put("bucket", "p1/dcm/image.dcm").await;

        assert!(storage.exists("bucket", "p1/dcm").await.unwrap());
        assert!(!storage.exists("bucket", "p2/dcm").await.unwrap());
        assert!(!storage.exists("other", "p1/dcm").await.unwrap());
        assert!(storage.exists("bucket", "p1/dcm/image.dcm").await.unwrap());
        assert!(storage.exists("bucket", "p1/dcm/").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_storage_sibling_is_not_a_match() {
        let storage = MemoryStorage::new();
        storage.put("bucket", "p1/dcmx/image.dcm").await;
        storage.put("bucket", "p1/report.pdf.bak").await;

        assert!(!storage.exists("bucket", "p1/dcm").await.unwrap());
        assert!(!storage.exists("bucket", "p1/report.pdf").await.unwrap());
        assert!(storage.exists("bucket", "p1/dcmx").await.unwrap());
    }

    #[test]
    fn test_first_key() {
        let body = "<ListBucketResult><KeyCount>1</KeyCount>\
                    <Contents><Key>p1/dcm</Key></Contents></ListBucketResult>";
        assert_eq!(first_key(body), Some("p1/dcm"));
        assert_eq!(first_key("<ListBucketResult></ListBucketResult>"), None);
    }
}
