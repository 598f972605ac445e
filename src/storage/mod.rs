use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use serde_json::Value;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tracing::error;

use crate::config::StorageSettings;
use crate::metrics::Metrics;

const UPLOAD_ATTEMPTS: usize = 5;
const UPLOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Flat key-value bucket. A trait seam so tests can inject failures without
/// a real bucket behind them.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
}

pub struct S3Store {
    bucket: Bucket,
}

impl S3Store {
    pub fn new(settings: &StorageSettings) -> Result<Self> {
        if let Some(path) = &settings.object_store_credentials_path {
            std::env::set_var("AWS_SHARED_CREDENTIALS_FILE", path);
        }
        let credentials = Credentials::default()
            .map_err(|e| anyhow!("loading object store credentials: {e}"))?;
        let bucket = match &settings.endpoint {
            // S3-compatible stores (minio in the test harness) want
            // path-style addressing.
            Some(endpoint) => Bucket::new(
                &settings.bucket_name,
                Region::Custom {
                    region: settings.region.clone(),
                    endpoint: endpoint.clone(),
                },
                credentials,
            )?
            .with_path_style(),
            None => Bucket::new(
                &settings.bucket_name,
                settings
                    .region
                    .parse()
                    .map_err(|e| anyhow!("invalid region {:?}: {e}", settings.region))?,
                credentials,
            )?,
        };
        Ok(Self { bucket })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let response = self.bucket.put_object(key, &bytes).await?;
        let status = response.status_code();
        if (200..300).contains(&status) {
            Ok(())
        } else {
            Err(anyhow!("object store returned status {status} for {key}"))
        }
    }
}

/// Raw-payload archival. Uploads are idempotent (same key overwrites), so a
/// failed attempt can simply be retried in place.
#[derive(Clone)]
pub struct BlobSink {
    store: Arc<dyn ObjectStore>,
    metrics: Metrics,
}

impl BlobSink {
    pub fn new(store: Arc<dyn ObjectStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    /// Serialize `payload` once and upload it, retrying on a fixed 1-second
    /// interval. `false` only when every attempt failed.
    pub async fn put_json(&self, key: &str, payload: &Value) -> bool {
        let bytes = match serde_json::to_vec(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(key, error = %e, "unserializable blob payload");
                return false;
            }
        };

        let started = Instant::now();
        let strategy = FixedInterval::new(UPLOAD_RETRY_DELAY).take(UPLOAD_ATTEMPTS - 1);
        let result = Retry::spawn(strategy, || {
            let bytes = bytes.clone();
            async move { self.store.put(key, bytes).await }
        })
        .await;

        match result {
            Ok(()) => {
                self.metrics.record_blob_upload_time(started.elapsed());
                true
            }
            Err(e) => {
                error!(
                    key,
                    error = %e,
                    "blob upload failed after {UPLOAD_ATTEMPTS} attempts"
                );
                self.metrics.record_blob_upload_failed();
                false
            }
        }
    }
}

pub fn block_key(registry_name: &str, chain_id: &str, height: i64) -> String {
    format!("{registry_name}/{chain_id}/blocks/{height}.json")
}

pub fn tx_key(registry_name: &str, chain_id: &str, height: i64) -> String {
    format!("{registry_name}/{chain_id}/txs/{height}.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::MockObjectStore;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[test]
    fn blob_keys_are_deterministic() {
        assert_eq!(
            block_key("jackal", "jackal-1", 2316140),
            "jackal/jackal-1/blocks/2316140.json"
        );
        assert_eq!(
            tx_key("jackal", "jackal-1", 2316140),
            "jackal/jackal-1/txs/2316140.json"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn upload_succeeds_on_fifth_attempt() {
        let store = Arc::new(MockObjectStore::failing(4));
        let sink = BlobSink::new(store.clone(), Metrics::new());

        assert!(sink.put_json("k", &json!({"height": 1})).await);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 5);
        assert_eq!(
            store.objects.lock().unwrap().get("k").unwrap(),
            &serde_json::to_vec(&json!({"height": 1})).unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn upload_gives_up_after_five_attempts() {
        let store = Arc::new(MockObjectStore::failing(usize::MAX));
        let sink = BlobSink::new(store.clone(), Metrics::new());

        assert!(!sink.put_json("k", &json!({"height": 1})).await);
        assert_eq!(store.attempts.load(Ordering::SeqCst), 5);
        assert!(store.objects.lock().unwrap().is_empty());
    }
}
