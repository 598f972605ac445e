use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::db::Store;
use crate::metrics::Metrics;
use crate::parser::Raw;
use crate::storage::{block_key, tx_key, BlobSink};

/// The single write path: every `Raw` produced by the live tail or the
/// backfiller goes through `persist` exactly once.
pub struct Persister {
    store: Store,
    blobs: BlobSink,
    registry_name: String,
    metrics: Metrics,
}

impl Persister {
    pub fn new(store: Store, blobs: BlobSink, registry_name: String, metrics: Metrics) -> Self {
        Self {
            store,
            blobs,
            registry_name,
            metrics,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Drive the relational upsert and both blob uploads concurrently and
    /// report their conjunction. The three paths are independent: a failed
    /// blob does not roll back the transaction — the dataset is repaired by
    /// the backfill sweeps, and blobs are best-effort cold storage.
    pub async fn persist(&self, raw: &Raw) -> bool {
        let Some((chain_id, height)) = raw.primary_key() else {
            warn!(
                height = ?raw.height,
                chain_id = ?raw.chain_id,
                "refusing to persist raw without its primary key"
            );
            return false;
        };

        let db = async {
            let started = Instant::now();
            match self.store.upsert_raw(raw).await {
                Ok(()) => {
                    self.metrics.record_upsert_time(started.elapsed());
                    true
                }
                Err(e) => {
                    error!(height, chain_id, error = %e, "db upsert failed");
                    false
                }
            }
        };

        let block_blob = async {
            match &raw.raw_block {
                Some(block) => {
                    let key = block_key(&self.registry_name, chain_id, height);
                    self.blobs.put_json(&key, block).await
                }
                None => true,
            }
        };

        let tx_blob = async {
            match &raw.raw_tx {
                Some(txs) => {
                    let key = tx_key(&self.registry_name, chain_id, height);
                    self.blobs.put_json(&key, &Value::Array(txs.clone())).await
                }
                None => true,
            }
        };

        let (db_ok, block_ok, tx_ok) = tokio::join!(db, block_blob, tx_blob);
        let ok = db_ok && block_ok && tx_ok;
        if ok {
            self.metrics.record_height_persisted();
        } else {
            self.metrics.record_persist_failed();
        }
        debug!(height, chain_id, db_ok, block_ok, tx_ok, "persist finished");
        ok
    }
}
