//! Shared fixtures for the unit and integration tests: upstream payloads
//! for the `jackal-1` chain and an in-memory object store with injectable
//! failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ChainDescriptor;
use crate::parser::Raw;
use crate::storage::ObjectStore;

pub(crate) fn descriptor(apis: &[&str]) -> ChainDescriptor {
    ChainDescriptor {
        chain_registry_name: "jackal".to_owned(),
        chain_id: "jackal-1".to_owned(),
        apis: apis.iter().map(|s| s.to_string()).collect(),
        batch_size: 20,
        step_size: 20,
        time_between_blocks_sec: 1.0,
        backfill_interval_sec: 1,
        request_timeout_sec: 1.0,
    }
}

pub(crate) fn block_fixture(height: i64, tx_count: usize) -> Value {
    json!({
        "block_id": { "hash": format!("hash-{height}") },
        "block": {
            "header": {
                "height": height.to_string(),
                "chain_id": "jackal-1",
                "time": "2023-01-10T20:10:23.341916097Z",
                "proposer_address": "8E8F72B0DF91B82CEA20A47C0DCB8B9B4E388AA0"
            },
            "data": {
                "txs": (0..tx_count).map(|i| json!(format!("b64tx{i}"))).collect::<Vec<_>>()
            }
        }
    })
}

pub(crate) fn tx_response_fixture(height: i64, txhash: &str, raw_log: &str) -> Value {
    json!({
        "txhash": txhash,
        "height": height.to_string(),
        "code": 0,
        "data": "0A1E0A1C",
        "info": "",
        "logs": [],
        "events": [],
        "raw_log": raw_log,
        "gas_used": "85432",
        "gas_wanted": "200000",
        "codespace": "",
        "timestamp": "2023-01-10T20:10:23Z",
        "tx": {
            "body": {
                "messages": [{
                    "@type": "/cosmos.bank.v1beta1.MsgSend",
                    "from_address": "jkl1abc",
                    "to_address": "jkl1def",
                    "amount": [{ "denom": "ujkl", "amount": "1000" }]
                }]
            }
        }
    })
}

pub(crate) fn transfer_log() -> Value {
    json!([{
        "events": [
            {
                "type": "transfer",
                "attributes": [
                    { "key": "recipient", "value": "jkl1def" },
                    { "key": "amount", "value": "1000ujkl" }
                ]
            },
            {
                "type": "coin.received",
                "attributes": [ { "key": "receiver-addr" } ]
            }
        ]
    }])
}

/// A fully-parsed single-tx height with consistent tx counts.
pub(crate) fn raw_fixture(height: i64) -> Raw {
    let mut raw = Raw::default();
    raw.parse_block(block_fixture(height, 1)).unwrap();
    raw.parse_tx_responses(vec![tx_response_fixture(
        height,
        &format!("TX{height}"),
        &transfer_log().to_string(),
    )])
    .unwrap();
    raw
}

/// In-memory object store. Fails the first `fail_first` puts, then stores.
pub(crate) struct MockObjectStore {
    fail_first: usize,
    pub attempts: AtomicUsize,
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(fail_first: usize) -> Self {
        Self {
            fail_first,
            attempts: AtomicUsize::new(0),
            objects: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(anyhow!("injected failure on attempt {attempt}"));
        }
        self.objects.lock().unwrap().insert(key.to_owned(), bytes);
        Ok(())
    }
}
