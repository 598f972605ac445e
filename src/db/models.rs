use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub chain_id: String,
    pub height: i64,
    pub time: DateTime<Utc>,
    pub block_hash: String,
    pub proposer_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub txhash: String,
    pub chain_id: String,
    pub height: i64,
    pub code: String,
    pub data: String,
    pub info: String,
    pub logs: Value,
    pub events: Value,
    pub raw_log: String,
    pub gas_used: i64,
    pub gas_wanted: i64,
    pub codespace: String,
    /// NULL when the upstream timestamp was absent or unparseable.
    pub timestamp: Option<DateTime<Utc>>,
    pub tx: Value,
}

/// Event attributes of one message of a transaction, keyed by
/// `(event type, attribute key)`. Serialized to the `logs.parsed` column as
/// `{"{event}_{attr}": [values]}`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Log {
    pub txhash: String,
    pub msg_index: String,
    pub event_attributes: BTreeMap<(String, String), Vec<String>>,
    pub failed: bool,
    pub failed_msg: Option<String>,
}

impl Log {
    /// A log stub for a raw_log that was not valid JSON.
    pub fn failed(txhash: &str, raw_log: &str) -> Self {
        Self {
            txhash: txhash.to_owned(),
            msg_index: "0".to_owned(),
            failed: true,
            failed_msg: Some(raw_log.to_owned()),
            ..Default::default()
        }
    }

    /// `(event, attribute)` pairs this log contributes to the column registry.
    pub fn columns(&self) -> impl Iterator<Item = &(String, String)> {
        self.event_attributes.keys()
    }

    /// Flatten the attribute map into the stored JSON shape.
    pub fn dump(&self) -> Value {
        let mut out = serde_json::Map::new();
        for ((event, attr), values) in &self.event_attributes {
            let entry = out
                .entry(format!("{event}_{attr}"))
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.extend(values.iter().cloned().map(Value::String));
            }
        }
        Value::Object(out)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub txhash: String,
    pub msg_index: String,
    pub type_url: String,
    pub attributes: serde_json::Map<String, Value>,
}

impl Message {
    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.attributes.keys()
    }
}
