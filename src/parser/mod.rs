use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::db::models::{Block, Log, Message, Tx};

/// The parser's only error: tx rows are keyed by `(chain_id, height)`, so
/// nothing can be built from a payload that does not yield the primary key.
/// Every other upstream defect degrades in place — flagged log rows, field
/// fallbacks — instead of failing the height.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("block primary key (chain_id, height) is not set")]
    BlockPrimaryKeyNotDefined,
}

/// Narrow view of the upstream block shape. Everything we do not read is
/// left in the raw payload.
#[derive(Debug, Deserialize)]
struct UpstreamBlock {
    block_id: UpstreamBlockId,
    block: UpstreamBlockBody,
}

#[derive(Debug, Deserialize)]
struct UpstreamBlockId {
    #[serde(default)]
    hash: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamBlockBody {
    header: UpstreamHeader,
    #[serde(default)]
    data: UpstreamBlockData,
}

#[derive(Debug, Deserialize)]
struct UpstreamHeader {
    height: String,
    chain_id: String,
    time: String,
    #[serde(default)]
    proposer_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamBlockData {
    #[serde(default)]
    txs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct UpstreamTxResponse {
    txhash: String,
    #[serde(default)]
    height: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: String,
    #[serde(default)]
    info: String,
    #[serde(default)]
    logs: Value,
    #[serde(default)]
    events: Value,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    gas_used: String,
    #[serde(default)]
    gas_wanted: String,
    #[serde(default)]
    codespace: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    tx: Value,
}

/// Per-height work item: the verbatim upstream payloads plus everything
/// parsed out of them. Built by the live tail or a backfill fetch, handed to
/// the persister once, then discarded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Raw {
    pub height: Option<i64>,
    pub chain_id: Option<String>,

    pub raw_block: Option<Value>,
    pub raw_tx: Option<Vec<Value>>,

    pub block_tx_count: Option<i64>,
    pub tx_responses_tx_count: Option<i64>,

    pub block: Option<Block>,
    pub txs: Vec<Tx>,

    pub logs: Vec<Log>,
    pub log_columns: BTreeSet<(String, String)>,

    pub messages: Vec<Message>,
    pub message_columns: BTreeSet<String>,
}

impl Raw {
    /// A `Raw` is persistable iff both primary-key halves are present.
    pub fn primary_key(&self) -> Option<(&str, i64)> {
        match (self.chain_id.as_deref(), self.height) {
            (Some(chain_id), Some(height)) => Some((chain_id, height)),
            _ => None,
        }
    }

    pub fn parse_block(&mut self, raw_block: Value) -> Result<(), ParseError> {
        let upstream: UpstreamBlock = match serde_json::from_value(raw_block.clone()) {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(error = %e, "undecodable block payload");
                return Err(ParseError::BlockPrimaryKeyNotDefined);
            }
        };

        let Ok(height) = upstream.block.header.height.parse::<i64>() else {
            warn!(value = %upstream.block.header.height, "block height is not an integer");
            return Err(ParseError::BlockPrimaryKeyNotDefined);
        };
        let Some(time) = parse_block_time(&upstream.block.header.time) else {
            warn!(value = %upstream.block.header.time, "unparseable block time");
            return Err(ParseError::BlockPrimaryKeyNotDefined);
        };

        self.raw_block = Some(raw_block);
        self.block_tx_count = Some(upstream.block.data.txs.len() as i64);
        self.chain_id = Some(upstream.block.header.chain_id.clone());
        self.height = Some(height);
        self.block = Some(Block {
            chain_id: upstream.block.header.chain_id,
            height,
            time,
            block_hash: upstream.block_id.hash,
            proposer_address: upstream.block.header.proposer_address,
        });
        Ok(())
    }

    /// Parse the tx-responses envelope contents into `Tx`/`Log`/`Message`
    /// rows. The block primary key must already be present: tx rows carry
    /// `(chain_id, height)` and are meaningless without it.
    ///
    /// A response entry that cannot be decoded degrades the way a non-JSON
    /// raw_log does — one flagged log row, the rest of the batch intact —
    /// and unparseable scalar fields fall back in place, so a bad entry can
    /// never wedge a height in the repair sweep.
    pub fn parse_tx_responses(&mut self, raw_tx_responses: Vec<Value>) -> Result<(), ParseError> {
        let (chain_id, block_height) = self
            .primary_key()
            .map(|(c, h)| (c.to_owned(), h))
            .ok_or(ParseError::BlockPrimaryKeyNotDefined)?;

        // The count covers every entry the envelope carried, flagged ones
        // included, so a repaired height converges out of the cursor.
        self.tx_responses_tx_count = Some(raw_tx_responses.len() as i64);

        for response in &raw_tx_responses {
            let up: UpstreamTxResponse = match serde_json::from_value(response.clone()) {
                Ok(up) => up,
                Err(e) => {
                    warn!(height = block_height, error = %e, "undecodable tx response entry");
                    let txhash = response
                        .get("txhash")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    self.logs.push(Log::failed(txhash, &e.to_string()));
                    continue;
                }
            };

            let height = up.height.parse().unwrap_or_else(|_| {
                if !up.height.is_empty() {
                    warn!(txhash = %up.txhash, value = %up.height, "tx height is not an integer, using block height");
                }
                block_height
            });
            let timestamp = match DateTime::parse_from_rfc3339(&up.timestamp) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(_) => {
                    if !up.timestamp.is_empty() {
                        warn!(txhash = %up.txhash, value = %up.timestamp, "unparseable tx timestamp");
                    }
                    None
                }
            };

            self.txs.push(Tx {
                txhash: up.txhash.clone(),
                chain_id: chain_id.clone(),
                height,
                code: up.code.to_string(),
                data: up.data,
                info: up.info,
                logs: up.logs,
                events: up.events,
                raw_log: up.raw_log.clone(),
                gas_used: parse_amount(&up.gas_used, "gas_used", &up.txhash),
                gas_wanted: parse_amount(&up.gas_wanted, "gas_wanted", &up.txhash),
                codespace: up.codespace,
                timestamp,
                tx: up.tx.clone(),
            });

            let logs = parse_logs(&up.raw_log, &up.txhash);
            for log in &logs {
                self.log_columns.extend(log.columns().cloned());
            }
            self.logs.extend(logs);

            let messages = parse_messages(&up.tx, &up.txhash);
            for message in &messages {
                self.message_columns.extend(message.columns().cloned());
            }
            self.messages.extend(messages);
        }

        self.raw_tx = Some(raw_tx_responses);
        Ok(())
    }
}

/// Parse a transaction's raw_log into per-message logs. A raw_log that is
/// not valid JSON (the chain emits free-text errors like "out of gas") is
/// captured verbatim as a single failed log, never an error.
pub fn parse_logs(raw_log: &str, txhash: &str) -> Vec<Log> {
    let parsed: Value = match serde_json::from_str(raw_log) {
        Ok(value) => value,
        Err(_) => return vec![Log::failed(txhash, raw_log)],
    };

    let entries = match parsed.as_array() {
        Some(entries) => entries,
        None => return Vec::new(),
    };

    entries
        .iter()
        .enumerate()
        .map(|(msg_index, entry)| {
            let mut log = Log {
                txhash: txhash.to_owned(),
                msg_index: msg_index.to_string(),
                ..Default::default()
            };
            for event in entry
                .get("events")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                // Later events with the same (type, key) replace earlier
                // ones within a message.
                log.event_attributes.extend(parse_log_event(event));
            }
            log
        })
        .collect()
}

/// One event's attributes. `wasm` events are noisy and contract-defined, so
/// only `contract_address` is kept for them; every other event type keeps
/// all `(type, key) -> value` pairs.
fn parse_log_event(event: &Value) -> BTreeMap<(String, String), Vec<String>> {
    let mut out: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    let event_type = match event.get("type").and_then(Value::as_str) {
        Some(event_type) => event_type,
        None => return out,
    };

    for attr in event
        .get("attributes")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let key = match attr.get("key").and_then(Value::as_str) {
            Some(key) => key,
            None => continue,
        };
        if event_type == "wasm" && key != "contract_address" {
            continue;
        }
        let value = attr.get("value").and_then(Value::as_str).unwrap_or("");
        out.entry((fix_entry(event_type), fix_entry(key)))
            .or_default()
            .push(fix_entry(value));
    }
    out
}

/// Split a tx body into messages: `@type` becomes the message type, the
/// remaining keys its attributes.
pub fn parse_messages(tx: &Value, txhash: &str) -> Vec<Message> {
    let messages = match tx.pointer("/body/messages").and_then(Value::as_array) {
        Some(messages) => messages,
        None => return Vec::new(),
    };

    messages
        .iter()
        .enumerate()
        .filter_map(|(i, msg)| {
            let obj = msg.as_object()?;
            let type_url = obj
                .get("@type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let attributes = obj
                .iter()
                .filter(|(key, _)| key.as_str() != "@type")
                .map(|(key, value)| (fix_entry(key), value.clone()))
                .collect();
            Some(Message {
                txhash: txhash.to_owned(),
                msg_index: i.to_string(),
                type_url,
                attributes,
            })
        })
        .collect()
}

/// Normalize a name so it is usable as a postgres column: `.`, `/` and `-`
/// become `_`, `@` is dropped.
pub fn fix_entry(s: &str) -> String {
    s.chars()
        .filter_map(|c| match c {
            '.' | '/' | '-' => Some('_'),
            '@' => None,
            other => Some(other),
        })
        .collect()
}

/// Gas fields arrive as decimal strings; anything unparseable counts as 0.
fn parse_amount(value: &str, field: &'static str, txhash: &str) -> i64 {
    match value.parse() {
        Ok(amount) => amount,
        Err(_) => {
            if !value.is_empty() {
                warn!(txhash, field, value, "unparseable amount, defaulting to 0");
            }
            0
        }
    }
}

/// Block header times carry nanosecond precision; the store keeps
/// microseconds, so the fraction is truncated to 6 digits before parsing.
fn parse_block_time(value: &str) -> Option<DateTime<Utc>> {
    let truncated = truncate_fraction(value, 6);
    DateTime::parse_from_rfc3339(&truncated)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn truncate_fraction(value: &str, digits: usize) -> String {
    let Some(dot) = value.find('.') else {
        return value.to_owned();
    };
    let frac_start = dot + 1;
    let frac_end = value[frac_start..]
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| frac_start + i)
        .unwrap_or(value.len());
    let keep = (frac_end - frac_start).min(digits);
    if keep == 0 {
        format!("{}{}", &value[..dot], &value[frac_end..])
    } else {
        format!(
            "{}.{}{}",
            &value[..dot],
            &value[frac_start..frac_start + keep],
            &value[frac_end..]
        )
    }
}
