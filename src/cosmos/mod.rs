use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ChainDescriptor;

const BLOCKS_ENDPOINT: &str = "/cosmos/base/tendermint/v1beta1/blocks";
const TXS_ENDPOINT: &str = "/cosmos/tx/v1beta1/txs/block";

/// REST client for one chain, backed by an ordered list of API endpoints.
/// Failed requests rotate to the next endpoint; each operation tries every
/// endpoint at most once and reports `None` when all of them fail, leaving
/// the retry decision to the caller.
#[derive(Debug)]
pub struct CosmosChain {
    client: Client,
    descriptor: ChainDescriptor,
    current_api: AtomicUsize,
}

impl CosmosChain {
    pub fn new(descriptor: ChainDescriptor) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(descriptor.request_timeout_sec))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            descriptor,
            current_api: AtomicUsize::new(0),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.descriptor.chain_id
    }

    pub fn registry_name(&self) -> &str {
        &self.descriptor.chain_registry_name
    }

    pub fn descriptor(&self) -> &ChainDescriptor {
        &self.descriptor
    }

    /// GET `path` against the current endpoint, rotating on failure until
    /// every endpoint has been tried once.
    async fn get_json(&self, path: &str) -> Option<Value> {
        let apis = &self.descriptor.apis;
        if apis.is_empty() {
            warn!(chain_id = %self.descriptor.chain_id, "no API endpoints configured");
            return None;
        }

        for _ in 0..apis.len() {
            let index = self.current_api.load(Ordering::Relaxed) % apis.len();
            let url = format!("{}{}", apis[index].trim_end_matches('/'), path);

            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.json::<Value>().await {
                        Ok(body) => return Some(body),
                        Err(e) => {
                            warn!(%url, error = %e, "unparseable response body, rotating endpoint");
                        }
                    }
                }
                Ok(response) => {
                    debug!(%url, status = %response.status(), "non-success response, rotating endpoint");
                }
                Err(e) => {
                    warn!(%url, error = %e, "request failed, rotating endpoint");
                }
            }
            self.current_api.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Fetch the block at `height`, or the chain tip when `height` is None.
    pub async fn get_block(&self, height: Option<i64>) -> Option<Value> {
        let path = match height {
            Some(height) => format!("{BLOCKS_ENDPOINT}/{height}"),
            None => format!("{BLOCKS_ENDPOINT}/latest"),
        };
        self.get_json(&path).await
    }

    /// Fetch the tx-responses envelope for `height`. The envelope may lack
    /// `tx_responses` entirely; callers decide what that means.
    pub async fn get_block_txs(&self, height: i64) -> Option<Value> {
        self.get_json(&format!("{TXS_ENDPOINT}/{height}")).await
    }

    pub async fn get_latest_height(&self) -> Option<i64> {
        let block = self.get_block(None).await?;
        block
            .pointer("/block/header/height")
            .and_then(Value::as_str)
            .and_then(|h| h.parse().ok())
    }

    /// The earliest height any endpoint will serve. Pruning nodes reject
    /// height 1 with a message naming their lowest height; a node that
    /// serves height 1 is an archive node.
    pub async fn get_lowest_height(&self) -> i64 {
        let apis = &self.descriptor.apis;
        for api in apis {
            let url = format!("{}{BLOCKS_ENDPOINT}/1", api.trim_end_matches('/'));
            let response = match self.client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(%url, error = %e, "request failed while probing lowest height");
                    continue;
                }
            };
            if response.status().is_success() {
                return 1;
            }
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(_) => continue,
            };
            if let Some(lowest) = body
                .get("message")
                .and_then(Value::as_str)
                .and_then(parse_lowest_height)
            {
                return lowest;
            }
        }
        warn!(chain_id = %self.descriptor.chain_id, "could not determine lowest height, assuming 1");
        1
    }
}

/// Extract N from the node error "... lowest height is N".
fn parse_lowest_height(message: &str) -> Option<i64> {
    let rest = message.split("lowest height is").nth(1)?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
