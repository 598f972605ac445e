use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{fetch_raw, Persister};
use crate::cosmos::CosmosChain;
use crate::db::WrongTxCount;
use crate::parser::Raw;

/// Repairs the dataset behind the live tail with two sweeps: the historical
/// sweep fills height gaps down to the chain's pruning window, the repair
/// sweep re-fetches heights whose tx counts disagree. Both terminate when
/// their cursor is empty and re-run after a sleep.
#[derive(Clone)]
pub struct Backfiller {
    chain: Arc<CosmosChain>,
    persister: Arc<Persister>,
    shutdown: watch::Receiver<bool>,
}

impl Backfiller {
    pub fn new(
        chain: Arc<CosmosChain>,
        persister: Arc<Persister>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chain,
            persister,
            shutdown,
        }
    }

    pub async fn run_historical(mut self) -> Result<()> {
        let interval = Duration::from_secs(self.chain.descriptor().backfill_interval_sec);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep_historical().await {
                error!(chain_id = %self.chain.chain_id(), error = %e, "historical sweep failed");
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!(chain_id = %self.chain.chain_id(), "historical backfill stopped");
        Ok(())
    }

    pub async fn run_wrong_count(mut self) -> Result<()> {
        let interval = Duration::from_secs(self.chain.descriptor().backfill_interval_sec);
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep_wrong_count().await {
                error!(chain_id = %self.chain.chain_id(), error = %e, "repair sweep failed");
            }
            tokio::select! {
                _ = sleep(interval) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        info!(chain_id = %self.chain.chain_id(), "repair backfill stopped");
        Ok(())
    }

    /// One pass over the missing-blocks cursor: expand each gap into the
    /// heights it hides, then fetch and persist them in bounded batches.
    async fn sweep_historical(&self) -> Result<()> {
        let chain_id = self.chain.chain_id().to_owned();
        let store = self.persister.store();

        let gaps = store
            .missing_blocks_cursor(&chain_id)
            .try_collect::<Vec<_>>()
            .await?;
        if gaps.is_empty() {
            return Ok(());
        }

        // The pruning window is only probed when a gap reaches below the
        // lowest persisted row.
        let lowest = if gaps.iter().any(|g| g.difference_per_block == -1) {
            self.chain.get_lowest_height().await
        } else {
            0
        };

        let mut heights: Vec<i64> = Vec::new();
        for gap in &gaps {
            heights.extend(gap_range(gap.height, gap.difference_per_block, lowest));
        }
        if heights.is_empty() {
            return Ok(());
        }
        info!(%chain_id, count = heights.len(), "backfilling missing heights");

        let descriptor = self.chain.descriptor();
        for chunk in heights.chunks(descriptor.step_size.max(1)) {
            futures::stream::iter(chunk.iter().copied())
                .map(|height| {
                    let chain = Arc::clone(&self.chain);
                    let persister = Arc::clone(&self.persister);
                    async move {
                        match get_data_historical(&chain, height).await {
                            Some(raw) => {
                                persister.persist(&raw).await;
                            }
                            None => warn!(height, "no historical data for height"),
                        }
                    }
                })
                .buffer_unordered(descriptor.batch_size.max(1))
                .collect::<Vec<_>>()
                .await;

            if *self.shutdown.borrow() {
                break;
            }
        }
        Ok(())
    }

    /// One pass over the wrong-count cursor, drained in step-size chunks.
    /// Re-persisting refreshes `tx_tx_count` and inserts the tx rows, so a
    /// repaired height drops out of the cursor on the next pass.
    async fn sweep_wrong_count(&self) -> Result<()> {
        let chain_id = self.chain.chain_id().to_owned();
        let descriptor = self.chain.descriptor();
        let store = self.persister.store();

        let mut chunks = store
            .wrong_tx_count_cursor(&chain_id)
            .chunks(descriptor.step_size.max(1));

        while let Some(chunk) = chunks.next().await {
            let rows: Vec<WrongTxCount> = chunk.into_iter().collect::<sqlx::Result<_>>()?;
            futures::stream::iter(rows)
                .map(|row| {
                    let chain = Arc::clone(&self.chain);
                    let persister = Arc::clone(&self.persister);
                    async move {
                        match repair_height(&chain, &row).await {
                            Some(raw) => {
                                persister.persist(&raw).await;
                            }
                            None => warn!(height = row.height, "could not re-fetch txs"),
                        }
                    }
                })
                .buffer_unordered(descriptor.batch_size.max(1))
                .collect::<Vec<_>>()
                .await;

            if *self.shutdown.borrow() {
                break;
            }
        }
        Ok(())
    }
}

/// Fetch one height for the historical sweep; same rules as the live fetch
/// minus the monotonicity guard.
pub async fn get_data_historical(chain: &CosmosChain, height: i64) -> Option<Raw> {
    fetch_raw(chain, Some(height)).await
}

/// Re-fetch only the tx side of a flagged height. The resulting `Raw`
/// carries no block half: the raw-table upsert updates `tx_tx_count` and the
/// new tx rows ride along in the same transaction.
async fn repair_height(chain: &CosmosChain, row: &WrongTxCount) -> Option<Raw> {
    let envelope = chain.get_block_txs(row.height).await?;
    let responses = envelope
        .get("tx_responses")
        .and_then(serde_json::Value::as_array)?
        .clone();

    let mut raw = Raw {
        height: Some(row.height),
        chain_id: Some(row.chain_id.clone()),
        block_tx_count: row.block_tx_count,
        ..Default::default()
    };
    match raw.parse_tx_responses(responses) {
        Ok(()) => Some(raw),
        Err(e) => {
            warn!(height = row.height, error = %e, "unparseable tx responses");
            None
        }
    }
}

/// Heights hidden by one missing-blocks cursor row. A difference of `-1`
/// marks the lowest persisted row, so the range starts at the chain's
/// lowest available height instead.
fn gap_range(height: i64, difference_per_block: i64, lowest: i64) -> Range<i64> {
    if difference_per_block == -1 {
        lowest..height
    } else {
        (height - difference_per_block + 1)..height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gap_range_expands_interior_gaps() {
        // heights 2316140 and 2316143 persisted: the cursor reports
        // (2316143, 3) and the hidden heights are 2316141 and 2316142
        assert_eq!(gap_range(2316143, 3, 0).collect::<Vec<_>>(), vec![2316141, 2316142]);
        // adjacent rows hide nothing
        assert!(gap_range(2316140, 1, 0).collect::<Vec<_>>().is_empty());
    }

    #[test]
    fn gap_range_uses_lowest_height_for_the_bottom_row() {
        assert_eq!(
            gap_range(2316140, -1, 2316137).collect::<Vec<_>>(),
            vec![2316137, 2316138, 2316139]
        );
        // nothing below the lowest row when the window starts there
        assert!(gap_range(2316140, -1, 2316140).collect::<Vec<_>>().is_empty());
    }
}
