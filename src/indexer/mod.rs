use serde_json::Value;
use tracing::warn;

use crate::cosmos::CosmosChain;
use crate::parser::Raw;

pub mod backfill;
pub mod live;
pub mod persister;


pub use backfill::Backfiller;
pub use live::LiveTailer;
pub use persister::Persister;

/// Fetch and parse one height. Returns `None` when the block cannot be
/// fetched or parsed at all; tx-side problems degrade to an unset tx half so
/// the row surfaces in the wrong-count cursor instead.
pub(crate) async fn fetch_raw(chain: &CosmosChain, height: Option<i64>) -> Option<Raw> {
    let block = chain.get_block(height).await?;

    let mut raw = Raw::default();
    if let Err(e) = raw.parse_block(block) {
        warn!(?height, error = %e, "unparseable block payload");
        return None;
    }

    // An empty block needs no tx fetch at all.
    let envelope = if raw.block_tx_count == Some(0) {
        None
    } else {
        chain.get_block_txs(raw.height?).await
    };
    attach_tx_responses(&mut raw, envelope);
    Some(raw)
}

/// Attach the tx-responses envelope to a parsed block. Anything short of a
/// full, count-consistent envelope leaves the tx half of the `Raw` unset:
/// the raw row then carries a NULL `tx_tx_count` and the repair sweep picks
/// the height up again later.
pub(crate) fn attach_tx_responses(raw: &mut Raw, envelope: Option<Value>) {
    if raw.block_tx_count == Some(0) {
        raw.tx_responses_tx_count = Some(0);
        return;
    }

    let Some(envelope) = envelope else {
        warn!(height = ?raw.height, "no tx envelope for height");
        return;
    };
    let Some(responses) = envelope.get("tx_responses").and_then(Value::as_array) else {
        warn!(height = ?raw.height, "tx envelope lacks tx_responses");
        return;
    };
    if Some(responses.len() as i64) != raw.block_tx_count {
        warn!(
            height = ?raw.height,
            block_tx_count = ?raw.block_tx_count,
            tx_responses = responses.len(),
            "tx_responses count disagrees with block, leaving height for repair"
        );
        return;
    }

    let mut candidate = raw.clone();
    match candidate.parse_tx_responses(responses.clone()) {
        Ok(()) => *raw = candidate,
        Err(e) => {
            warn!(height = ?raw.height, error = %e, "unparseable tx responses");
        }
    }
}
