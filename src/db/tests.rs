use futures::TryStreamExt;

use super::*;
use crate::test_fixtures::{block_fixture, raw_fixture, transfer_log, tx_response_fixture};

// heights whose gaps the missing-blocks cursor must report as
// (2316144, 2) and (2316140, -1)
const SCENARIO_HEIGHTS: [i64; 4] = [2316140, 2316141, 2316142, 2316144];

const TABLE_NAMES: [&str; 7] = [
    "raw",
    "blocks",
    "txs",
    "logs",
    "log_columns",
    "messages",
    "msg_columns",
];

async fn test_store(schema: &str) -> Result<Store> {
    dotenv::from_filename(".env.test").ok();
    let settings = DatabaseSettings {
        db_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for db tests"),
        db_pool_size: 5,
        schema_name: schema.to_owned(),
    };
    let store = Store::connect(&settings).await?;
    store.drop_tables().await?;
    store.create_tables().await?;
    Ok(store)
}

async fn table_count(store: &Store, schema: &str) -> Result<i64> {
    let names: Vec<String> = TABLE_NAMES.iter().map(|n| n.to_string()).collect();
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM information_schema.tables
        WHERE table_schema = $1 AND table_name = ANY($2)
        "#,
    )
    .bind(schema)
    .bind(names)
    .fetch_one(store.pool())
    .await?;
    Ok(count)
}

#[tokio::test]
#[ignore = "requires a live postgres via DATABASE_URL (.env.test)"]
async fn create_and_drop_tables() -> Result<()> {
    let schema = "idx_test_schema_lifecycle";
    let store = test_store(schema).await?;

    assert_eq!(table_count(&store, schema).await?, TABLE_NAMES.len() as i64);

    store.drop_tables().await?;
    assert_eq!(table_count(&store, schema).await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a live postgres via DATABASE_URL (.env.test)"]
async fn upsert_round_trips_all_entities() -> Result<()> {
    let store = test_store("idx_test_roundtrip").await?;
    let raw = raw_fixture(2316140);
    store.upsert_raw(&raw).await?;

    let (block_tx_count, tx_tx_count): (Option<i64>, Option<i64>) = sqlx::query_as(
        "SELECT block_tx_count, tx_tx_count FROM raw WHERE chain_id = $1 AND height = $2",
    )
    .bind("jackal-1")
    .bind(2316140_i64)
    .fetch_one(store.pool())
    .await?;
    assert_eq!(block_tx_count, raw.block_tx_count);
    assert_eq!(tx_tx_count, raw.tx_responses_tx_count);

    let block = raw.block.as_ref().unwrap();
    let (time, block_hash, proposer): (chrono::DateTime<chrono::Utc>, String, String) =
        sqlx::query_as(
            "SELECT time, block_hash, proposer_address FROM blocks WHERE chain_id = $1 AND height = $2",
        )
        .bind("jackal-1")
        .bind(2316140_i64)
        .fetch_one(store.pool())
        .await?;
    assert_eq!(time, block.time);
    assert_eq!(block_hash, block.block_hash);
    assert_eq!(proposer, block.proposer_address);

    let tx = &raw.txs[0];
    let (txhash, code, gas_used, tx_json): (String, String, i64, serde_json::Value) =
        sqlx::query_as("SELECT txhash, code, gas_used, tx FROM txs WHERE height = $1")
            .bind(2316140_i64)
            .fetch_one(store.pool())
            .await?;
    assert_eq!(txhash, tx.txhash);
    assert_eq!(code, tx.code);
    assert_eq!(gas_used, tx.gas_used);
    assert_eq!(tx_json, tx.tx);

    let (parsed, failed): (serde_json::Value, bool) =
        sqlx::query_as("SELECT parsed, failed FROM logs WHERE txhash = $1")
            .bind(&tx.txhash)
            .fetch_one(store.pool())
            .await?;
    assert!(!failed);
    assert_eq!(parsed, raw.logs[0].dump());

    let log_columns: Vec<(String, String)> =
        sqlx::query_as("SELECT event, attribute FROM log_columns ORDER BY event, attribute")
            .fetch_all(store.pool())
            .await?;
    assert_eq!(
        log_columns,
        raw.log_columns.iter().cloned().collect::<Vec<_>>()
    );

    let (type_url, msg_parsed): (String, serde_json::Value) =
        sqlx::query_as("SELECT type, parsed FROM messages WHERE txhash = $1")
            .bind(&tx.txhash)
            .fetch_one(store.pool())
            .await?;
    assert_eq!(type_url, raw.messages[0].type_url);
    assert_eq!(
        msg_parsed,
        serde_json::Value::Object(raw.messages[0].attributes.clone())
    );

    let msg_columns: Vec<String> =
        sqlx::query_scalar("SELECT attribute FROM msg_columns ORDER BY attribute")
            .fetch_all(store.pool())
            .await?;
    assert_eq!(
        msg_columns,
        raw.message_columns.iter().cloned().collect::<Vec<_>>()
    );

    store.drop_tables().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a live postgres via DATABASE_URL (.env.test)"]
async fn missing_blocks_cursor_reports_gaps() -> Result<()> {
    let store = test_store("idx_test_missing_blocks").await?;
    for height in SCENARIO_HEIGHTS {
        store.upsert_raw(&raw_fixture(height)).await?;
    }

    assert_eq!(store.max_height("jackal-1").await?, 2316144);

    let missing: Vec<MissingBlock> = store
        .missing_blocks_cursor("jackal-1")
        .try_collect()
        .await?;
    assert_eq!(
        missing,
        vec![
            MissingBlock {
                height: 2316144,
                difference_per_block: 2
            },
            MissingBlock {
                height: 2316140,
                difference_per_block: -1
            },
        ]
    );

    let wrong: Vec<WrongTxCount> = store
        .wrong_tx_count_cursor("jackal-1")
        .try_collect()
        .await?;
    assert!(wrong.is_empty());

    store.drop_tables().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a live postgres via DATABASE_URL (.env.test)"]
async fn wrong_tx_count_detected_and_repaired_by_upsert() -> Result<()> {
    let store = test_store("idx_test_wrong_count").await?;

    // block claims 5 txs, tx side never fetched
    let mut raw = Raw::default();
    raw.parse_block(block_fixture(2316140, 5))?;
    store.upsert_raw(&raw).await?;

    let wrong: Vec<WrongTxCount> = store
        .wrong_tx_count_cursor("jackal-1")
        .try_collect()
        .await?;
    assert_eq!(
        wrong,
        vec![WrongTxCount {
            chain_id: "jackal-1".to_owned(),
            height: 2316140,
            block_tx_count: Some(5)
        }]
    );

    // the repair sweep re-persists a count-only raw with the new responses
    let mut repair = Raw {
        height: Some(2316140),
        chain_id: Some("jackal-1".to_owned()),
        block_tx_count: Some(5),
        ..Default::default()
    };
    let transfer = transfer_log().to_string();
    repair.parse_tx_responses(
        (0..5)
            .map(|i| tx_response_fixture(2316140, &format!("TX{i}"), &transfer))
            .collect(),
    )?;
    store.upsert_raw(&repair).await?;

    let wrong: Vec<WrongTxCount> = store
        .wrong_tx_count_cursor("jackal-1")
        .try_collect()
        .await?;
    assert!(wrong.is_empty());

    // still exactly one raw row, with the refreshed count
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(rows, 1);
    let tx_tx_count: Option<i64> =
        sqlx::query_scalar("SELECT tx_tx_count FROM raw WHERE height = $1")
            .bind(2316140_i64)
            .fetch_one(store.pool())
            .await?;
    assert_eq!(tx_tx_count, Some(5));
    let tx_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM txs")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(tx_rows, 5);

    store.drop_tables().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a live postgres via DATABASE_URL (.env.test)"]
async fn max_height_is_zero_on_an_empty_table() -> Result<()> {
    let store = test_store("idx_test_max_height").await?;
    assert_eq!(store.max_height("jackal-1").await?, 0);
    store.drop_tables().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires a live postgres via DATABASE_URL (.env.test)"]
async fn failed_raw_log_round_trips() -> Result<()> {
    let store = test_store("idx_test_failed_log").await?;

    let mut raw = Raw::default();
    raw.parse_block(block_fixture(2316140, 1))?;
    raw.parse_tx_responses(vec![tx_response_fixture(2316140, "TXOOG", "out of gas")])?;
    store.upsert_raw(&raw).await?;

    let rows: Vec<(bool, Option<String>)> =
        sqlx::query_as("SELECT failed, failed_msg FROM logs WHERE txhash = $1")
            .bind("TXOOG")
            .fetch_all(store.pool())
            .await?;
    assert_eq!(rows, vec![(true, Some("out of gas".to_owned()))]);

    store.drop_tables().await?;
    Ok(())
}
