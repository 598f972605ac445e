use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::config::DatabaseSettings;
use crate::db::models::{Block, Log, Message, Tx};
use crate::parser::Raw;

pub mod models;

#[cfg(test)]
mod tests;

/// DDL is supplied externally and run verbatim at bootstrap with `$schema`
/// substituted.
const CREATE_TABLES_SQL: &str = include_str!("../../sql/create_tables.sql");

const MISSING_BLOCKS_SQL: &str = r#"
SELECT height, difference_per_block FROM (
    SELECT height,
           COALESCE(height - LAG(height) OVER (ORDER BY height), -1) AS difference_per_block,
           chain_id
    FROM raw
    WHERE chain_id = $1
) AS dif
WHERE difference_per_block <> 1
ORDER BY height DESC
LIMIT 100
"#;

const WRONG_TX_COUNT_SQL: &str = r#"
SELECT chain_id, height, block_tx_count
FROM raw
WHERE (tx_tx_count <> block_tx_count OR tx_tx_count IS NULL OR block_tx_count IS NULL)
  AND chain_id = $1
"#;

/// A height adjacent to a gap in the persisted range.
/// `difference_per_block == -1` marks the lowest persisted row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MissingBlock {
    pub height: i64,
    pub difference_per_block: i64,
}

/// A raw row whose two tx counts disagree (or either is unknown).
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct WrongTxCount {
    pub chain_id: String,
    pub height: i64,
    pub block_tx_count: Option<i64>,
}

/// All relational persistence for the pipeline. Statements run unqualified;
/// the configured schema is applied per connection via `search_path`, so one
/// database can host several indexer deployments.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
    schema: String,
}

impl Store {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let schema = settings.schema_name.clone();
        let set_path = format!("SET search_path TO {schema}");
        let pool = PgPoolOptions::new()
            .max_connections(settings.db_pool_size)
            .acquire_timeout(Duration::from_secs(30))
            .after_connect(move |conn, _meta| {
                let set_path = set_path.clone();
                Box::pin(async move {
                    conn.execute(set_path.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&settings.db_url)
            .await
            .with_context(|| format!("connecting to postgres for schema {}", settings.schema_name))?;
        Ok(Self { pool, schema })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_tables(&self) -> Result<()> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema))
            .execute(&self.pool)
            .await?;
        let ddl = CREATE_TABLES_SQL.replace("$schema", &self.schema);
        for statement in ddl.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn drop_tables(&self) -> Result<()> {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.schema))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA {}", self.schema))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upsert one parsed height. Everything lands in a single transaction,
    /// so a block row is never visible without its txs, logs and messages.
    pub async fn upsert_raw(&self, raw: &Raw) -> Result<()> {
        let (chain_id, height) = raw
            .primary_key()
            .context("raw is missing its primary key")?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO raw (chain_id, height, block_tx_count, tx_tx_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (chain_id, height)
            DO UPDATE SET tx_tx_count = EXCLUDED.tx_tx_count
            "#,
        )
        .bind(chain_id)
        .bind(height)
        .bind(raw.block_tx_count)
        .bind(raw.tx_responses_tx_count)
        .execute(&mut *tx)
        .await?;

        if let Some(block) = &raw.block {
            insert_block(&mut tx, block).await?;
        }
        insert_txs(&mut tx, &raw.txs).await?;
        insert_logs(&mut tx, &raw.logs).await?;
        insert_log_columns(&mut tx, raw.log_columns.iter()).await?;
        insert_messages(&mut tx, &raw.messages).await?;
        insert_msg_columns(&mut tx, raw.message_columns.iter()).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn max_height(&self, chain_id: &str) -> Result<i64> {
        let height: Option<i64> =
            sqlx::query_scalar("SELECT MAX(height) FROM raw WHERE chain_id = $1")
                .bind(chain_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(height.unwrap_or(0))
    }

    /// Heights next to gaps in the persisted range, descending, capped at
    /// 100 rows per pass so repair work never starves the live tail. The
    /// stream holds a pool connection until drained or dropped.
    pub fn missing_blocks_cursor(&self, chain_id: &str) -> BoxStream<'_, sqlx::Result<MissingBlock>> {
        sqlx::query_as::<_, MissingBlock>(MISSING_BLOCKS_SQL)
            .bind(chain_id.to_owned())
            .fetch(&self.pool)
    }

    /// Rows whose tx counts disagree or are unknown. Unlimited; the consumer
    /// chunks it and must drain or drop the stream to release the connection.
    pub fn wrong_tx_count_cursor(&self, chain_id: &str) -> BoxStream<'_, sqlx::Result<WrongTxCount>> {
        sqlx::query_as::<_, WrongTxCount>(WRONG_TX_COUNT_SQL)
            .bind(chain_id.to_owned())
            .fetch(&self.pool)
    }
}

async fn insert_block(tx: &mut Transaction<'_, Postgres>, block: &Block) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO blocks (chain_id, height, time, block_hash, proposer_address)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&block.chain_id)
    .bind(block.height)
    .bind(block.time)
    .bind(&block.block_hash)
    .bind(&block.proposer_address)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_txs(tx: &mut Transaction<'_, Postgres>, txs: &[Tx]) -> sqlx::Result<()> {
    for row in txs {
        sqlx::query(
            r#"
            INSERT INTO txs (txhash, chain_id, height, code, data, info, logs, events,
                             raw_log, tx, gas_used, gas_wanted, codespace, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&row.txhash)
        .bind(&row.chain_id)
        .bind(row.height)
        .bind(&row.code)
        .bind(&row.data)
        .bind(&row.info)
        .bind(&row.logs)
        .bind(&row.events)
        .bind(&row.raw_log)
        .bind(&row.tx)
        .bind(row.gas_used)
        .bind(row.gas_wanted)
        .bind(&row.codespace)
        .bind(row.timestamp)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_logs(tx: &mut Transaction<'_, Postgres>, logs: &[Log]) -> sqlx::Result<()> {
    for row in logs {
        sqlx::query(
            r#"
            INSERT INTO logs (txhash, msg_index, parsed, failed, failed_msg)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&row.txhash)
        .bind(&row.msg_index)
        .bind(row.dump())
        .bind(row.failed)
        .bind(&row.failed_msg)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_log_columns<'a>(
    tx: &mut Transaction<'_, Postgres>,
    columns: impl Iterator<Item = &'a (String, String)>,
) -> sqlx::Result<()> {
    for (event, attribute) in columns {
        sqlx::query(
            r#"
            INSERT INTO log_columns (event, attribute)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(event)
        .bind(attribute)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_messages(tx: &mut Transaction<'_, Postgres>, messages: &[Message]) -> sqlx::Result<()> {
    for row in messages {
        sqlx::query(
            r#"
            INSERT INTO messages (txhash, msg_index, type, parsed)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&row.txhash)
        .bind(&row.msg_index)
        .bind(&row.type_url)
        .bind(serde_json::Value::Object(row.attributes.clone()))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_msg_columns<'a>(
    tx: &mut Transaction<'_, Postgres>,
    columns: impl Iterator<Item = &'a String>,
) -> sqlx::Result<()> {
    for attribute in columns {
        sqlx::query(
            r#"
            INSERT INTO msg_columns (attribute)
            VALUES ($1)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(attribute)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
