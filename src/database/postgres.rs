//! PostgreSQL-backed [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio_postgres::types::Json;

use super::connection::{ConnectionStats, DatabaseConnection};
use super::models::{FromRow, POOL_COLUMNS, REPORT_COLUMNS, TRANSACTION_COLUMNS};
use super::store::{Store, StoredTransaction, WriteOutcome};
use crate::pipeline::types::{
    PipelineError, PoolState, StrategyDocument, StrategyReport, TradingPair, Transaction,
};

pub struct PgStore {
    db: DatabaseConnection,
}

fn write_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::StorageWrite(e.to_string())
}

fn read_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::StorageRead(e.to_string())
}

fn rows_to<T: FromRow>(rows: Vec<tokio_postgres::Row>) -> Result<Vec<T>, PipelineError> {
    rows.iter().map(|r| T::from_row(r).map_err(read_err)).collect()
}

impl PgStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn client(&self, for_write: bool) -> Result<deadpool_postgres::Object, PipelineError> {
        self.db
            .pool()
            .get()
            .await
            .map_err(|e| if for_write { write_err(e) } else { read_err(e) })
    }

    async fn select_transactions(
        &self,
        filter: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<StoredTransaction>, PipelineError> {
        let client = self.client(false).await?;
        let sql = format!("SELECT {} FROM transactions {}", TRANSACTION_COLUMNS, filter);
        let rows = client.query(sql.as_str(), params).await.map_err(read_err)?;
        rows_to(rows)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<WriteOutcome, PipelineError> {
        let client = self.client(true).await?;
        let pair = tx.trading_pair().map(|p| p.key());
        let inserted = client
            .query_opt(
                "INSERT INTO transactions
                    (signature, slot, block_time, block_date, fee_payer, status, trading_pair, instructions)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (signature) DO NOTHING
                 RETURNING seq",
                &[
                    &tx.signature,
                    &(tx.slot as i64),
                    &tx.block_time,
                    &tx.block_date(),
                    &tx.fee_payer,
                    &tx.status.as_str(),
                    &pair,
                    &Json(&tx.instructions),
                ],
            )
            .await
            .map_err(write_err)?;

        if let Some(row) = inserted {
            let seq: i64 = row.try_get("seq").map_err(write_err)?;
            return Ok(WriteOutcome::Inserted(StoredTransaction { seq: seq as u64, transaction: tx.clone() }));
        }

        let existing = self
            .get_transaction(&tx.signature)
            .await?
            .ok_or_else(|| write_err(format!("conflicting row for {} vanished", tx.signature)))?;
        Ok(WriteOutcome::Duplicate(existing))
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<StoredTransaction>, PipelineError> {
        Ok(self.select_transactions("WHERE signature = $1", &[&signature]).await?.into_iter().next())
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<StoredTransaction>, PipelineError> {
        self.select_transactions("ORDER BY seq DESC LIMIT $1", &[&(limit as i64)]).await
    }

    async fn ledger_snapshot(&self) -> Result<Vec<StoredTransaction>, PipelineError> {
        self.select_transactions("ORDER BY seq ASC", &[]).await
    }

    async fn transactions_by_pair(&self, pair: &TradingPair) -> Result<Vec<StoredTransaction>, PipelineError> {
        self.select_transactions("WHERE trading_pair = $1 ORDER BY seq ASC", &[&pair.key()]).await
    }

    async fn transactions_by_date(&self, date: NaiveDate) -> Result<Vec<StoredTransaction>, PipelineError> {
        self.select_transactions("WHERE block_date = $1 ORDER BY seq ASC", &[&date]).await
    }

    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, PipelineError> {
        let client = self.client(false).await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM transactions WHERE block_time >= $1", &[&since])
            .await
            .map_err(read_err)?;
        let count: i64 = row.try_get(0).map_err(read_err)?;
        Ok(count as u64)
    }

    async fn transaction_count(&self) -> Result<u64, PipelineError> {
        let client = self.client(false).await?;
        let row = client.query_one("SELECT COUNT(*) FROM transactions", &[]).await.map_err(read_err)?;
        let count: i64 = row.try_get(0).map_err(read_err)?;
        Ok(count as u64)
    }

    async fn load_cursor(&self) -> Result<Option<String>, PipelineError> {
        let client = self.client(false).await?;
        let row = client
            .query_opt("SELECT signature FROM feed_cursor WHERE id = 1", &[])
            .await
            .map_err(read_err)?;
        row.map(|r| r.try_get("signature").map_err(read_err)).transpose()
    }

    async fn save_cursor(&self, signature: &str) -> Result<(), PipelineError> {
        let client = self.client(true).await?;
        client
            .execute(
                "INSERT INTO feed_cursor (id, signature) VALUES (1, $1)
                 ON CONFLICT (id) DO UPDATE SET signature = EXCLUDED.signature, updated_at = NOW()",
                &[&signature],
            )
            .await
            .map_err(write_err)?;
        Ok(())
    }

    async fn upsert_pool(&self, state: &PoolState) -> Result<bool, PipelineError> {
        let client = self.client(true).await?;
        let changed = client
            .execute(
                "INSERT INTO pool_states
                    (pool_address, token_a, token_b, reserve_a, reserve_b, last_price, last_updated_slot)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (pool_address) DO UPDATE SET
                    token_a = EXCLUDED.token_a,
                    token_b = EXCLUDED.token_b,
                    reserve_a = EXCLUDED.reserve_a,
                    reserve_b = EXCLUDED.reserve_b,
                    last_price = EXCLUDED.last_price,
                    last_updated_slot = EXCLUDED.last_updated_slot,
                    updated_at = NOW()
                 WHERE pool_states.last_updated_slot < EXCLUDED.last_updated_slot",
                &[
                    &state.pool_address,
                    &state.token_a,
                    &state.token_b,
                    &state.reserve_a,
                    &state.reserve_b,
                    &state.last_price,
                    &(state.last_updated_slot as i64),
                ],
            )
            .await
            .map_err(write_err)?;
        Ok(changed > 0)
    }

    async fn load_pools(&self) -> Result<Vec<PoolState>, PipelineError> {
        let client = self.client(false).await?;
        let sql = format!("SELECT {} FROM pool_states ORDER BY pool_address", POOL_COLUMNS);
        let rows = client.query(sql.as_str(), &[]).await.map_err(read_err)?;
        rows_to(rows)
    }

    async fn put_report(
        &self,
        date: NaiveDate,
        generated_at: DateTime<Utc>,
        document: &StrategyDocument,
    ) -> Result<StrategyReport, PipelineError> {
        let client = self.client(true).await?;
        let sql = format!(
            "INSERT INTO strategy_reports (report_date, version, generated_at, document)
             VALUES ($1, 1, $2, $3)
             ON CONFLICT (report_date) DO UPDATE SET
                version = strategy_reports.version + 1,
                generated_at = EXCLUDED.generated_at,
                document = EXCLUDED.document
             RETURNING {}",
            REPORT_COLUMNS
        );
        let row = client
            .query_one(sql.as_str(), &[&date, &generated_at, &Json(document)])
            .await
            .map_err(write_err)?;
        StrategyReport::from_row(&row).map_err(write_err)
    }

    async fn get_report(&self, date: NaiveDate) -> Result<Option<StrategyReport>, PipelineError> {
        let client = self.client(false).await?;
        let sql = format!("SELECT {} FROM strategy_reports WHERE report_date = $1", REPORT_COLUMNS);
        let row = client.query_opt(sql.as_str(), &[&date]).await.map_err(read_err)?;
        row.map(|r| StrategyReport::from_row(&r).map_err(read_err)).transpose()
    }

    async fn reports_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<StrategyReport>, PipelineError> {
        let client = self.client(false).await?;
        let sql = format!(
            "SELECT {} FROM strategy_reports WHERE report_date BETWEEN $1 AND $2 ORDER BY report_date",
            REPORT_COLUMNS
        );
        let rows = client.query(sql.as_str(), &[&from, &to]).await.map_err(read_err)?;
        rows_to(rows)
    }

    async fn health_check(&self) -> Result<(), PipelineError> {
        let client = self.client(false).await?;
        client.query("SELECT 1", &[]).await.map_err(read_err)?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn connection_stats(&self) -> Option<ConnectionStats> {
        Some(self.db.stats())
    }
}
