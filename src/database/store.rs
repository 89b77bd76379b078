//! Storage abstraction shared by the ledger writer, pool tracker and report store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use super::connection::ConnectionStats;

use crate::pipeline::types::{
    PipelineError, PoolState, StrategyDocument, StrategyReport, TradingPair, Transaction,
};

/// A ledger entry with its append-order index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredTransaction {
    pub seq: u64,
    #[serde(flatten)]
    pub transaction: Transaction,
}

/// Result of a ledger write. A duplicate signature is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted(StoredTransaction),
    Duplicate(StoredTransaction),
}

impl WriteOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, WriteOutcome::Inserted(_))
    }

    pub fn record(&self) -> &StoredTransaction {
        match self {
            WriteOutcome::Inserted(record) | WriteOutcome::Duplicate(record) => record,
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Appends `tx` unless its signature is already present, in which case
    /// the first stored record is returned untouched.
    async fn insert_transaction(&self, tx: &Transaction) -> Result<WriteOutcome, PipelineError>;

    async fn get_transaction(&self, signature: &str) -> Result<Option<StoredTransaction>, PipelineError>;

    /// Newest first by append order.
    async fn recent_transactions(&self, limit: usize) -> Result<Vec<StoredTransaction>, PipelineError>;

    /// Every entry in append order, read as one consistent cut.
    async fn ledger_snapshot(&self) -> Result<Vec<StoredTransaction>, PipelineError>;

    async fn transactions_by_pair(&self, pair: &TradingPair) -> Result<Vec<StoredTransaction>, PipelineError>;

    async fn transactions_by_date(&self, date: NaiveDate) -> Result<Vec<StoredTransaction>, PipelineError>;

    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, PipelineError>;

    async fn transaction_count(&self) -> Result<u64, PipelineError>;

    /// Newest signature below which every delivered event has been handled.
    /// The feed resumes after it on restart.
    async fn load_cursor(&self) -> Result<Option<String>, PipelineError>;

    async fn save_cursor(&self, signature: &str) -> Result<(), PipelineError>;

    /// Stores `state` unless the stored pool is at the same or a later slot.
    /// Returns whether the row changed.
    async fn upsert_pool(&self, state: &PoolState) -> Result<bool, PipelineError>;

    async fn load_pools(&self) -> Result<Vec<PoolState>, PipelineError>;

    /// Replaces the report for `date` in one step, bumping its version.
    async fn put_report(
        &self,
        date: NaiveDate,
        generated_at: DateTime<Utc>,
        document: &StrategyDocument,
    ) -> Result<StrategyReport, PipelineError>;

    async fn get_report(&self, date: NaiveDate) -> Result<Option<StrategyReport>, PipelineError>;

    /// Inclusive range, ascending by date.
    async fn reports_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<StrategyReport>, PipelineError>;

    async fn health_check(&self) -> Result<(), PipelineError>;

    fn backend(&self) -> &'static str;

    /// Connection pool usage, for backends that pool connections.
    fn connection_stats(&self) -> Option<ConnectionStats> {
        None
    }
}
