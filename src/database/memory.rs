//! In-process store used when no `DATABASE_URL` is configured, and in tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;

use super::store::{Store, StoredTransaction, WriteOutcome};
use crate::pipeline::types::{
    PipelineError, PoolState, StrategyDocument, StrategyReport, TradingPair, Transaction,
};

/// Ledger entries plus their secondary indices, guarded together so an
/// append and its index updates are observed atomically.
#[derive(Default)]
struct LedgerInner {
    entries: Vec<StoredTransaction>,
    by_signature: HashMap<String, usize>,
    by_pair: HashMap<TradingPair, Vec<usize>>,
    by_date: BTreeMap<NaiveDate, Vec<usize>>,
}

impl LedgerInner {
    fn collect(&self, positions: Option<&Vec<usize>>) -> Vec<StoredTransaction> {
        positions
            .map(|p| p.iter().map(|i| self.entries[*i].clone()).collect())
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    ledger: RwLock<LedgerInner>,
    pools: DashMap<String, PoolState>,
    reports: RwLock<BTreeMap<NaiveDate, StrategyReport>>,
    cursor: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_transaction(&self, tx: &Transaction) -> Result<WriteOutcome, PipelineError> {
        let mut ledger = self.ledger.write();
        if let Some(&pos) = ledger.by_signature.get(&tx.signature) {
            return Ok(WriteOutcome::Duplicate(ledger.entries[pos].clone()));
        }

        let pos = ledger.entries.len();
        let record = StoredTransaction { seq: pos as u64 + 1, transaction: tx.clone() };
        ledger.entries.push(record.clone());
        ledger.by_signature.insert(tx.signature.clone(), pos);
        if let Some(pair) = tx.trading_pair() {
            ledger.by_pair.entry(pair).or_default().push(pos);
        }
        ledger.by_date.entry(tx.block_date()).or_default().push(pos);

        Ok(WriteOutcome::Inserted(record))
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<StoredTransaction>, PipelineError> {
        let ledger = self.ledger.read();
        Ok(ledger.by_signature.get(signature).map(|pos| ledger.entries[*pos].clone()))
    }

    async fn recent_transactions(&self, limit: usize) -> Result<Vec<StoredTransaction>, PipelineError> {
        Ok(self.ledger.read().entries.iter().rev().take(limit).cloned().collect())
    }

    async fn ledger_snapshot(&self) -> Result<Vec<StoredTransaction>, PipelineError> {
        Ok(self.ledger.read().entries.clone())
    }

    async fn transactions_by_pair(&self, pair: &TradingPair) -> Result<Vec<StoredTransaction>, PipelineError> {
        let ledger = self.ledger.read();
        Ok(ledger.collect(ledger.by_pair.get(pair)))
    }

    async fn transactions_by_date(&self, date: NaiveDate) -> Result<Vec<StoredTransaction>, PipelineError> {
        let ledger = self.ledger.read();
        Ok(ledger.collect(ledger.by_date.get(&date)))
    }

    async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, PipelineError> {
        let ledger = self.ledger.read();
        let count = ledger
            .by_date
            .range(since.date_naive()..)
            .flat_map(|(_, positions)| positions.iter())
            .filter(|pos| ledger.entries[**pos].transaction.block_time >= since)
            .count();
        Ok(count as u64)
    }

    async fn transaction_count(&self) -> Result<u64, PipelineError> {
        Ok(self.ledger.read().entries.len() as u64)
    }

    async fn load_cursor(&self) -> Result<Option<String>, PipelineError> {
        Ok(self.cursor.read().clone())
    }

    async fn save_cursor(&self, signature: &str) -> Result<(), PipelineError> {
        *self.cursor.write() = Some(signature.to_string());
        Ok(())
    }

    async fn upsert_pool(&self, state: &PoolState) -> Result<bool, PipelineError> {
        match self.pools.entry(state.pool_address.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(state.clone());
                Ok(true)
            }
            Entry::Occupied(mut current) => {
                if current.get().last_updated_slot >= state.last_updated_slot {
                    return Ok(false);
                }
                current.insert(state.clone());
                Ok(true)
            }
        }
    }

    async fn load_pools(&self) -> Result<Vec<PoolState>, PipelineError> {
        let mut pools: Vec<PoolState> = self.pools.iter().map(|e| e.value().clone()).collect();
        pools.sort_by(|a, b| a.pool_address.cmp(&b.pool_address));
        Ok(pools)
    }

    async fn put_report(
        &self,
        date: NaiveDate,
        generated_at: DateTime<Utc>,
        document: &StrategyDocument,
    ) -> Result<StrategyReport, PipelineError> {
        let mut reports = self.reports.write();
        let version = reports.get(&date).map(|r| r.version + 1).unwrap_or(1);
        let report = StrategyReport { report_date: date, version, generated_at, document: document.clone() };
        reports.insert(date, report.clone());
        Ok(report)
    }

    async fn get_report(&self, date: NaiveDate) -> Result<Option<StrategyReport>, PipelineError> {
        Ok(self.reports.read().get(&date).cloned())
    }

    async fn reports_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<StrategyReport>, PipelineError> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.reports.read().range(from..=to).map(|(_, r)| r.clone()).collect())
    }

    async fn health_check(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::TxStatus;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn tx(signature: &str, slot: u64, day: u32) -> Transaction {
        Transaction {
            signature: signature.to_string(),
            slot,
            block_time: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            fee_payer: "wallet".to_string(),
            instructions: vec![],
            status: TxStatus::Success,
        }
    }

    fn pool(slot: u64, reserve_b: i64) -> PoolState {
        PoolState {
            pool_address: "pool".to_string(),
            token_a: "a".to_string(),
            token_b: "b".to_string(),
            reserve_a: Decimal::from(100),
            reserve_b: Decimal::from(reserve_b),
            last_price: Decimal::from(reserve_b) / Decimal::from(100),
            last_updated_slot: slot,
        }
    }

    #[tokio::test]
    async fn test_duplicate_insert_returns_first_record() {
        let store = MemoryStore::new();
        let first = store.insert_transaction(&tx("sig-1", 10, 1)).await.unwrap();
        assert!(first.is_inserted());

        let mut changed = tx("sig-1", 99, 2);
        changed.fee_payer = "someone-else".to_string();
        let second = store.insert_transaction(&changed).await.unwrap();

        assert!(!second.is_inserted());
        assert_eq!(second.record(), first.record());
        assert_eq!(store.transaction_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_secondary_indices() {
        let store = MemoryStore::new();
        store.insert_transaction(&tx("a", 30, 1)).await.unwrap();
        store.insert_transaction(&tx("b", 10, 2)).await.unwrap();
        store.insert_transaction(&tx("c", 20, 2)).await.unwrap();

        let day2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let on_day2 = store.transactions_by_date(day2).await.unwrap();
        assert_eq!(on_day2.iter().map(|t| t.seq).collect::<Vec<_>>(), vec![2, 3]);

        let recent = store.recent_transactions(2).await.unwrap();
        assert_eq!(recent[0].transaction.signature, "c");

        let since = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(store.count_since(since).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cursor_is_independent_of_ledger_contents() {
        let store = MemoryStore::new();
        store.insert_transaction(&tx("a", 30, 1)).await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap(), None);

        store.save_cursor("b").await.unwrap();
        store.save_cursor("c").await.unwrap();
        assert_eq!(store.load_cursor().await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_pool_upsert_is_slot_guarded() {
        let store = MemoryStore::new();
        assert!(store.upsert_pool(&pool(10, 100)).await.unwrap());
        assert!(store.upsert_pool(&pool(12, 105)).await.unwrap());
        assert!(!store.upsert_pool(&pool(11, 90)).await.unwrap());
        assert!(!store.upsert_pool(&pool(12, 80)).await.unwrap());

        let pools = store.load_pools().await.unwrap();
        assert_eq!(pools[0].last_updated_slot, 12);
        assert_eq!(pools[0].reserve_b, Decimal::from(105));
    }

    #[tokio::test]
    async fn test_reports_version_and_range() {
        let store = MemoryStore::new();
        let doc: StrategyDocument = serde_json::from_value(serde_json::json!({
            "target_selection": {"liquidity_criteria": 1, "volume_criteria": 1, "price_criteria": 1},
            "buy_strategy": {"trigger_conditions": 1, "buy_parameters": 1},
            "sell_strategy": {"take_profit": 1, "stop_loss": 1},
            "position_management": {"scaling": 1, "rebalancing": 1},
            "risk_control": {"max_position_size": 1, "max_daily_loss": 1, "correlation_management": 1}
        }))
        .unwrap();

        let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        assert_eq!(store.put_report(d1, Utc::now(), &doc).await.unwrap().version, 1);
        assert_eq!(store.put_report(d1, Utc::now(), &doc).await.unwrap().version, 2);
        store.put_report(d2, Utc::now(), &doc).await.unwrap();

        assert_eq!(store.reports_between(d1, d2).await.unwrap().len(), 2);
        assert!(store.reports_between(d2, d1).await.unwrap().is_empty());
        assert!(store.get_report(NaiveDate::from_ymd_opt(2024, 3, 3).unwrap()).await.unwrap().is_none());
    }
}
