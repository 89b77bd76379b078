//! # Pattern Detector
//!
//! Rules are pure functions over one trading pair's swap history. The book
//! keeps each pair's history and re-evaluates only the touched pair after a
//! ledger write; [`PatternBook::recompute`] rebuilds everything from a ledger
//! cut while holding the book exclusively.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use tokio::sync::RwLock;

use super::types::{PatternRecord, PatternType, PipelineError, TradeSide, TradingPair};
use crate::config::PatternConfig;
use crate::database::{Store, StoredTransaction};

/// One successful swap as seen by the rules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeObservation {
    pub signature: String,
    pub block_time: DateTime<Utc>,
    pub side: TradeSide,
    /// Absolute amount of the pair's base mint.
    pub base_amount: Decimal,
    pub quote_amount: Decimal,
    pub price: Option<Decimal>,
}

impl TradeObservation {
    pub fn from_stored(stored: &StoredTransaction) -> Option<(TradingPair, Self)> {
        let tx = &stored.transaction;
        if !tx.is_success() {
            return None;
        }
        let leg = tx.swap_leg()?;
        let pair = leg.pair();
        let observation = Self {
            signature: tx.signature.clone(),
            block_time: tx.block_time,
            side: leg.side(),
            base_amount: leg.amount_of(&pair.base)?,
            quote_amount: leg.amount_of(&pair.quote)?,
            price: leg.implied_price(),
        };
        Some((pair, observation))
    }

    fn sort_key(&self) -> (DateTime<Utc>, &str) {
        (self.block_time, self.signature.as_str())
    }
}

pub trait PatternRule: Send + Sync {
    fn pattern_type(&self) -> PatternType;

    /// `trades` is sorted by block time, then signature.
    fn evaluate(&self, pair: &TradingPair, trades: &[TradeObservation]) -> Option<PatternRecord>;
}

fn record_over(
    pattern_type: PatternType,
    pair: &TradingPair,
    trades: &[&TradeObservation],
    detail: String,
) -> Option<PatternRecord> {
    let first = trades.first()?;
    let last = trades.last()?;
    Some(PatternRecord {
        pattern_type,
        trading_pair: pair.clone(),
        first_seen: first.block_time,
        last_seen: last.block_time,
        occurrence_count: trades.len() as u64,
        supporting_signatures: trades.iter().map(|t| t.signature.clone()).collect(),
        detail,
    })
}

/// A pair traded at least `min_trades` times inside some `window`.
pub struct FrequentPairRule {
    pub window: Duration,
    pub min_trades: usize,
}

impl PatternRule for FrequentPairRule {
    fn pattern_type(&self) -> PatternType {
        PatternType::FrequentPair
    }

    fn evaluate(&self, pair: &TradingPair, trades: &[TradeObservation]) -> Option<PatternRecord> {
        if self.min_trades == 0 || trades.len() < self.min_trades {
            return None;
        }

        // widest burst: earliest start wins ties
        let (mut best_start, mut best_len, mut start) = (0usize, 0usize, 0usize);
        for end in 0..trades.len() {
            while trades[end].block_time - trades[start].block_time > self.window {
                start += 1;
            }
            if end + 1 - start > best_len {
                best_len = end + 1 - start;
                best_start = start;
            }
        }
        if best_len < self.min_trades {
            return None;
        }

        let burst: Vec<&TradeObservation> = trades[best_start..best_start + best_len].iter().collect();
        let detail = format!(
            "{} trades within {}h starting {}",
            best_len,
            self.window.num_hours(),
            burst[0].block_time.format("%Y-%m-%d %H:%M UTC")
        );
        record_over(PatternType::FrequentPair, pair, &burst, detail)
    }
}

/// Trades recurring in the same UTC hour on several distinct days.
pub struct RecurringTimingRule {
    pub min_occurrences: usize,
    pub min_distinct_days: usize,
}

impl PatternRule for RecurringTimingRule {
    fn pattern_type(&self) -> PatternType {
        PatternType::RecurringTiming
    }

    fn evaluate(&self, pair: &TradingPair, trades: &[TradeObservation]) -> Option<PatternRecord> {
        let mut by_hour: BTreeMap<u32, Vec<&TradeObservation>> = BTreeMap::new();
        for trade in trades {
            by_hour.entry(trade.block_time.hour()).or_default().push(trade);
        }

        // ascending hour order, so the earliest hour wins ties
        let mut best: Option<(u32, Vec<&TradeObservation>)> = None;
        for (hour, bucket) in by_hour {
            let days: BTreeSet<NaiveDate> = bucket.iter().map(|t| t.block_time.date_naive()).collect();
            if bucket.len() < self.min_occurrences.max(1) || days.len() < self.min_distinct_days {
                continue;
            }
            if best.as_ref().is_none_or(|(_, b)| bucket.len() > b.len()) {
                best = Some((hour, bucket));
            }
        }
        let (hour, bucket) = best?;

        let days: BTreeSet<NaiveDate> = bucket.iter().map(|t| t.block_time.date_naive()).collect();
        let detail = format!("{} trades at {:02}:00 UTC across {} days", bucket.len(), hour, days.len());
        record_over(PatternType::RecurringTiming, pair, &bucket, detail)
    }
}

/// Trade size in base units stays within `max_variation` (coefficient of variation).
pub struct ConsistentSizingRule {
    pub min_trades: usize,
    pub max_variation: f64,
}

impl PatternRule for ConsistentSizingRule {
    fn pattern_type(&self) -> PatternType {
        PatternType::ConsistentSizing
    }

    fn evaluate(&self, pair: &TradingPair, trades: &[TradeObservation]) -> Option<PatternRecord> {
        if trades.len() < self.min_trades.max(2) {
            return None;
        }
        let sizes: Vec<f64> = trades.iter().filter_map(|t| t.base_amount.to_f64()).collect();
        if sizes.len() != trades.len() {
            return None;
        }

        let n = sizes.len() as f64;
        let mean = sizes.iter().sum::<f64>() / n;
        if mean <= 0.0 {
            return None;
        }
        let variance = sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let variation = variance.sqrt() / mean;
        if variation > self.max_variation {
            return None;
        }

        let all: Vec<&TradeObservation> = trades.iter().collect();
        let detail = format!("average size {:.6} {} (cv {:.3})", mean, pair.base, variation);
        record_over(PatternType::ConsistentSizing, pair, &all, detail)
    }
}

#[derive(Default)]
struct BookState {
    trades: HashMap<TradingPair, Vec<TradeObservation>>,
    seen: HashSet<String>,
    records: BTreeMap<(PatternType, TradingPair), PatternRecord>,
}

impl BookState {
    fn evaluate_pair(&mut self, rules: &[Box<dyn PatternRule>], pair: &TradingPair) {
        let Some(trades) = self.trades.get(pair) else {
            return;
        };
        for rule in rules {
            let key = (rule.pattern_type(), pair.clone());
            match rule.evaluate(pair, trades) {
                Some(record) => {
                    self.records.insert(key, record);
                }
                None => {
                    self.records.remove(&key);
                }
            }
        }
    }

    /// Fully evaluated state over `transactions`, in any order.
    fn from_ledger<'a>(
        rules: &[Box<dyn PatternRule>],
        transactions: impl IntoIterator<Item = &'a StoredTransaction>,
    ) -> Self {
        let mut state = Self::default();
        for stored in transactions {
            if let Some((pair, trade)) = TradeObservation::from_stored(stored) {
                state.push(pair, trade);
            }
        }
        let pairs: Vec<TradingPair> = state.trades.keys().cloned().collect();
        for pair in &pairs {
            state.evaluate_pair(rules, pair);
        }
        state
    }

    fn push(&mut self, pair: TradingPair, trade: TradeObservation) -> bool {
        if !self.seen.insert(trade.signature.clone()) {
            return false;
        }
        let trades = self.trades.entry(pair).or_default();
        let at = trades.partition_point(|t| t.sort_key() < trade.sort_key());
        trades.insert(at, trade);
        true
    }
}

/// Ledger entries and the pattern records derived from exactly those entries.
#[derive(Debug, Clone)]
pub struct LedgerCut {
    pub transactions: Vec<StoredTransaction>,
    pub patterns: Vec<PatternRecord>,
}

pub struct PatternBook {
    rules: Vec<Box<dyn PatternRule>>,
    state: RwLock<BookState>,
}

impl PatternBook {
    pub fn new(rules: Vec<Box<dyn PatternRule>>) -> Self {
        Self { rules, state: RwLock::new(BookState::default()) }
    }

    pub fn from_config(config: &PatternConfig) -> Self {
        Self::new(vec![
            Box::new(FrequentPairRule {
                window: Duration::hours(config.frequent_pair_window_hours.max(1)),
                min_trades: config.frequent_pair_min_trades,
            }),
            Box::new(RecurringTimingRule {
                min_occurrences: config.timing_min_occurrences,
                min_distinct_days: config.timing_min_distinct_days,
            }),
            Box::new(ConsistentSizingRule {
                min_trades: config.sizing_min_trades,
                max_variation: config.sizing_max_variation,
            }),
        ])
    }

    /// Incremental update after a ledger write. Already-seen signatures and
    /// transactions without a swap leg are ignored.
    pub async fn observe(&self, stored: &StoredTransaction) {
        let Some((pair, trade)) = TradeObservation::from_stored(stored) else {
            return;
        };
        let mut state = self.state.write().await;
        if state.push(pair.clone(), trade) {
            state.evaluate_pair(&self.rules, &pair);
        }
    }

    /// Rebuilds every record from a ledger cut read while the book is held
    /// exclusively, so no incremental update interleaves with it. The cut is
    /// returned alongside the records.
    pub async fn recompute(&self, store: &dyn Store) -> Result<LedgerCut, PipelineError> {
        let mut state = self.state.write().await;
        let snapshot = store.ledger_snapshot().await?;

        *state = BookState::from_ledger(&self.rules, &snapshot);
        Ok(LedgerCut { patterns: state.records.values().cloned().collect(), transactions: snapshot })
    }

    /// Records the rules derive from the entries of `transactions` with a
    /// block time before `cutoff`. The live book is not touched.
    pub fn evaluate_until(&self, transactions: &[StoredTransaction], cutoff: DateTime<Utc>) -> Vec<PatternRecord> {
        let before = transactions.iter().filter(|t| t.transaction.block_time < cutoff);
        BookState::from_ledger(&self.rules, before).records.into_values().collect()
    }

    /// Records ordered by pattern type, then pair.
    pub async fn records(&self) -> Vec<PatternRecord> {
        self.state.read().await.records.values().cloned().collect()
    }

    #[cfg(test)]
    pub async fn trades_for(&self, pair: &TradingPair) -> Vec<TradeObservation> {
        self.state.read().await.trades.get(pair).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::pipeline::types::{
        DecodedInstruction, InstructionKind, ProgramRef, Transaction, TxStatus,
    };
    use chrono::TimeZone;

    const SOL: &str = "So11111111111111111111111111111111111111112";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn swap_tx(signature: &str, at: DateTime<Utc>, sol_sold: i64, usdc_bought: i64) -> Transaction {
        let ix = DecodedInstruction {
            program_id: "prog".to_string(),
            program: ProgramRef::Known { name: "raydium_amm".to_string() },
            instruction_name: "swap_base_in".to_string(),
            kind: InstructionKind::Swap,
            accounts: vec![],
            args: BTreeMap::new(),
            amounts: BTreeMap::from([
                (SOL.to_string(), Decimal::from(-sol_sold)),
                (USDC.to_string(), Decimal::from(usdc_bought)),
            ]),
            pool: None,
            routed_pools: vec![],
            opaque_data: None,
        };
        Transaction {
            signature: signature.to_string(),
            slot: at.timestamp() as u64,
            block_time: at,
            fee_payer: "wallet".to_string(),
            instructions: vec![ix],
            status: TxStatus::Success,
        }
    }

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, minute, 0).unwrap()
    }

    fn book() -> PatternBook {
        PatternBook::from_config(&PatternConfig {
            frequent_pair_window_hours: 24,
            frequent_pair_min_trades: 3,
            timing_min_occurrences: 3,
            timing_min_distinct_days: 3,
            sizing_min_trades: 3,
            sizing_max_variation: 0.1,
        })
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let txs = [
            swap_tx("s1", at(1, 14, 5), 2, 300),
            swap_tx("s2", at(2, 14, 20), 2, 310),
            swap_tx("s3", at(3, 14, 40), 2, 290),
            swap_tx("s4", at(3, 15, 0), 2, 295),
        ];
        for tx in &txs {
            store.insert_transaction(tx).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_recompute_is_deterministic() {
        let store = seeded_store().await;
        let book = book();
        let first = book.recompute(&store).await.unwrap().patterns;
        let second = book.recompute(&store).await.unwrap().patterns;
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_incremental_matches_recompute() {
        let store = seeded_store().await;
        let incremental = book();
        // deliver in reverse to exercise ordering
        for stored in store.ledger_snapshot().await.unwrap().iter().rev() {
            incremental.observe(stored).await;
        }
        let batch = book();
        assert_eq!(incremental.records().await, batch.recompute(&store).await.unwrap().patterns);
    }

    #[tokio::test]
    async fn test_rules_fire_on_seeded_history() {
        let store = seeded_store().await;
        let records = book().recompute(&store).await.unwrap().patterns;
        let types: Vec<PatternType> = records.iter().map(|r| r.pattern_type).collect();

        assert!(types.contains(&PatternType::RecurringTiming));
        assert!(types.contains(&PatternType::ConsistentSizing));
        let timing = records.iter().find(|r| r.pattern_type == PatternType::RecurringTiming).unwrap();
        assert_eq!(timing.occurrence_count, 3);
        assert!(timing.supporting_signatures.contains("s3"));
        assert!(!timing.supporting_signatures.contains("s4"));
        assert_eq!(timing.trading_pair, TradingPair::new(SOL, USDC));
    }

    #[tokio::test]
    async fn test_evaluate_until_ignores_later_trades() {
        let store = seeded_store().await;
        let book = book();
        let cut = book.recompute(&store).await.unwrap();

        // s4 lands on day 3 at 15:00; a cutoff just before it excludes it
        let records = book.evaluate_until(&cut.transactions, at(3, 14, 50));
        let sizing = records.iter().find(|r| r.pattern_type == PatternType::ConsistentSizing).unwrap();
        assert_eq!(sizing.occurrence_count, 3);
        assert!(!sizing.supporting_signatures.contains("s4"));
        assert!(records.iter().all(|r| r.last_seen < at(3, 14, 50)));

        // the live book still covers the whole ledger
        assert_eq!(book.records().await, cut.patterns);
        assert_eq!(book.evaluate_until(&cut.transactions, at(4, 0, 0)), cut.patterns);
    }

    #[tokio::test]
    async fn test_duplicate_observation_is_ignored() {
        let store = seeded_store().await;
        let book = book();
        let snapshot = store.ledger_snapshot().await.unwrap();
        for stored in snapshot.iter().chain(snapshot.iter()) {
            book.observe(stored).await;
        }
        let pair = TradingPair::new(SOL, USDC);
        assert_eq!(book.trades_for(&pair).await.len(), 4);
    }

    #[test]
    fn test_frequent_pair_window() {
        let pair = TradingPair::new(SOL, USDC);
        let trade = |sig: &str, t| TradeObservation {
            signature: sig.to_string(),
            block_time: t,
            side: TradeSide::Sell,
            base_amount: Decimal::ONE,
            quote_amount: Decimal::ONE,
            price: Some(Decimal::ONE),
        };
        let rule = FrequentPairRule { window: Duration::hours(1), min_trades: 3 };

        let spread = vec![trade("a", at(1, 0, 0)), trade("b", at(1, 2, 0)), trade("c", at(1, 4, 0))];
        assert!(rule.evaluate(&pair, &spread).is_none());

        let burst = vec![
            trade("a", at(1, 0, 0)),
            trade("b", at(1, 3, 0)),
            trade("c", at(1, 3, 20)),
            trade("d", at(1, 3, 50)),
        ];
        let record = rule.evaluate(&pair, &burst).unwrap();
        assert_eq!(record.occurrence_count, 3);
        assert_eq!(record.first_seen, at(1, 3, 0));
    }

    #[test]
    fn test_inconsistent_sizes_do_not_match() {
        let pair = TradingPair::new(SOL, USDC);
        let trades: Vec<TradeObservation> = [1, 5, 20]
            .iter()
            .enumerate()
            .map(|(i, size)| TradeObservation {
                signature: format!("t{}", i),
                block_time: at(1, i as u32, 0),
                side: TradeSide::Buy,
                base_amount: Decimal::from(*size),
                quote_amount: Decimal::ONE,
                price: None,
            })
            .collect();
        let rule = ConsistentSizingRule { min_trades: 3, max_variation: 0.1 };
        assert!(rule.evaluate(&pair, &trades).is_none());
    }
}
