//! # Ingest Loop
//!
//! Consumes raw events from the feed channel with up to `max_in_flight`
//! concurrent workers. Each worker decodes, writes the ledger, then updates
//! the pool tracker and pattern book. Decode failures are counted and
//! dropped; storage failures are retried with backoff and stop the pipeline
//! once retries are exhausted.
//!
//! Workers finish out of order, so the persisted feed cursor is a watermark:
//! it only moves past an event once that event and every event received
//! before it are done. An event whose worker failed holds the watermark
//! back, and a restart redelivers it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::decoder::Decoder;
use super::feed::backoff_delay;
use super::health::{PipelineHealth, PipelineStatus};
use super::ledger::LedgerWriter;
use super::patterns::PatternBook;
use super::pool_tracker::{ApplyOutcome, PoolTracker};
use super::types::{PipelineError, RawEvent};
use crate::config::PipelineConfig;
use crate::database::{Store, WriteOutcome};

pub struct Pipeline {
    decoder: Decoder,
    store: Arc<dyn Store>,
    ledger: LedgerWriter,
    pools: Arc<PoolTracker>,
    patterns: Arc<PatternBook>,
    health: Arc<PipelineHealth>,
    config: PipelineConfig,
}

/// A finished worker: its arrival ticket and the signature it handled,
/// `None` when the event could not be decoded.
struct Completed {
    ticket: u64,
    signature: Option<String>,
}

type WorkerResult = Result<Completed, PipelineError>;

fn worker_result(joined: Result<WorkerResult, JoinError>) -> WorkerResult {
    joined.map_err(|e| PipelineError::Worker(e.to_string()))?
}

/// Contiguous-completion tracker over arrival tickets.
#[derive(Default)]
struct Watermark {
    base: u64,
    // None while in flight, Some(signature) once done
    slots: VecDeque<Option<Option<String>>>,
}

impl Watermark {
    fn admit(&mut self) -> u64 {
        self.slots.push_back(None);
        self.base + self.slots.len() as u64 - 1
    }

    /// Marks `ticket` done. Returns the newest signature the watermark moved
    /// past, if it moved.
    fn complete(&mut self, ticket: u64, signature: Option<String>) -> Option<String> {
        let index = ticket.checked_sub(self.base)? as usize;
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(signature);
        }

        let mut advanced = None;
        while matches!(self.slots.front(), Some(Some(_))) {
            if let Some(Some(Some(signature))) = self.slots.pop_front() {
                advanced = Some(signature);
            }
            self.base += 1;
        }
        advanced
    }
}

impl Pipeline {
    pub fn new(
        decoder: Decoder,
        store: Arc<dyn Store>,
        pools: Arc<PoolTracker>,
        patterns: Arc<PatternBook>,
        health: Arc<PipelineHealth>,
        config: PipelineConfig,
    ) -> Self {
        Self { decoder, ledger: LedgerWriter::new(store.clone()), store, pools, patterns, health, config }
    }

    /// Runs until the channel closes, shutdown is signalled or a storage
    /// failure outlasts its retries. On shutdown, events already buffered in
    /// the channel are still processed and in-flight workers are awaited.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RawEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), PipelineError> {
        let max_in_flight = self.config.max_in_flight.max(1);
        let mut workers: JoinSet<WorkerResult> = JoinSet::new();
        let mut watermark = Watermark::default();
        let mut stopping = false;
        let mut fatal: Option<PipelineError> = None;

        self.health.set_status(PipelineStatus::Running);
        info!("🚀 Ingest running with {} workers", max_in_flight);

        loop {
            if workers.len() >= max_in_flight {
                if let Some(joined) = workers.join_next().await {
                    if let Err(e) = self.settle(&mut watermark, joined).await {
                        fatal = Some(e);
                        break;
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed(), if !stopping => {
                    info!("🛑 Ingest draining buffered events");
                    stopping = true;
                    events.close();
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = self.settle(&mut watermark, joined).await {
                        fatal = Some(e);
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let ticket = watermark.admit();
                        let this = Arc::clone(&self);
                        workers.spawn(async move {
                            let signature = this.process_event(event).await?;
                            Ok::<_, PipelineError>(Completed { ticket, signature })
                        });
                    }
                    None => break,
                },
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = self.settle(&mut watermark, joined).await {
                fatal.get_or_insert(e);
            }
        }

        match fatal {
            Some(e) => {
                error!("❌ Ingest stopped: {}", e);
                self.health.record_failure(&e);
                Err(e)
            }
            None => {
                info!("Ingest stopped");
                self.health.set_status(PipelineStatus::Stopped);
                Ok(())
            }
        }
    }

    /// Folds a finished worker into the watermark and persists the cursor
    /// when it moves. A cursor write failure is logged; the next advance
    /// writes again.
    async fn settle(
        &self,
        watermark: &mut Watermark,
        joined: Result<WorkerResult, JoinError>,
    ) -> Result<(), PipelineError> {
        let done = worker_result(joined)?;
        if let Some(signature) = watermark.complete(done.ticket, done.signature) {
            if let Err(e) = self.store.save_cursor(&signature).await {
                warn!("💾 Could not save feed cursor {}: {}", signature, e);
            }
        }
        Ok(())
    }

    /// Returns the handled signature, or `None` for an undecodable event.
    async fn process_event(&self, event: RawEvent) -> Result<Option<String>, PipelineError> {
        self.health.record_event();

        let tx = match self.decoder.decode(&event) {
            Ok(tx) => tx,
            Err(e) => {
                warn!("⚠️ Dropping event #{}: {}", event.source_sequence_id, e);
                self.health.record_decode_error(&e);
                return Ok(None);
            }
        };

        let tx_ref = &tx;
        let (stored, inserted) = match self.with_storage_retry("ledger write", move || self.ledger.write(tx_ref)).await? {
            WriteOutcome::Inserted(stored) => {
                self.health.record_written();
                debug!("📒 #{} {} at slot {}", stored.seq, tx.signature, tx.slot);
                (stored, true)
            }
            WriteOutcome::Duplicate(stored) => {
                self.health.record_duplicate();
                (stored, false)
            }
        };

        // A duplicate may come from a delivery that stored the ledger entry
        // and then failed on the pool store. Pool upserts are slot-guarded,
        // so replaying them from the first record is idempotent.
        let recorded = &stored.transaction;
        if recorded.is_success() {
            for observation in recorded.instructions.iter().flat_map(|ix| ix.pool_observations()) {
                let outcome = self
                    .with_storage_retry("pool update", move || self.pools.apply_and_persist(observation, recorded.slot))
                    .await?;
                if inserted && matches!(outcome, ApplyOutcome::Stale { .. }) {
                    self.health.record_stale_update();
                }
            }
        }

        self.patterns.observe(&stored).await;
        Ok(Some(stored.transaction.signature.clone()))
    }

    async fn with_storage_retry<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let base = Duration::from_millis(self.config.storage_retry_base_ms.max(1));
        let mut attempt: u32 = 0;
        loop {
            match attempt_fn().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("✅ {} recovered after {} retries", operation, attempt);
                        self.health.set_status(PipelineStatus::Running);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_storage_write() && attempt < self.config.storage_retry_attempts => {
                    let delay = backoff_delay(base, attempt);
                    attempt += 1;
                    warn!("💾 {} failed ({}), retry {} in {:?}", operation, e, attempt, delay);
                    self.health.record_storage_retry(&e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryStore, StoredTransaction};
    use crate::pipeline::feed::{ReplaySource, spawn_feed};
    use crate::pipeline::registry::{ProgramRegistry, SYSTEM_PROGRAM_ID, TOKEN_PROGRAM_ID};
    use crate::pipeline::types::{
        InstructionKind, NATIVE_SOL_MINT, PoolState, StrategyDocument, StrategyReport, TradingPair,
        Transaction,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, Utc};
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use crate::pipeline::feed::EventSource;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    const WALLET: &str = "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU";
    const OTHER: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
    const RAYDIUM: &str = "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const UNREGISTERED: &str = "Fg6PaFpoGXkYsidMpWTK6W2BeZ7FEfcYkg476zPFsLnS";
    const JUPITER: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";
    const ROUTE: [u8; 8] = [0xe5, 0x17, 0xcb, 0x97, 0x7a, 0xe3, 0xad, 0x2a];
    const AMM: &str = "58oQChx4yWmvKdwLLZzBi4ChoCc2fqCUWBkwMihLYQo2";

    fn sig(n: u8) -> String {
        bs58::encode([n; 64]).into_string()
    }

    fn b58(data: &[u8]) -> String {
        bs58::encode(data).into_string()
    }

    fn raw(id: u64, payload: Value) -> RawEvent {
        RawEvent { source_sequence_id: id, payload: serde_json::to_vec(&payload).unwrap(), received_at: Utc::now() }
    }

    fn transfer_payload(n: u8, slot: u64) -> Value {
        let mut data = 2u32.to_le_bytes().to_vec();
        data.extend_from_slice(&1_000_000u64.to_le_bytes());
        json!({
            "slot": slot,
            "blockTime": 1_700_000_000,
            "transaction": {
                "signatures": [sig(n)],
                "message": {
                    "accountKeys": [WALLET, OTHER, SYSTEM_PROGRAM_ID, UNREGISTERED],
                    "instructions": [
                        {"programIdIndex": 2, "accounts": [0, 1], "data": b58(&data)},
                        {"programIdIndex": 3, "accounts": [0], "data": b58(&[1, 2, 3])}
                    ]
                }
            },
            "meta": {"err": null}
        })
    }

    /// Raydium swap of 2 SOL for 300 USDC; vaults end at 102 SOL / 14700 USDC.
    fn swap_payload(n: u8, slot: u64, failed: bool) -> Value {
        let wallet_wsol = "3Kz9jrnV1Cv1rJxWgBjsxkb8vT1f9xDDTL1e6nDZFYYU";
        let wallet_usdc = "5q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1";
        let vault_coin = "DQyrAcCrDXQ7NeoqGgDCZwBvWDcYmFCjSb9JtteuvPpz";
        let vault_pc = "HLmqeL62xR1QoZ1HKKbXRrdN1p3phKpxRMb2VVopvBBz";
        let authority = "5Q544fKrFoe6tsEbD7S8EmxGTJYAKtTVhAW5Q5pge4j1";

        let mut swap_data = vec![9u8];
        swap_data.extend_from_slice(&2_000_000_000u64.to_le_bytes());
        swap_data.extend_from_slice(&1u64.to_le_bytes());
        let token_transfer = |amount: u64| {
            let mut d = vec![3u8];
            d.extend_from_slice(&amount.to_le_bytes());
            b58(&d)
        };
        let balance = |index: usize, mint: &str, owner: &str, amount: &str, decimals: u32| {
            json!({"accountIndex": index, "mint": mint, "owner": owner,
                   "uiTokenAmount": {"amount": amount, "decimals": decimals}})
        };
        let err = if failed { json!({"InstructionError": [0, "Custom"]}) } else { Value::Null };

        json!({
            "slot": slot,
            "blockTime": 1_700_000_000,
            "transaction": {
                "signatures": [sig(n)],
                "message": {
                    "accountKeys": [WALLET, wallet_wsol, wallet_usdc, AMM, vault_coin, vault_pc, RAYDIUM, TOKEN_PROGRAM_ID, authority],
                    "instructions": [{"programIdIndex": 6, "accounts": [7, 3, 8, 8, 8, 4, 5, 1, 2, 0], "data": b58(&swap_data)}]
                }
            },
            "meta": {
                "err": err,
                "innerInstructions": [{
                    "index": 0,
                    "instructions": [
                        {"programIdIndex": 7, "accounts": [1, 4, 0], "data": token_transfer(2_000_000_000)},
                        {"programIdIndex": 7, "accounts": [5, 2, 8], "data": token_transfer(300_000_000)}
                    ]
                }],
                "preTokenBalances": [
                    balance(1, NATIVE_SOL_MINT, WALLET, "5000000000", 9),
                    balance(2, USDC, WALLET, "0", 6),
                    balance(4, NATIVE_SOL_MINT, authority, "100000000000", 9),
                    balance(5, USDC, authority, "15000000000", 6)
                ],
                "postTokenBalances": [
                    balance(1, NATIVE_SOL_MINT, WALLET, "3000000000", 9),
                    balance(2, USDC, WALLET, "300000000", 6),
                    balance(4, NATIVE_SOL_MINT, authority, "102000000000", 9),
                    balance(5, USDC, authority, "14700000000", 6)
                ]
            }
        })
    }

    /// The same swap routed through a Jupiter instruction.
    fn routed_swap_payload(n: u8, slot: u64) -> Value {
        let mut payload = swap_payload(n, slot, false);
        let message = &mut payload["transaction"]["message"];
        let direct = message["instructions"][0].take();
        if let Some(keys) = message["accountKeys"].as_array_mut() {
            keys.push(json!(JUPITER));
        }
        message["instructions"] = json!([{"programIdIndex": 9, "accounts": [7, 0, 1, 2], "data": b58(&ROUTE)}]);
        if let Some(inner) = payload["meta"]["innerInstructions"][0]["instructions"].as_array_mut() {
            inner.insert(0, direct);
        }
        payload
    }

    struct Harness {
        store: Arc<dyn Store>,
        pools: Arc<PoolTracker>,
        patterns: Arc<PatternBook>,
        health: Arc<PipelineHealth>,
    }

    impl Harness {
        fn new(store: Arc<dyn Store>) -> Self {
            Self {
                pools: Arc::new(PoolTracker::new(store.clone())),
                patterns: Arc::new(PatternBook::from_config(&Default::default())),
                health: Arc::new(PipelineHealth::new()),
                store,
            }
        }

        fn pipeline(&self, max_in_flight: usize) -> Arc<Pipeline> {
            let registry = ProgramRegistry::load_dir(Path::new("schemas")).unwrap();
            Arc::new(Pipeline::new(
                Decoder::new(Arc::new(registry), WALLET),
                self.store.clone(),
                self.pools.clone(),
                self.patterns.clone(),
                self.health.clone(),
                PipelineConfig { max_in_flight, storage_retry_attempts: 3, storage_retry_base_ms: 1 },
            ))
        }

        async fn run(&self, events: Vec<RawEvent>) -> Result<(), PipelineError> {
            let pipeline = self.pipeline(4);
            let (_stop, shutdown) = watch::channel(false);
            let (rx, feed) = spawn_feed(Box::new(ReplaySource::new(events)), 2, shutdown.clone());
            let result = pipeline.run(rx, shutdown).await;
            feed.await.unwrap().unwrap();
            result
        }
    }

    /// Fails the first `failures` ledger writes and the first
    /// `pool_failures` pool writes, then delegates. Writes of the `poisoned`
    /// signature always fail.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicU32,
        pool_failures: AtomicU32,
        poisoned: Option<String>,
        insert_delay: Duration,
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }

    fn connection_reset() -> PipelineError {
        PipelineError::StorageWrite("connection reset".to_string())
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures: AtomicU32::new(failures),
                pool_failures: AtomicU32::new(0),
                poisoned: None,
                insert_delay: Duration::ZERO,
            }
        }

        fn with_pool_failures(mut self, failures: u32) -> Self {
            self.pool_failures = AtomicU32::new(failures);
            self
        }

        fn poisoning(mut self, signature: String) -> Self {
            self.poisoned = Some(signature);
            self
        }

        fn with_insert_delay(mut self, delay: Duration) -> Self {
            self.insert_delay = delay;
            self
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn insert_transaction(&self, tx: &Transaction) -> Result<WriteOutcome, PipelineError> {
            if !self.insert_delay.is_zero() {
                tokio::time::sleep(self.insert_delay).await;
            }
            if self.poisoned.as_deref() == Some(tx.signature.as_str()) || take_failure(&self.failures) {
                return Err(connection_reset());
            }
            self.inner.insert_transaction(tx).await
        }
        async fn get_transaction(&self, signature: &str) -> Result<Option<StoredTransaction>, PipelineError> {
            self.inner.get_transaction(signature).await
        }
        async fn recent_transactions(&self, limit: usize) -> Result<Vec<StoredTransaction>, PipelineError> {
            self.inner.recent_transactions(limit).await
        }
        async fn ledger_snapshot(&self) -> Result<Vec<StoredTransaction>, PipelineError> {
            self.inner.ledger_snapshot().await
        }
        async fn transactions_by_pair(&self, pair: &TradingPair) -> Result<Vec<StoredTransaction>, PipelineError> {
            self.inner.transactions_by_pair(pair).await
        }
        async fn transactions_by_date(&self, date: NaiveDate) -> Result<Vec<StoredTransaction>, PipelineError> {
            self.inner.transactions_by_date(date).await
        }
        async fn count_since(&self, since: DateTime<Utc>) -> Result<u64, PipelineError> {
            self.inner.count_since(since).await
        }
        async fn transaction_count(&self) -> Result<u64, PipelineError> {
            self.inner.transaction_count().await
        }
        async fn load_cursor(&self) -> Result<Option<String>, PipelineError> {
            self.inner.load_cursor().await
        }
        async fn save_cursor(&self, signature: &str) -> Result<(), PipelineError> {
            self.inner.save_cursor(signature).await
        }
        async fn upsert_pool(&self, state: &PoolState) -> Result<bool, PipelineError> {
            if take_failure(&self.pool_failures) {
                return Err(connection_reset());
            }
            self.inner.upsert_pool(state).await
        }
        async fn load_pools(&self) -> Result<Vec<PoolState>, PipelineError> {
            self.inner.load_pools().await
        }
        async fn put_report(
            &self,
            date: NaiveDate,
            generated_at: DateTime<Utc>,
            document: &StrategyDocument,
        ) -> Result<StrategyReport, PipelineError> {
            self.inner.put_report(date, generated_at, document).await
        }
        async fn get_report(&self, date: NaiveDate) -> Result<Option<StrategyReport>, PipelineError> {
            self.inner.get_report(date).await
        }
        async fn reports_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<StrategyReport>, PipelineError> {
            self.inner.reports_between(from, to).await
        }
        async fn health_check(&self) -> Result<(), PipelineError> {
            self.inner.health_check().await
        }
        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_redelivered_signature_is_written_once() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        harness
            .run(vec![raw(1, transfer_payload(1, 10)), raw(2, transfer_payload(1, 10)), raw(3, transfer_payload(2, 11))])
            .await
            .unwrap();

        assert_eq!(harness.store.transaction_count().await.unwrap(), 2);
        let health = harness.health.snapshot();
        assert_eq!(health.events_received, 3);
        assert_eq!(health.transactions_written, 2);
        assert_eq!(health.duplicates, 1);
        assert_eq!(health.status, PipelineStatus::Stopped);
        assert_eq!(harness.store.load_cursor().await.unwrap(), Some(sig(2)));
    }

    #[tokio::test]
    async fn test_undecodable_events_are_skipped() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        let garbage = RawEvent { source_sequence_id: 1, payload: b"not json".to_vec(), received_at: Utc::now() };
        harness.run(vec![garbage, raw(2, transfer_payload(3, 12))]).await.unwrap();

        let health = harness.health.snapshot();
        assert_eq!(health.decode_errors, 1);
        assert_eq!(health.transactions_written, 1);

        let stored = harness.store.get_transaction(&sig(3)).await.unwrap().unwrap();
        let kinds: Vec<InstructionKind> = stored.transaction.instructions.iter().map(|ix| ix.kind).collect();
        assert_eq!(kinds, vec![InstructionKind::Transfer, InstructionKind::Unknown]);
    }

    #[tokio::test]
    async fn test_successful_swap_updates_pool_and_failed_swap_does_not() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        harness.run(vec![raw(1, swap_payload(4, 100, true))]).await.unwrap();
        assert!(harness.pools.is_empty());

        harness.run(vec![raw(2, swap_payload(5, 101, false))]).await.unwrap();
        let pool = harness.pools.get(AMM).unwrap();
        assert_eq!(pool.reserve_a, Decimal::from(102));
        assert_eq!(pool.reserve_b, Decimal::from(14700));
        assert_eq!(pool.last_updated_slot, 101);
        assert_eq!(harness.store.load_pools().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_storage_failures_are_retried() {
        let harness = Harness::new(Arc::new(FlakyStore::new(2)));
        harness.run(vec![raw(1, transfer_payload(6, 20))]).await.unwrap();

        let health = harness.health.snapshot();
        assert_eq!(health.storage_retries, 2);
        assert_eq!(health.transactions_written, 1);
        assert_eq!(health.status, PipelineStatus::Stopped);
        assert!(harness.store.get_transaction(&sig(6)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistent_storage_failure_stops_pipeline() {
        let harness = Harness::new(Arc::new(FlakyStore::new(u32::MAX)));
        let result = harness.run(vec![raw(1, transfer_payload(7, 30))]).await;

        assert!(matches!(result, Err(PipelineError::StorageWrite(_))));
        let health = harness.health.snapshot();
        assert_eq!(health.status, PipelineStatus::Failed);
        assert_eq!(health.storage_retries, 3);
        assert_eq!(health.transactions_written, 0);
    }

    #[tokio::test]
    async fn test_redelivery_completes_pool_update_lost_after_ledger_write() {
        // every attempt of the first delivery fails on the pool store
        let harness = Harness::new(Arc::new(FlakyStore::new(0).with_pool_failures(4)));
        let first = harness.run(vec![raw(1, swap_payload(8, 200, false))]).await;
        assert!(matches!(first, Err(PipelineError::StorageWrite(_))));
        assert!(harness.store.get_transaction(&sig(8)).await.unwrap().is_some());
        assert!(harness.pools.get(AMM).is_none());
        assert!(harness.store.load_pools().await.unwrap().is_empty());

        harness.run(vec![raw(2, swap_payload(8, 200, false))]).await.unwrap();
        let pool = harness.pools.get(AMM).unwrap();
        assert_eq!(pool.last_updated_slot, 200);
        assert_eq!(pool.reserve_b, Decimal::from(14700));
        let persisted = harness.store.load_pools().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].last_updated_slot, 200);

        let health = harness.health.snapshot();
        assert_eq!(health.transactions_written, 1);
        assert_eq!(health.duplicates, 1);
        assert_eq!(health.stale_pool_updates, 0);
        assert_eq!(health.status, PipelineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_cursor_stays_below_permanently_failed_event() {
        let harness = Harness::new(Arc::new(FlakyStore::new(0).poisoning(sig(20))));
        let result = harness
            .run(vec![raw(1, transfer_payload(19, 9)), raw(2, transfer_payload(20, 10)), raw(3, transfer_payload(21, 11))])
            .await;

        assert!(matches!(result, Err(PipelineError::StorageWrite(_))));
        assert!(harness.store.get_transaction(&sig(20)).await.unwrap().is_none());
        // sig(21) may have been written, but the cursor must not skip sig(20)
        assert_eq!(harness.store.load_cursor().await.unwrap(), Some(sig(19)));
    }

    #[test]
    fn test_watermark_advances_over_contiguous_completions() {
        let mut watermark = Watermark::default();
        let (a, b, c, d) = (watermark.admit(), watermark.admit(), watermark.admit(), watermark.admit());

        assert_eq!(watermark.complete(c, Some("c".to_string())), None);
        assert_eq!(watermark.complete(b, None), None);
        assert_eq!(watermark.complete(a, Some("a".to_string())), Some("c".to_string()));
        assert_eq!(watermark.complete(d, None), None);
        assert!(watermark.slots.is_empty());

        let e = watermark.admit();
        assert_eq!(e, 4);
        assert_eq!(watermark.complete(e, Some("e".to_string())), Some("e".to_string()));
    }

    #[tokio::test]
    async fn test_routed_swap_tracks_inner_pool() {
        let harness = Harness::new(Arc::new(MemoryStore::new()));
        harness.run(vec![raw(1, routed_swap_payload(9, 300))]).await.unwrap();

        let pool = harness.pools.get(AMM).unwrap();
        assert_eq!(pool.last_updated_slot, 300);
        assert_eq!(pool.reserve_a, Decimal::from(102));
        assert_eq!(harness.store.load_pools().await.unwrap().len(), 1);

        let stored = harness.store.get_transaction(&sig(9)).await.unwrap().unwrap();
        assert_eq!(stored.transaction.instructions[0].program.name(), "jupiter_v6");
        assert!(stored.transaction.trading_pair().is_some());
    }

    /// Never yields; stands in for a live feed waiting on the network.
    struct IdleSource;

    #[async_trait]
    impl EventSource for IdleSource {
        async fn next_event(&mut self) -> Result<Option<RawEvent>, PipelineError> {
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "idle".to_string()
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_buffered_and_in_flight_events() {
        let harness = Harness::new(Arc::new(FlakyStore::new(0).with_insert_delay(Duration::from_millis(20))));
        let pipeline = harness.pipeline(2);

        let (events_tx, events_rx) = mpsc::channel(8);
        for n in 0..6u8 {
            events_tx.send(raw(n as u64, transfer_payload(40 + n, 50 + n as u64))).await.unwrap();
        }

        let (stop, shutdown) = watch::channel(false);
        let (_feed_rx, feed) = spawn_feed(Box::new(IdleSource), 1, shutdown.clone());
        let ingest = tokio::spawn(pipeline.run(events_rx, shutdown));

        // let the first workers start their writes
        tokio::time::sleep(Duration::from_millis(5)).await;
        stop.send(true).unwrap();

        ingest.await.unwrap().unwrap();
        feed.await.unwrap().unwrap();

        assert_eq!(harness.store.transaction_count().await.unwrap(), 6);
        let health = harness.health.snapshot();
        assert_eq!(health.events_received, 6);
        assert_eq!(health.transactions_written, 6);
        assert_eq!(health.status, PipelineStatus::Stopped);
        assert_eq!(harness.store.load_cursor().await.unwrap(), Some(sig(45)));
        // the sender was never dropped; shutdown alone ended the run
        assert!(events_tx.is_closed());
    }
}
