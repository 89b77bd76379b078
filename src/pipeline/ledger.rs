//! # Deduplicating Ledger Writer
//!
//! First writer wins per signature. Writes for the same signature are
//! serialized through a per-key lock; different signatures proceed
//! concurrently and rely on the store's atomic append.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::types::{PipelineError, Transaction};
use crate::database::{Store, WriteOutcome};

/// Async mutual exclusion per string key. Entries are dropped once no task
/// holds or waits for them.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

pub struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.owner.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        KeyGuard { owner: self, key: key.to_string(), guard: Some(guard) }
    }

    /// Keys currently held or awaited.
    #[cfg(test)]
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

pub struct LedgerWriter {
    store: Arc<dyn Store>,
    locks: KeyedLocks,
}

impl LedgerWriter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, locks: KeyedLocks::new() }
    }

    pub async fn write(&self, tx: &Transaction) -> Result<WriteOutcome, PipelineError> {
        let _guard = self.locks.lock(&tx.signature).await;
        let outcome = self.store.insert_transaction(tx).await?;
        if let WriteOutcome::Duplicate(existing) = &outcome {
            debug!("Duplicate signature {} (stored as #{})", tx.signature, existing.seq);
        }
        Ok(outcome)
    }
}
