//! # Pool Tracker
//!
//! Best-known reserves and price per pool, fed by swap and liquidity
//! instructions. An update is accepted only when its slot is strictly newer
//! than the pool's `last_updated_slot`, so the final state does not depend
//! on delivery order.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use tracing::debug;

use super::types::{PipelineError, PoolObservation, PoolState, Transaction};
use crate::database::Store;

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(PoolState),
    /// Update at or behind the stored slot; ignored.
    Stale { pool_address: String, slot: u64, last_updated_slot: u64 },
}

pub struct PoolTracker {
    pools: DashMap<String, PoolState>,
    store: Arc<dyn Store>,
}

fn state_from(observation: &PoolObservation, slot: u64, previous: Option<&PoolState>) -> PoolState {
    let last_price = observation
        .reserve_b
        .checked_div(observation.reserve_a)
        .or_else(|| previous.map(|p| p.last_price))
        .unwrap_or(Decimal::ZERO)
        .normalize();
    PoolState {
        pool_address: observation.address.clone(),
        token_a: observation.token_a.clone(),
        token_b: observation.token_b.clone(),
        reserve_a: observation.reserve_a,
        reserve_b: observation.reserve_b,
        last_price,
        last_updated_slot: slot,
    }
}

/// Pool states as they stood after `transactions`, rebuilt from the
/// observations they carry. Same slot rule as the live tracker.
pub fn replay<'a>(transactions: impl IntoIterator<Item = &'a Transaction>) -> Vec<PoolState> {
    let mut pools: BTreeMap<String, PoolState> = BTreeMap::new();
    for tx in transactions.into_iter().filter(|tx| tx.is_success()) {
        for observation in tx.instructions.iter().flat_map(|ix| ix.pool_observations()) {
            let previous = pools.get(&observation.address);
            if previous.is_some_and(|p| tx.slot <= p.last_updated_slot) {
                continue;
            }
            let state = state_from(observation, tx.slot, previous);
            pools.insert(observation.address.clone(), state);
        }
    }
    pools.into_values().collect()
}

impl PoolTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { pools: DashMap::new(), store }
    }

    /// Loads persisted pool states; returns how many were restored.
    pub async fn hydrate(&self) -> Result<usize, PipelineError> {
        let pools = self.store.load_pools().await?;
        let count = pools.len();
        for pool in pools {
            self.pools.insert(pool.pool_address.clone(), pool);
        }
        Ok(count)
    }

    /// Applies an observation to the in-memory view only.
    pub fn apply(&self, observation: &PoolObservation, slot: u64) -> ApplyOutcome {
        match self.pools.entry(observation.address.clone()) {
            Entry::Vacant(vacant) => {
                let state = state_from(observation, slot, None);
                vacant.insert(state.clone());
                ApplyOutcome::Applied(state)
            }
            Entry::Occupied(mut current) => {
                let last_updated_slot = current.get().last_updated_slot;
                if slot <= last_updated_slot {
                    debug!(
                        "Stale pool update for {} at slot {} (have {})",
                        observation.address, slot, last_updated_slot
                    );
                    return ApplyOutcome::Stale {
                        pool_address: observation.address.clone(),
                        slot,
                        last_updated_slot,
                    };
                }
                let state = state_from(observation, slot, Some(current.get()));
                current.insert(state.clone());
                ApplyOutcome::Applied(state)
            }
        }
    }

    /// Persists first, then updates memory, so a failed write can be retried.
    pub async fn apply_and_persist(
        &self,
        observation: &PoolObservation,
        slot: u64,
    ) -> Result<ApplyOutcome, PipelineError> {
        let previous = self.get(&observation.address);
        if let Some(prev) = &previous {
            if slot <= prev.last_updated_slot {
                debug!(
                    "Stale pool update for {} at slot {} (have {})",
                    observation.address, slot, prev.last_updated_slot
                );
                return Ok(ApplyOutcome::Stale {
                    pool_address: observation.address.clone(),
                    slot,
                    last_updated_slot: prev.last_updated_slot,
                });
            }
        }

        let candidate = state_from(observation, slot, previous.as_ref());
        if !self.store.upsert_pool(&candidate).await? {
            // another writer already stored a newer slot; adopt it
            let stored = self
                .store
                .load_pools()
                .await?
                .into_iter()
                .find(|p| p.pool_address == observation.address);
            let last_updated_slot = stored.as_ref().map_or(slot, |p| p.last_updated_slot);
            debug!(
                "Store kept pool {} at slot {}, candidate slot {} rejected",
                observation.address, last_updated_slot, slot
            );
            if let Some(stored) = stored {
                self.pools
                    .entry(stored.pool_address.clone())
                    .and_modify(|current| {
                        if stored.last_updated_slot > current.last_updated_slot {
                            *current = stored.clone();
                        }
                    })
                    .or_insert(stored);
            }
            return Ok(ApplyOutcome::Stale { pool_address: observation.address.clone(), slot, last_updated_slot });
        }
        Ok(self.apply(observation, slot))
    }

    pub fn get(&self, pool_address: &str) -> Option<PoolState> {
        self.pools.get(pool_address).map(|entry| entry.value().clone())
    }

    /// All pools ordered by address.
    pub fn snapshot(&self) -> Vec<PoolState> {
        let mut pools: Vec<PoolState> = self.pools.iter().map(|e| e.value().clone()).collect();
        pools.sort_by(|a, b| a.pool_address.cmp(&b.pool_address));
        pools
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
