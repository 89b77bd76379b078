use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Starting,
    Running,
    /// Feed is reconnecting or storage writes are being retried.
    Degraded,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynthesisStatus {
    pub at: DateTime<Utc>,
    pub report_date: NaiveDate,
    pub succeeded: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: PipelineStatus,
    pub events_received: u64,
    pub transactions_written: u64,
    pub duplicates: u64,
    pub decode_errors: u64,
    pub storage_retries: u64,
    pub stale_pool_updates: u64,
    pub feed_reconnects: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_synthesis: Option<SynthesisStatus>,
}

/// Liveness counters shared by the feed, ingest workers and synthesizer.
pub struct PipelineHealth {
    status: RwLock<PipelineStatus>,
    events_received: AtomicU64,
    transactions_written: AtomicU64,
    duplicates: AtomicU64,
    decode_errors: AtomicU64,
    storage_retries: AtomicU64,
    stale_pool_updates: AtomicU64,
    feed_reconnects: AtomicU64,
    last_event_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    last_synthesis: RwLock<Option<SynthesisStatus>>,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self {
            status: RwLock::new(PipelineStatus::Starting),
            events_received: AtomicU64::new(0),
            transactions_written: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            storage_retries: AtomicU64::new(0),
            stale_pool_updates: AtomicU64::new(0),
            feed_reconnects: AtomicU64::new(0),
            last_event_at: RwLock::new(None),
            last_error: RwLock::new(None),
            last_synthesis: RwLock::new(None),
        }
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: PipelineStatus) {
        let mut current = self.status.write();
        // Failed is terminal
        if *current != PipelineStatus::Failed {
            *current = status;
        }
    }

    pub fn status(&self) -> PipelineStatus {
        *self.status.read()
    }

    pub fn record_event(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        *self.last_event_at.write() = Some(Utc::now());
    }

    pub fn record_written(&self) {
        self.transactions_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self, error: impl ToString) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
    }

    pub fn record_storage_retry(&self, error: impl ToString) {
        self.storage_retries.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
        self.set_status(PipelineStatus::Degraded);
    }

    pub fn record_stale_update(&self) {
        self.stale_pool_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self, error: impl ToString) {
        self.feed_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
        self.set_status(PipelineStatus::Degraded);
    }

    pub fn record_failure(&self, error: impl ToString) {
        *self.last_error.write() = Some(error.to_string());
        *self.status.write() = PipelineStatus::Failed;
    }

    pub fn record_synthesis(&self, status: SynthesisStatus) {
        *self.last_synthesis.write() = Some(status);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.status(),
            events_received: self.events_received.load(Ordering::Relaxed),
            transactions_written: self.transactions_written.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            storage_retries: self.storage_retries.load(Ordering::Relaxed),
            stale_pool_updates: self.stale_pool_updates.load(Ordering::Relaxed),
            feed_reconnects: self.feed_reconnects.load(Ordering::Relaxed),
            last_event_at: *self.last_event_at.read(),
            last_error: self.last_error.read().clone(),
            last_synthesis: self.last_synthesis.read().clone(),
        }
    }
}
