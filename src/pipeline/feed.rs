//! # Event Source Adapter
//!
//! Normalizes the upstream feed into [`RawEvent`]s pushed onto a bounded
//! channel. The RPC source polls `getSignaturesForAddress` with the newest
//! signature it has seen as `until` cursor, so a reconnect or a restart
//! resumes without gaps; delivery is at-least-once and may repeat. Without
//! a cursor it backfills the configured window of history first.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::health::PipelineHealth;
use super::types::{PipelineError, RawEvent};
use crate::config::FeedConfig;

/// Transactions fetched concurrently per batch.
const FETCH_CONCURRENCY: usize = 8;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait]
pub trait EventSource: Send {
    /// Next event, `Ok(None)` when the source is exhausted. An error means
    /// the source gave up reconnecting.
    async fn next_event(&mut self) -> Result<Option<RawEvent>, PipelineError>;

    fn describe(&self) -> String;
}

#[derive(Debug, Deserialize)]
struct SignatureInfo {
    signature: String,
    #[serde(rename = "blockTime", default)]
    block_time: Option<i64>,
}

/// How far back one `getSignaturesForAddress` walk reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageWindow {
    /// Everything newer than the cursor.
    UntilCursor,
    /// Cold start: everything with a block time at or after this unix time.
    Since(i64),
    /// Cold start with backfill disabled.
    LatestPage,
}

/// For one page, newest first: how many entries to keep and whether to
/// request the page before it.
fn page_step(page: &[SignatureInfo], page_limit: usize, window: PageWindow) -> (usize, bool) {
    let full = page.len() >= page_limit;
    match window {
        PageWindow::UntilCursor => (page.len(), full),
        PageWindow::LatestPage => (page.len(), false),
        PageWindow::Since(cutoff) => {
            // entries without a block time are kept and do not end the walk
            let kept = page.iter().take_while(|info| info.block_time.is_none_or(|t| t >= cutoff)).count();
            (kept, full && kept == page.len())
        }
    }
}

pub struct RpcPollingSource {
    client: Client,
    rpc_url: String,
    wallet: String,
    cursor: Option<String>,
    buffer: VecDeque<RawEvent>,
    next_sequence: u64,
    poll_interval: Duration,
    page_limit: usize,
    max_reconnects: u32,
    reconnect_base: Duration,
    /// Cold-start history window, `None` for the latest page only.
    backfill: Option<TimeDelta>,
    health: Arc<PipelineHealth>,
}

fn feed_err(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::FeedInterrupted(e.to_string())
}

/// Exponential backoff capped at 30s, plus up to one base interval of jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    exp.min(MAX_BACKOFF) + Duration::from_millis(jitter_ms)
}

impl RpcPollingSource {
    pub fn new(
        config: &FeedConfig,
        wallet: String,
        cursor: Option<String>,
        health: Arc<PipelineHealth>,
    ) -> Result<Self, PipelineError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            rpc_url: config.rpc_url.clone(),
            wallet,
            cursor,
            buffer: VecDeque::new(),
            next_sequence: 0,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            page_limit: config.page_limit,
            max_reconnects: config.max_reconnects,
            reconnect_base: Duration::from_millis(config.reconnect_base_ms.max(1)),
            backfill: (config.backfill_hours > 0).then(|| TimeDelta::hours(config.backfill_hours as i64)),
            health,
        })
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    async fn rpc_call(&self, method: &str, params: Value) -> Result<Value, PipelineError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_sequence,
            "method": method,
            "params": params
        });

        let response = self.client.post(&self.rpc_url).json(&body).send().await.map_err(feed_err)?;
        if !response.status().is_success() {
            return Err(feed_err(format!("{} returned HTTP {}", method, response.status())));
        }

        let mut json: Value = response.json().await.map_err(feed_err)?;
        if let Some(err) = json.get("error") {
            return Err(feed_err(format!("{} failed: {}", method, err)));
        }
        Ok(json["result"].take())
    }

    /// Signatures newer than the cursor, oldest first. Without a cursor the
    /// backfill window is walked instead.
    async fn new_signatures(&self) -> Result<Vec<String>, PipelineError> {
        let window = match (&self.cursor, self.backfill) {
            (Some(_), _) => PageWindow::UntilCursor,
            (None, Some(backfill)) => PageWindow::Since((Utc::now() - backfill).timestamp()),
            (None, None) => PageWindow::LatestPage,
        };
        let mut collected: Vec<String> = Vec::new();
        let mut before: Option<String> = None;

        loop {
            let mut options = json!({ "limit": self.page_limit, "commitment": "confirmed" });
            if let Some(until) = &self.cursor {
                options["until"] = json!(until);
            }
            if let Some(before) = &before {
                options["before"] = json!(before);
            }

            let result = self.rpc_call("getSignaturesForAddress", json!([self.wallet, options])).await?;
            let page: Vec<SignatureInfo> = serde_json::from_value(result).map_err(feed_err)?;
            let (kept, more) = page_step(&page, self.page_limit, window);
            collected.extend(page.into_iter().take(kept).map(|info| info.signature));

            if !more {
                break;
            }
            before = collected.last().cloned();
        }

        if window != PageWindow::UntilCursor {
            info!("⏪ Backfilled {} signatures for {}", collected.len(), self.wallet);
        }
        collected.reverse();
        Ok(collected)
    }

    /// Fetches new transactions into the buffer and advances the cursor past
    /// every transaction buffered. Returns how many were buffered.
    async fn poll_once(&mut self) -> Result<usize, PipelineError> {
        let signatures = self.new_signatures().await?;
        if signatures.is_empty() {
            return Ok(0);
        }
        debug!("{} new signatures for {}", signatures.len(), self.wallet);

        let mut buffered = 0;
        for chunk in signatures.chunks(FETCH_CONCURRENCY) {
            let fetches = chunk.iter().map(|signature| {
                self.rpc_call(
                    "getTransaction",
                    json!([signature, {
                        "encoding": "json",
                        "commitment": "confirmed",
                        "maxSupportedTransactionVersion": 0
                    }]),
                )
            });
            let results = join_all(fetches).await;

            for (signature, result) in chunk.iter().zip(results) {
                let value = result?;
                // not yet queryable; pick it up on the next poll
                if value.is_null() {
                    debug!("Transaction {} not available yet", signature);
                    return Ok(buffered);
                }
                self.buffer.push_back(RawEvent {
                    source_sequence_id: self.next_sequence,
                    payload: serde_json::to_vec(&value)?,
                    received_at: Utc::now(),
                });
                self.next_sequence += 1;
                self.cursor = Some(signature.clone());
                buffered += 1;
            }
        }
        Ok(buffered)
    }
}

#[async_trait]
impl EventSource for RpcPollingSource {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(Some(event));
            }

            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(self.poll_interval).await,
                Ok(_) => attempt = 0,
                Err(e) => {
                    if attempt >= self.max_reconnects {
                        error!("❌ Feed gave up after {} reconnect attempts: {}", attempt, e);
                        return Err(e);
                    }
                    let delay = backoff_delay(self.reconnect_base, attempt);
                    attempt += 1;
                    warn!("🔌 Feed error ({}), reconnect {} in {:?}", e, attempt, delay);
                    self.health.record_reconnect(&e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("rpc-poll {} for {}", self.rpc_url, self.wallet)
    }
}

/// Spawns the single producer task feeding `capacity`-bounded channel.
pub fn spawn_feed(
    mut source: Box<dyn EventSource>,
    capacity: usize,
    mut shutdown: watch::Receiver<bool>,
) -> (mpsc::Receiver<RawEvent>, JoinHandle<Result<(), PipelineError>>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    let handle = tokio::spawn(async move {
        info!("📡 Feed started: {}", source.describe());
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("🛑 Feed stopping");
                    return Ok(());
                }
                next = source.next_event() => next,
            };

            match next {
                Ok(Some(event)) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            info!("🛑 Feed stopping");
                            return Ok(());
                        }
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                debug!("Feed receiver dropped");
                                return Ok(());
                            }
                        }
                    }
                }
                Ok(None) => {
                    info!("Feed exhausted");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    });

    (rx, handle)
}

/// Replays a fixed list of events, then reports exhaustion.
pub struct ReplaySource {
    events: VecDeque<RawEvent>,
}

impl ReplaySource {
    pub fn new(events: Vec<RawEvent>) -> Self {
        Self { events: events.into() }
    }
}

#[async_trait]
impl EventSource for ReplaySource {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, PipelineError> {
        Ok(self.events.pop_front())
    }

    fn describe(&self) -> String {
        format!("replay of {} events", self.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: u64) -> RawEvent {
        RawEvent { source_sequence_id: id, payload: vec![], received_at: Utc::now() }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let first = backoff_delay(base, 0);
        assert!(first >= base && first <= base * 2);
        let third = backoff_delay(base, 2);
        assert!(third >= Duration::from_millis(400));
        assert!(backoff_delay(base, 30) <= MAX_BACKOFF + base);
    }

    fn page(block_times: &[Option<i64>]) -> Vec<SignatureInfo> {
        block_times
            .iter()
            .enumerate()
            .map(|(i, block_time)| SignatureInfo { signature: format!("sig-{}", i), block_time: *block_time })
            .collect()
    }

    #[test]
    fn test_backfill_pages_until_window_start() {
        let cutoff = PageWindow::Since(1_000);

        // full page entirely inside the window: keep all, ask for older
        assert_eq!(page_step(&page(&[Some(1_300), Some(1_200), Some(1_100)]), 3, cutoff), (3, true));
        // window start reached mid-page: stop there
        assert_eq!(page_step(&page(&[Some(1_100), Some(1_000), Some(900)]), 3, cutoff), (2, false));
        // short page means history is exhausted
        assert_eq!(page_step(&page(&[Some(1_100), None]), 3, cutoff), (2, false));
    }

    #[test]
    fn test_cursor_and_latest_page_windows() {
        let full = page(&[Some(5), Some(4)]);
        assert_eq!(page_step(&full, 2, PageWindow::UntilCursor), (2, true));
        assert_eq!(page_step(&full, 3, PageWindow::UntilCursor), (2, false));
        assert_eq!(page_step(&full, 2, PageWindow::LatestPage), (2, false));
    }

    #[test]
    fn test_signature_info_reads_block_time() {
        let infos: Vec<SignatureInfo> = serde_json::from_value(json!([
            {"signature": "a", "slot": 10, "blockTime": 1_700_000_000, "err": null},
            {"signature": "b", "slot": 9, "blockTime": null}
        ]))
        .unwrap();
        assert_eq!(infos[0].block_time, Some(1_700_000_000));
        assert_eq!(infos[1].block_time, None);
    }

    #[tokio::test]
    async fn test_spawn_feed_forwards_in_order() {
        let (_stop, shutdown) = watch::channel(false);
        let source = ReplaySource::new(vec![raw(1), raw(2), raw(3)]);
        let (mut rx, handle) = spawn_feed(Box::new(source), 1, shutdown);

        let mut ids = Vec::new();
        while let Some(event) = rx.recv().await {
            ids.push(event.source_sequence_id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_rpc_surfaces_feed_interrupted() {
        let config = FeedConfig {
            rpc_url: "http://127.0.0.1:1".to_string(),
            poll_interval_ms: 10,
            page_limit: 10,
            channel_capacity: 1,
            max_reconnects: 1,
            reconnect_base_ms: 1,
            backfill_hours: 24,
        };
        let health = Arc::new(PipelineHealth::new());
        let mut source = RpcPollingSource::new(
            &config,
            "7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU".to_string(),
            None,
            health.clone(),
        )
        .unwrap();

        assert!(matches!(source.next_event().await, Err(PipelineError::FeedInterrupted(_))));
        assert_eq!(health.snapshot().feed_reconnects, 1);
    }
}
