//! # Strategy Synthesizer
//!
//! Aggregates a point-in-time ledger cut, pool snapshots and freshly
//! recomputed patterns into an [`AnalysisRequest`], submits it to the
//! analysis service under a deadline and stores the returned document as the
//! report for the requested date. Nothing is written unless the whole cycle
//! succeeds, so a failed cycle leaves every existing report untouched.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use super::analysis_client::AnalysisService;
use super::health::{PipelineHealth, SynthesisStatus};
use super::patterns::{PatternBook, TradeObservation};
use super::pool_tracker::{self, PoolTracker};
use super::types::{
    AnalysisRequest, LedgerTotals, PairStatistics, PipelineError, PoolState, PriceTrend,
    StrategyReport, TradeSide, TradingPair,
};
use crate::config::SynthesisConfig;
use crate::database::{Store, StoredTransaction};

/// Price change, in percent, beyond which a pair is trending.
const TREND_THRESHOLD_PCT: f64 = 5.0;

pub struct Synthesizer {
    store: Arc<dyn Store>,
    pools: Arc<PoolTracker>,
    patterns: Arc<PatternBook>,
    service: Arc<dyn AnalysisService>,
    health: Arc<PipelineHealth>,
    wallet: String,
    timeout: Duration,
    lookback_days: u32,
    // one cycle at a time, whether scheduled or on demand
    cycle: Mutex<()>,
}

impl Synthesizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        pools: Arc<PoolTracker>,
        patterns: Arc<PatternBook>,
        service: Arc<dyn AnalysisService>,
        health: Arc<PipelineHealth>,
        wallet: String,
        timeout: Duration,
        lookback_days: u32,
    ) -> Self {
        Self {
            store,
            pools,
            patterns,
            service,
            health,
            wallet,
            timeout,
            lookback_days: lookback_days.max(1),
            cycle: Mutex::new(()),
        }
    }

    pub async fn synthesize(&self, as_of: NaiveDate) -> Result<StrategyReport, PipelineError> {
        let _cycle = self.cycle.lock().await;
        let result = self.run_cycle(as_of).await;

        let status = match &result {
            Ok(report) => {
                info!("📝 Strategy report for {} stored (version {})", as_of, report.version);
                SynthesisStatus { at: Utc::now(), report_date: as_of, succeeded: true, detail: None }
            }
            Err(e) => {
                error!("❌ Strategy synthesis for {} failed: {}", as_of, e);
                SynthesisStatus {
                    at: Utc::now(),
                    report_date: as_of,
                    succeeded: false,
                    detail: Some(e.to_string()),
                }
            }
        };
        self.health.record_synthesis(status);
        result
    }

    async fn run_cycle(&self, as_of: NaiveDate) -> Result<StrategyReport, PipelineError> {
        let request = self.build_request(as_of).await?;
        info!(
            "📊 Synthesizing {} from {} pairs, {} pools, {} patterns",
            as_of,
            request.pair_statistics.len(),
            request.pools.len(),
            request.patterns.len()
        );

        let document = tokio::time::timeout(self.timeout, self.service.analyze(&request))
            .await
            .map_err(|_| PipelineError::SynthesisTimeout(self.timeout))??;
        document.validate()?;

        self.store.put_report(as_of, Utc::now(), &document).await
    }

    pub async fn build_request(&self, as_of: NaiveDate) -> Result<AnalysisRequest, PipelineError> {
        let cut = self.patterns.recompute(self.store.as_ref()).await?;

        let window_end = end_of_day(as_of);
        let window_start = window_end - chrono::Duration::days(self.lookback_days as i64);
        let up_to_date: Vec<&StoredTransaction> = cut
            .transactions
            .iter()
            .filter(|t| t.transaction.block_time < window_end)
            .collect();
        let in_window: Vec<&StoredTransaction> = up_to_date
            .iter()
            .copied()
            .filter(|t| t.transaction.block_time >= window_start)
            .collect();

        let totals = LedgerTotals {
            transaction_count: up_to_date.len() as u64,
            failed_count: up_to_date.iter().filter(|t| !t.transaction.is_success()).count() as u64,
            window_transaction_count: in_window.len() as u64,
        };

        // a past date sees only what the ledger held at its end
        let (pools, patterns) = if up_to_date.len() == cut.transactions.len() {
            (self.pools.snapshot(), cut.patterns)
        } else {
            (
                pool_tracker::replay(up_to_date.iter().map(|t| &t.transaction)),
                self.patterns.evaluate_until(&cut.transactions, window_end),
            )
        };

        Ok(AnalysisRequest {
            request_id: uuid::Uuid::new_v4(),
            wallet: self.wallet.clone(),
            as_of,
            lookback_days: self.lookback_days,
            totals,
            pair_statistics: pair_statistics(&in_window, &pools),
            pools,
            patterns,
        })
    }

    /// Runs synthesis for the current UTC date on an adaptive interval until
    /// shutdown is signalled.
    pub async fn run_schedule(self: Arc<Self>, config: SynthesisConfig, mut shutdown: watch::Receiver<bool>) {
        let mut delay = Duration::from_secs(config.initial_delay_secs);
        info!("⏰ Strategy synthesis scheduled, first run in {:?}", delay);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    info!("🛑 Synthesis scheduler stopping");
                    break;
                }
            }

            let today = Utc::now().date_naive();
            delay = match self.synthesize(today).await {
                Ok(_) => {
                    let since = Utc::now() - chrono::Duration::hours(24);
                    let recent = match self.store.count_since(since).await {
                        Ok(count) => count,
                        Err(e) => {
                            warn!("Could not count recent transactions: {}", e);
                            0
                        }
                    };
                    let next = config.interval_for(recent);
                    info!("⏰ {} transactions in the last 24h, next synthesis in {:?}", recent, next);
                    next
                }
                Err(_) => Duration::from_secs(config.failure_retry_secs),
            };
        }
    }
}

fn end_of_day(date: NaiveDate) -> DateTime<Utc> {
    let next = date.succ_opt().unwrap_or(date);
    next.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Default)]
struct PairAccumulator {
    trade_count: u64,
    buy_count: u64,
    sell_count: u64,
    volume: BTreeMap<String, Decimal>,
    first_price: Option<Decimal>,
    last_price: Option<Decimal>,
}

/// Per-pair trade statistics over the window, in ledger append order
/// re-sorted by block time.
pub fn pair_statistics(transactions: &[&StoredTransaction], pools: &[PoolState]) -> Vec<PairStatistics> {
    let mut trades: Vec<(TradingPair, TradeObservation)> =
        transactions.iter().filter_map(|t| TradeObservation::from_stored(t)).collect();
    trades.sort_by(|a, b| {
        (a.1.block_time, &a.1.signature).cmp(&(b.1.block_time, &b.1.signature))
    });

    let mut by_pair: BTreeMap<TradingPair, PairAccumulator> = BTreeMap::new();
    for (pair, trade) in trades {
        let acc = by_pair.entry(pair.clone()).or_default();
        acc.trade_count += 1;
        match trade.side {
            TradeSide::Buy => acc.buy_count += 1,
            TradeSide::Sell => acc.sell_count += 1,
        }
        *acc.volume.entry(pair.base.clone()).or_default() += trade.base_amount;
        *acc.volume.entry(pair.quote.clone()).or_default() += trade.quote_amount;
        if let Some(price) = trade.price {
            acc.first_price.get_or_insert(price);
            acc.last_price = Some(price);
        }
    }

    by_pair
        .into_iter()
        .map(|(pair, acc)| {
            let price_change_pct = match (acc.first_price, acc.last_price) {
                (Some(first), Some(last)) if !first.is_zero() => {
                    ((last - first) / first * Decimal::from(100)).to_f64()
                }
                _ => None,
            };
            let trend = match price_change_pct {
                Some(pct) if pct > TREND_THRESHOLD_PCT => PriceTrend::Bullish,
                Some(pct) if pct < -TREND_THRESHOLD_PCT => PriceTrend::Bearish,
                _ => PriceTrend::Sideways,
            };

            let mut liquidity: BTreeMap<String, Decimal> = BTreeMap::new();
            for pool in pools.iter().filter(|p| TradingPair::new(&p.token_a, &p.token_b) == pair) {
                *liquidity.entry(pool.token_a.clone()).or_default() += pool.reserve_a;
                *liquidity.entry(pool.token_b.clone()).or_default() += pool.reserve_b;
            }

            PairStatistics {
                pair,
                trade_count: acc.trade_count,
                buy_count: acc.buy_count,
                sell_count: acc.sell_count,
                volume: acc.volume,
                first_price: acc.first_price,
                last_price: acc.last_price,
                price_change_pct,
                trend,
                liquidity,
            }
        })
        .collect()
}
