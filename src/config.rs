//! Configuration module for environment variables and application settings

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use solana_sdk::pubkey::Pubkey;

#[derive(Debug, Clone)]
pub struct Config {
    pub wallet: WalletConfig,
    pub feed: FeedConfig,
    pub registry: RegistryConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub patterns: PatternConfig,
    pub synthesis: SynthesisConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Monitored wallet, validated as a base58 public key
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub rpc_url: String,
    pub poll_interval_ms: u64,
    /// Signatures requested per getSignaturesForAddress page
    pub page_limit: usize,
    pub channel_capacity: usize,
    pub max_reconnects: u32,
    pub reconnect_base_ms: u64,
    /// History walked on a cold start, 0 for the latest page only
    pub backfill_hours: u64,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub schema_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// In-memory store when unset
    pub url: Option<String>,
    pub max_connections: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct PatternConfig {
    pub frequent_pair_window_hours: i64,
    pub frequent_pair_min_trades: usize,
    pub timing_min_occurrences: usize,
    pub timing_min_distinct_days: usize,
    pub sizing_min_trades: usize,
    /// Maximum coefficient of variation of the sold amount
    pub sizing_max_variation: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            frequent_pair_window_hours: 24,
            frequent_pair_min_trades: 5,
            timing_min_occurrences: 3,
            timing_min_distinct_days: 2,
            sizing_min_trades: 4,
            sizing_max_variation: 0.15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Days of ledger history summarised into each request
    pub lookback_days: u32,
    pub initial_delay_secs: u64,
    pub high_activity_threshold: u64,
    pub medium_activity_threshold: u64,
    pub high_activity_interval_hours: u64,
    pub medium_activity_interval_hours: u64,
    pub low_activity_interval_hours: u64,
    /// Delay before the next attempt after a failed cycle
    pub failure_retry_secs: u64,
}

impl SynthesisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay until the next synthesis given the last 24h transaction count.
    pub fn interval_for(&self, recent_tx_count: u64) -> Duration {
        let hours = if recent_tx_count > self.high_activity_threshold {
            self.high_activity_interval_hours
        } else if recent_tx_count > self.medium_activity_threshold {
            self.medium_activity_interval_hours
        } else {
            self.low_activity_interval_hours
        };
        Duration::from_secs(hours * 3600)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_in_flight: usize,
    pub storage_retry_attempts: u32,
    pub storage_retry_base_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { max_in_flight: 8, storage_retry_attempts: 5, storage_retry_base_ms: 200 }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let wallet = lookup("WALLET_ADDRESS")
            .ok_or_else(|| anyhow!("WALLET_ADDRESS environment variable is required"))?;
        Pubkey::from_str(wallet.trim())
            .map_err(|e| anyhow!("WALLET_ADDRESS is not a valid public key: {}", e))?;

        let api_key = lookup("ANALYSIS_API_KEY")
            .ok_or_else(|| anyhow!("ANALYSIS_API_KEY environment variable is required"))?;

        let defaults = PatternConfig::default();
        let pipeline_defaults = PipelineConfig::default();

        Ok(Self {
            wallet: WalletConfig { address: wallet.trim().to_string() },

            feed: FeedConfig {
                rpc_url: lookup("RPC_URL")
                    .unwrap_or_else(|| "https://api.mainnet-beta.solana.com".to_string()),
                poll_interval_ms: parse_or(&lookup, "FEED_POLL_INTERVAL_MS", 2_000),
                page_limit: parse_or(&lookup, "FEED_PAGE_LIMIT", 100usize).clamp(1, 1000),
                channel_capacity: parse_or(&lookup, "FEED_CHANNEL_CAPACITY", 256usize).max(1),
                max_reconnects: parse_or(&lookup, "FEED_MAX_RECONNECTS", 10),
                reconnect_base_ms: parse_or(&lookup, "FEED_RECONNECT_BASE_MS", 500),
                backfill_hours: parse_or(&lookup, "FEED_BACKFILL_HOURS", 24),
            },

            registry: RegistryConfig {
                schema_dir: PathBuf::from(lookup("SCHEMA_DIR").unwrap_or_else(|| "schemas".to_string())),
            },

            database: DatabaseConfig {
                url: lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()),
                max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 16),
            },

            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse_or(&lookup, "SERVER_PORT", 3000),
            },

            patterns: PatternConfig {
                frequent_pair_window_hours: parse_or(
                    &lookup,
                    "PATTERN_FREQUENT_PAIR_WINDOW_HOURS",
                    defaults.frequent_pair_window_hours,
                ),
                frequent_pair_min_trades: parse_or(
                    &lookup,
                    "PATTERN_FREQUENT_PAIR_MIN_TRADES",
                    defaults.frequent_pair_min_trades,
                ),
                timing_min_occurrences: parse_or(
                    &lookup,
                    "PATTERN_TIMING_MIN_OCCURRENCES",
                    defaults.timing_min_occurrences,
                ),
                timing_min_distinct_days: parse_or(
                    &lookup,
                    "PATTERN_TIMING_MIN_DISTINCT_DAYS",
                    defaults.timing_min_distinct_days,
                ),
                sizing_min_trades: parse_or(&lookup, "PATTERN_SIZING_MIN_TRADES", defaults.sizing_min_trades),
                sizing_max_variation: parse_or(
                    &lookup,
                    "PATTERN_SIZING_MAX_VARIATION",
                    defaults.sizing_max_variation,
                ),
            },

            synthesis: SynthesisConfig {
                api_key,
                base_url: lookup("ANALYSIS_BASE_URL")
                    .unwrap_or_else(|| "https://ark.cn-beijing.volces.com/api/v3".to_string()),
                model: lookup("ANALYSIS_MODEL").unwrap_or_else(|| "deepseek-v3-250324".to_string()),
                timeout_secs: parse_or(&lookup, "ANALYSIS_TIMEOUT_SECS", 120),
                temperature: parse_or(&lookup, "ANALYSIS_TEMPERATURE", 0.3),
                max_tokens: parse_or(&lookup, "ANALYSIS_MAX_TOKENS", 4000),
                lookback_days: parse_or(&lookup, "ANALYSIS_LOOKBACK_DAYS", 7),
                initial_delay_secs: parse_or(&lookup, "SYNTHESIS_INITIAL_DELAY_SECS", 60),
                high_activity_threshold: parse_or(&lookup, "SYNTHESIS_HIGH_ACTIVITY_TX", 1000),
                medium_activity_threshold: parse_or(&lookup, "SYNTHESIS_MEDIUM_ACTIVITY_TX", 500),
                high_activity_interval_hours: parse_or(&lookup, "SYNTHESIS_HIGH_ACTIVITY_HOURS", 6),
                medium_activity_interval_hours: parse_or(&lookup, "SYNTHESIS_MEDIUM_ACTIVITY_HOURS", 12),
                low_activity_interval_hours: parse_or(&lookup, "SYNTHESIS_LOW_ACTIVITY_HOURS", 24),
                failure_retry_secs: parse_or(&lookup, "SYNTHESIS_FAILURE_RETRY_SECS", 300),
            },

            pipeline: PipelineConfig {
                max_in_flight: parse_or(&lookup, "MAX_IN_FLIGHT", pipeline_defaults.max_in_flight).max(1),
                storage_retry_attempts: parse_or(
                    &lookup,
                    "STORAGE_RETRY_ATTEMPTS",
                    pipeline_defaults.storage_retry_attempts,
                ),
                storage_retry_base_ms: parse_or(
                    &lookup,
                    "STORAGE_RETRY_BASE_MS",
                    pipeline_defaults.storage_retry_base_ms,
                ),
            },
        })
    }
}
