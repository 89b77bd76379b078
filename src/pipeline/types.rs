use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Mint used for native SOL amounts so lamport movements share the token delta map.
pub const NATIVE_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("feed interrupted: {0}")]
    FeedInterrupted(String),

    #[error("failed to decode transaction: {0}")]
    Decode(String),

    #[error("storage write failed: {0}")]
    StorageWrite(String),

    #[error("storage read failed: {0}")]
    StorageRead(String),

    #[error("analysis service timed out after {0:?}")]
    SynthesisTimeout(Duration),

    #[error("analysis service returned a malformed response: {0}")]
    SynthesisMalformedResponse(String),

    #[error("analysis service error: {0}")]
    AnalysisService(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PipelineError {
    /// Storage failures are the only ones the ingest loop retries with backoff.
    pub fn is_storage_write(&self) -> bool {
        matches!(self, PipelineError::StorageWrite(_))
    }
}

/// One record pulled from the upstream feed, before decoding.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub source_sequence_id: u64,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Success,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Success => "success",
            TxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value == "success" { TxStatus::Success } else { TxStatus::Failed }
    }
}

/// Program resolution, decided once at decode time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum ProgramRef {
    Known { name: String },
    Unknown,
}

impl ProgramRef {
    pub fn name(&self) -> &str {
        match self {
            ProgramRef::Known { name } => name,
            ProgramRef::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ProgramRef::Known { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionKind {
    Swap,
    Transfer,
    AddLiquidity,
    RemoveLiquidity,
    Other,
    Unknown,
}

impl InstructionKind {
    /// Instructions that move pool reserves.
    pub fn touches_pool(&self) -> bool {
        matches!(
            self,
            InstructionKind::Swap | InstructionKind::AddLiquidity | InstructionKind::RemoveLiquidity
        )
    }
}

/// Post-instruction reserves of a pool, read from its vault balances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolObservation {
    pub address: String,
    pub token_a: String,
    pub token_b: String,
    pub reserve_a: Decimal,
    pub reserve_b: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedInstruction {
    pub program_id: String,
    pub program: ProgramRef,
    pub instruction_name: String,
    pub kind: InstructionKind,
    pub accounts: Vec<String>,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    /// Signed change per mint, relative to the monitored wallet.
    #[serde(default)]
    pub amounts: BTreeMap<String, Decimal>,
    #[serde(default)]
    pub pool: Option<PoolObservation>,
    /// Pools of inner swaps this instruction routed through.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routed_pools: Vec<PoolObservation>,
    /// Base64 instruction data, kept when the layout is not understood.
    #[serde(default)]
    pub opaque_data: Option<String>,
}

impl DecodedInstruction {
    /// Every pool whose reserves this instruction moved, own pool first.
    pub fn pool_observations(&self) -> impl Iterator<Item = &PoolObservation> {
        let touches_pool = self.kind.touches_pool();
        self.pool.iter().chain(self.routed_pools.iter()).filter(move |_| touches_pool)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub fee_payer: String,
    pub instructions: Vec<DecodedInstruction>,
    pub status: TxStatus,
}

/// Sold and bought side of the swap instructions of one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapLeg {
    pub sold_mint: String,
    pub sold_amount: Decimal,
    pub bought_mint: String,
    pub bought_amount: Decimal,
}

impl SwapLeg {
    pub fn pair(&self) -> TradingPair {
        TradingPair::new(&self.sold_mint, &self.bought_mint)
    }

    /// Absolute amount moved of `mint` in this leg.
    pub fn amount_of(&self, mint: &str) -> Option<Decimal> {
        if mint == self.sold_mint {
            Some(self.sold_amount)
        } else if mint == self.bought_mint {
            Some(self.bought_amount)
        } else {
            None
        }
    }

    /// Quote units paid or received per base unit.
    pub fn implied_price(&self) -> Option<Decimal> {
        let pair = self.pair();
        let base = self.amount_of(&pair.base)?;
        let quote = self.amount_of(&pair.quote)?;
        if base.is_zero() { None } else { Some(quote / base) }
    }

    pub fn side(&self) -> TradeSide {
        if self.bought_mint == self.pair().base { TradeSide::Buy } else { TradeSide::Sell }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl Transaction {
    pub fn block_date(&self) -> NaiveDate {
        self.block_time.date_naive()
    }

    pub fn is_success(&self) -> bool {
        self.status == TxStatus::Success
    }

    /// Net token movement across all swap instructions, or None when the
    /// transaction did not swap one mint for another.
    pub fn swap_leg(&self) -> Option<SwapLeg> {
        let mut net: BTreeMap<&str, Decimal> = BTreeMap::new();
        for ix in self.instructions.iter().filter(|ix| ix.kind == InstructionKind::Swap) {
            for (mint, delta) in &ix.amounts {
                *net.entry(mint.as_str()).or_default() += *delta;
            }
        }

        let (sold_mint, sold) = net
            .iter()
            .filter(|(_, d)| d.is_sign_negative() && !d.is_zero())
            .min_by(|a, b| a.1.cmp(b.1))?;
        let (bought_mint, bought) = net
            .iter()
            .filter(|(_, d)| d.is_sign_positive() && !d.is_zero())
            .max_by(|a, b| a.1.cmp(b.1))?;

        Some(SwapLeg {
            sold_mint: sold_mint.to_string(),
            sold_amount: sold.abs(),
            bought_mint: bought_mint.to_string(),
            bought_amount: *bought,
        })
    }

    pub fn trading_pair(&self) -> Option<TradingPair> {
        self.swap_leg().map(|leg| leg.pair())
    }
}

/// Unordered mint pair in canonical (lexicographic) order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self { base: a.to_string(), quote: b.to_string() }
        } else {
            Self { base: b.to_string(), quote: a.to_string() }
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        let (a, b) = key.split_once('/')?;
        if a.is_empty() || b.is_empty() {
            return None;
        }
        Some(Self::new(a, b))
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub pool_address: String,
    pub token_a: String,
    pub token_b: String,
    pub reserve_a: Decimal,
    pub reserve_b: Decimal,
    pub last_price: Decimal,
    pub last_updated_slot: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    FrequentPair,
    RecurringTiming,
    ConsistentSizing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub pattern_type: PatternType,
    pub trading_pair: TradingPair,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u64,
    pub supporting_signatures: BTreeSet<String>,
    pub detail: String,
}

// ============================================================================
// STRATEGY DOCUMENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetSelection {
    pub liquidity_criteria: Value,
    pub volume_criteria: Value,
    pub price_criteria: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuyStrategy {
    pub trigger_conditions: Value,
    pub buy_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SellStrategy {
    pub take_profit: Value,
    pub stop_loss: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PositionManagement {
    pub scaling: Value,
    pub rebalancing: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskControl {
    pub max_position_size: Value,
    pub max_daily_loss: Value,
    pub correlation_management: Value,
}

/// The fixed schema returned by the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyDocument {
    pub target_selection: TargetSelection,
    pub buy_strategy: BuyStrategy,
    pub sell_strategy: SellStrategy,
    pub position_management: PositionManagement,
    pub risk_control: RiskControl,
}

impl StrategyDocument {
    /// Rejects documents where any leaf of the schema is null.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let leaves: [(&str, &Value); 12] = [
            ("target_selection.liquidity_criteria", &self.target_selection.liquidity_criteria),
            ("target_selection.volume_criteria", &self.target_selection.volume_criteria),
            ("target_selection.price_criteria", &self.target_selection.price_criteria),
            ("buy_strategy.trigger_conditions", &self.buy_strategy.trigger_conditions),
            ("buy_strategy.buy_parameters", &self.buy_strategy.buy_parameters),
            ("sell_strategy.take_profit", &self.sell_strategy.take_profit),
            ("sell_strategy.stop_loss", &self.sell_strategy.stop_loss),
            ("position_management.scaling", &self.position_management.scaling),
            ("position_management.rebalancing", &self.position_management.rebalancing),
            ("risk_control.max_position_size", &self.risk_control.max_position_size),
            ("risk_control.max_daily_loss", &self.risk_control.max_daily_loss),
            ("risk_control.correlation_management", &self.risk_control.correlation_management),
        ];

        for (path, value) in leaves {
            if value.is_null() {
                return Err(PipelineError::SynthesisMalformedResponse(format!(
                    "field {} is null",
                    path
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub report_date: NaiveDate,
    /// Incremented every time the report for this date is replaced.
    pub version: u32,
    pub generated_at: DateTime<Utc>,
    pub document: StrategyDocument,
}

// ============================================================================
// ANALYSIS REQUEST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceTrend {
    Bullish,
    Bearish,
    Sideways,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairStatistics {
    pub pair: TradingPair,
    pub trade_count: u64,
    pub buy_count: u64,
    pub sell_count: u64,
    /// Absolute amount traded per mint over the lookback window.
    pub volume: BTreeMap<String, Decimal>,
    pub first_price: Option<Decimal>,
    pub last_price: Option<Decimal>,
    pub price_change_pct: Option<f64>,
    pub trend: PriceTrend,
    /// Sum of known pool reserves for this pair, per mint.
    pub liquidity: BTreeMap<String, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub transaction_count: u64,
    pub failed_count: u64,
    pub window_transaction_count: u64,
}

/// Aggregate submitted to the external analysis service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub request_id: uuid::Uuid,
    pub wallet: String,
    pub as_of: NaiveDate,
    pub lookback_days: u32,
    pub totals: LedgerTotals,
    pub pair_statistics: Vec<PairStatistics>,
    pub pools: Vec<PoolState>,
    pub patterns: Vec<PatternRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        value.parse().expect("valid decimal literal")
    }

    fn swap_ix(amounts: &[(&str, &str)]) -> DecodedInstruction {
        DecodedInstruction {
            program_id: "prog".to_string(),
            program: ProgramRef::Known { name: "raydium_amm".to_string() },
            instruction_name: "swap_base_in".to_string(),
            kind: InstructionKind::Swap,
            accounts: vec![],
            args: BTreeMap::new(),
            amounts: amounts.iter().map(|(m, a)| (m.to_string(), dec(a))).collect(),
            pool: None,
            routed_pools: vec![],
            opaque_data: None,
        }
    }

    fn observation(address: &str) -> PoolObservation {
        PoolObservation {
            address: address.to_string(),
            token_a: "SOL".to_string(),
            token_b: "USDC".to_string(),
            reserve_a: dec("100"),
            reserve_b: dec("15000"),
        }
    }

    fn tx_with(instructions: Vec<DecodedInstruction>) -> Transaction {
        Transaction {
            signature: "sig".to_string(),
            slot: 1,
            block_time: Utc::now(),
            fee_payer: "wallet".to_string(),
            instructions,
            status: TxStatus::Success,
        }
    }

    #[test]
    fn test_trading_pair_is_canonical() {
        let a = TradingPair::new("zzz", "aaa");
        let b = TradingPair::new("aaa", "zzz");
        assert_eq!(a, b);
        assert_eq!(a.key(), "aaa/zzz");
        assert_eq!(TradingPair::parse("zzz/aaa"), Some(a));
        assert_eq!(TradingPair::parse("nope"), None);
    }

    #[test]
    fn test_swap_leg_nets_swap_instructions() {
        let tx = tx_with(vec![swap_ix(&[("mintA", "-2"), ("mintB", "10")])]);
        let leg = tx.swap_leg().expect("swap leg");
        assert_eq!(leg.sold_mint, "mintA");
        assert_eq!(leg.sold_amount, dec("2"));
        assert_eq!(leg.bought_mint, "mintB");
        assert_eq!(leg.side(), TradeSide::Buy);
        // base is mintA, quote mintB: 10 quote per 2 base
        assert_eq!(leg.implied_price(), Some(dec("5")));
    }

    #[test]
    fn test_transfer_only_transaction_has_no_pair() {
        let mut ix = swap_ix(&[("mintA", "-2")]);
        ix.kind = InstructionKind::Transfer;
        assert!(tx_with(vec![ix]).trading_pair().is_none());
    }

    #[test]
    fn test_pool_observations_cover_routed_pools_of_pool_instructions() {
        let mut ix = swap_ix(&[]);
        ix.pool = Some(observation("outer"));
        ix.routed_pools = vec![observation("inner")];
        let addresses: Vec<&str> = ix.pool_observations().map(|o| o.address.as_str()).collect();
        assert_eq!(addresses, vec!["outer", "inner"]);

        ix.kind = InstructionKind::Transfer;
        assert_eq!(ix.pool_observations().count(), 0);
    }

    #[test]
    fn test_strategy_document_rejects_null_leaf() {
        let raw = serde_json::json!({
            "target_selection": {"liquidity_criteria": "x", "volume_criteria": "x", "price_criteria": "x"},
            "buy_strategy": {"trigger_conditions": "x", "buy_parameters": "x"},
            "sell_strategy": {"take_profit": "x", "stop_loss": null},
            "position_management": {"scaling": "x", "rebalancing": "x"},
            "risk_control": {"max_position_size": "x", "max_daily_loss": "x", "correlation_management": "x"}
        });
        let doc: StrategyDocument = serde_json::from_value(raw).unwrap();
        assert!(matches!(doc.validate(), Err(PipelineError::SynthesisMalformedResponse(_))));
    }

    #[test]
    fn test_strategy_document_rejects_unknown_section() {
        let raw = serde_json::json!({
            "target_selection": {"liquidity_criteria": "x", "volume_criteria": "x", "price_criteria": "x"},
            "buy_strategy": {"trigger_conditions": "x", "buy_parameters": "x"},
            "sell_strategy": {"take_profit": "x", "stop_loss": "x"},
            "position_management": {"scaling": "x", "rebalancing": "x"},
            "risk_control": {"max_position_size": "x", "max_daily_loss": "x", "correlation_management": "x"},
            "automation": {}
        });
        assert!(serde_json::from_value::<StrategyDocument>(raw).is_err());
    }
}
