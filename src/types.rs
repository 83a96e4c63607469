//! Core data types shared across the trading system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Money — precise decimal arithmetic for monetary values
// ============================================================================

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// Money type for precise decimal arithmetic in monetary calculations.
///
/// Wraps `rust_decimal::Decimal` to prevent floating-point drift in ledger
/// tracking. Used for every monetary value: prices, amounts, cash, fees.
///
/// # Why Money instead of f64?
/// `0.1 + 0.2 != 0.3` in f64. Over thousands of trades, ledger bookkeeping
/// would drift from the account's actual cash balance.
#[derive(Debug, Clone, Copy, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const ONE: Money = Money(Decimal::ONE);

    /// Create from f64 (upstream feeds and indicators are f64-based).
    /// May lose precision for values with many decimal places.
    pub fn from_f64(value: f64) -> Self {
        Money(Decimal::try_from(value).unwrap_or_else(|_| {
            if value.is_nan() || value.is_infinite() {
                Decimal::ZERO
            } else {
                Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
            }
        }))
    }

    pub fn to_f64(self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn from_i64(value: i64) -> Self {
        Money(Decimal::from(value))
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative()
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Default for Money {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for Money {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::hash::Hash for Money {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Money(-self.0)
    }
}

impl From<f64> for Money {
    fn from(value: f64) -> Self {
        Money::from_f64(value)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.to_f64()
    }
}

impl From<i64> for Money {
    fn from(value: i64) -> Self {
        Money::from_i64(value)
    }
}

impl std::str::FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Money(<Decimal as std::str::FromStr>::from_str(s)?))
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod money_tests {
    use super::*;

    #[test]
    fn test_money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        let c = Money::from_f64(0.3);
        assert_eq!(a + b, c, "Money should handle 0.1 + 0.2 = 0.3 correctly");
    }

    #[test]
    fn test_money_arithmetic() {
        let price = Money::from_f64(100.0);
        let qty = Money::from_f64(2.5);
        assert_eq!((price * qty).to_f64(), 250.0);
    }

    #[test]
    fn test_money_comparison() {
        let a = Money::from_f64(100.0);
        let b = Money::from_f64(200.0);
        assert!(a < b);
        assert_eq!(a.max(b), b);
        assert_eq!(a.min(b), a);
    }

    #[test]
    fn test_money_div_by_zero() {
        let a = Money::from_f64(100.0);
        assert_eq!(a / Money::ZERO, Money::ZERO);
    }

    #[test]
    fn test_money_serde_roundtrip() {
        let money = Money::from_f64(123.456);
        let json = serde_json::to_string(&money).unwrap();
        let parsed: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(money, parsed);
    }
}

// ============================================================================
// Symbol — cheap-to-clone trading pair identifier
// ============================================================================

/// Trading pair symbol, e.g. "BTCUSDT".
///
/// Symbols are cloned constantly (candles, orders, positions, trace steps);
/// `Arc<str>` keeps clones O(1) instead of a fresh heap allocation each time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

// ============================================================================
// Candle / PriceBar — OHLCV data
// ============================================================================

/// Validation errors for OHLCV data.
#[derive(Debug, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// A single OHLCV bar, timeframe-agnostic. This is the shape indicators and
/// evaluators consume; `PriceBar` (below) is its persisted, timeframe-tagged
/// counterpart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        open_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        };
        candle.validate()?;
        Ok(candle)
    }

    /// Construct without validation, for trusted sources (the local store).
    pub fn new_unchecked(
        open_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }
        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }
        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }
        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }
        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Candle timeframe, restricted to the set the cache and evaluators recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "1m" => Timeframe::M1,
            "5m" => Timeframe::M5,
            "15m" => Timeframe::M15,
            "1h" => Timeframe::H1,
            "4h" => Timeframe::H4,
            "1d" => Timeframe::D1,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted, uniquely-keyed bar: one row per (symbol, timeframe, open_time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub candle: Candle,
}

// ============================================================================
// Trading side
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ============================================================================
// Strategy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrategyKind {
    Ta,
    Macro,
    Grid,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Ta => write!(f, "TA"),
            StrategyKind::Macro => write!(f, "MACRO"),
            StrategyKind::Grid => write!(f, "GRID"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyStatus {
    Active,
    Paused,
    Stopped,
    Error,
}

/// A named strategy instance bound to a symbol. `parameters` is an opaque
/// JSON blob whose shape is defined by `kind` (see `strategies::ta`,
/// `strategies::macro_trend`, `strategies::grid` for their schemas).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub kind: StrategyKind,
    pub symbol: Symbol,
    pub status: StrategyStatus,
    pub schedule_interval_s: u64,
    pub parameters: serde_json::Value,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Position, Trade, Signal
// ============================================================================

/// Live paper-trading position. One row per symbol; deleted when `amount`
/// reaches zero (see `broker::PaperBroker::execute`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub amount: Money,
    pub average_cost: Money,
    pub opened_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Position {
    pub fn value_at(&self, last_price: Money) -> Money {
        self.amount * last_price
    }
}

/// Append-only ledger entry. Never updated or deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: i64,
    pub strategy_id: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Money,
    pub amount: Money,
    pub value: Money,
    pub fee: Money,
    pub reason: String,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

/// Append-only record of every evaluator decision, whether or not it
/// resulted in a trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: i64,
    pub strategy_id: i64,
    pub symbol: Symbol,
    pub action: Action,
    pub conviction: f64,
    pub price_at_signal: Money,
    pub reason: String,
    pub raw_analysis: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// RunLog / TraceStep
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Ok,
    Vetoed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceStepKind {
    Fetch,
    Compute,
    Score,
    Llm,
    Order,
}

/// One step of a run's execution trace. `step_index` is dense and 1-based
/// within its `RunLog`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step_index: u32,
    pub kind: TraceStepKind,
    pub label: String,
    pub input_digest: Option<String>,
    pub output_digest: Option<String>,
    pub details: serde_json::Value,
    pub duration: std::time::Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub id: i64,
    pub strategy_id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub steps: Vec<TraceStep>,
}

/// Accumulates trace steps during a tick and hands them to the `RunLog`.
/// Mirrors the dense 1-based indexing invariant from the data model.
#[derive(Debug, Default)]
pub struct Trace {
    steps: Vec<TraceStep>,
}

impl Trace {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(
        &mut self,
        kind: TraceStepKind,
        label: impl Into<String>,
        details: serde_json::Value,
        duration: std::time::Duration,
    ) {
        let step_index = self.steps.len() as u32 + 1;
        let label = label.into();
        tracing::debug!(step_index, label = %label, kind = ?kind, "trace step");
        self.steps.push(TraceStep {
            step_index,
            kind,
            label,
            input_digest: None,
            output_digest: None,
            details,
            duration,
        });
    }

    pub fn into_steps(self) -> Vec<TraceStep> {
        self.steps
    }
}

// ============================================================================
// WatchedInstrument
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedInstrument {
    pub symbol: Symbol,
    pub display_name: String,
    pub added_at: DateTime<Utc>,
}

// ============================================================================
// Account
// ============================================================================

/// Singleton virtual trading account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub cash: Money,
    pub equity_high_water_mark: Money,
    pub circuit_breaker_active: bool,
    pub circuit_breaker_reason: Option<String>,
}

// ============================================================================
// Decision / Order — evaluator output and scheduler-constructed order
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub conviction: f64,
    pub suggested_notional: Money,
    pub stop_loss: Option<Money>,
    pub take_profit: Option<Money>,
    pub reason: String,
    pub raw_analysis: serde_json::Value,
    /// Updated `Strategy.parameters` the scheduler should persist alongside
    /// this decision. Used by stateful evaluators (the grid evaluator's
    /// precomputed levels and `level_index`); `None` for stateless ones.
    pub state_patch: Option<serde_json::Value>,
    /// A status transition the evaluator is requesting on its own strategy
    /// (e.g. the grid evaluator pausing itself when price exits its range).
    /// `None` means no transition.
    pub requested_status: Option<StrategyStatus>,
}

/// An order the scheduler submits to the risk filter and, if accepted, to
/// the broker. `notional` is interpreted by the broker as a BUY notional
/// (converted to amount at execution price) or, for SELL, as the amount to
/// close (see `broker::Order`).
#[derive(Debug, Clone)]
pub struct Order {
    pub strategy_id: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub notional_or_amount: Money,
    pub reason: String,
}
