//! Domain error taxonomy.
//!
//! These are matched on by callers that need to branch on a specific
//! failure (the scheduler deciding a `RunLog` outcome, the risk filter
//! reporting a veto reason). Orchestration-level flows that only need a
//! human-readable chain use `anyhow::Result` with `.context(...)` instead.

use thiserror::Error;

/// Indicator warm-up not satisfied. The caller treats this as "indicator
/// absent" (a neutral scoring contribution), never as a run failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("insufficient data: need at least {required} bars, have {available}")]
pub struct InsufficientData {
    pub required: usize,
    pub available: usize,
}

/// A cache source fetch failed after its timeout.
#[derive(Debug, Error, Clone)]
#[error("upstream unavailable: source={source} key={key}: {detail}")]
pub struct UpstreamUnavailable {
    pub source: String,
    pub key: String,
    pub detail: String,
}

/// Paper broker execution failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("insufficient cash: need {required}, have {available}")]
    InsufficientCash {
        required: crate::Money,
        available: crate::Money,
    },
    #[error("insufficient holding: need {required}, have {available}")]
    InsufficientHolding {
        required: crate::Money,
        available: crate::Money,
    },
    #[error("no position for symbol {0}")]
    NoPosition(crate::Symbol),
    #[error("no price available for symbol {0}")]
    NoPriceAvailable(crate::Symbol),
}

/// Reasons the risk filter can veto an order, in the order they are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum VetoReason {
    CircuitBreaker,
    TradeCap,
    ExposureCap,
    DrawdownHard,
    DrawdownSoft,
}

impl std::fmt::Display for VetoReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VetoReason::CircuitBreaker => "circuit_breaker",
            VetoReason::TradeCap => "trade_cap",
            VetoReason::ExposureCap => "exposure_cap",
            VetoReason::DrawdownHard => "drawdown_hard",
            VetoReason::DrawdownSoft => "drawdown_soft",
        };
        write!(f, "{s}")
    }
}

/// Outcome of the risk filter's evaluation of a proposed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskVerdict {
    Accept,
    Veto(VetoReason),
}

/// Unexpected failure inside an evaluator. Counted per strategy; three
/// within a 1-hour sliding window transitions the strategy to `ERROR`.
#[derive(Debug, Error)]
#[error("evaluator failed for strategy {strategy_id}: {source}")]
pub struct EvaluationError {
    pub strategy_id: i64,
    #[source]
    pub source: anyhow::Error,
}

/// Embedded store writer failure. The current tick aborts with outcome
/// `FAILED`; the scheduler continues with other strategies.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

/// Raised by in-flight ticks that are force-cancelled at shutdown.
#[derive(Debug, Error)]
#[error("tick cancelled by shutdown")]
pub struct ShutdownCancelled;
