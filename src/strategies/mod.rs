//! Strategy evaluators.
//!
//! Each evaluator turns a `Strategy`'s persisted parameters plus a read-only
//! `Context` into a `Decision` and a `Trace` of how it got there. Evaluators
//! never place orders themselves — the scheduler does that, after routing
//! the decision through the risk filter.
//!
//! Generalizes the old backtrader-style `Strategy` trait's shape (one method
//! producing a signal from candles) to the cache-backed, multi-timeframe,
//! multi-source contract the evaluators below need.

pub mod grid;
pub mod macro_trend;
pub mod ta;

use async_trait::async_trait;
use std::sync::Arc;

use crate::cache::price_bars::{BarSeries, PriceBarCache};
use crate::cache::{CacheKey, CacheLookup, MarketDataCache, SourceKind, SourceValue};
use crate::llm::LlmAdvisor;
use crate::types::{Account, Decision, Strategy, Symbol, Timeframe, Trace};

/// Everything an evaluator needs to read, and nothing it can write.
pub struct Context {
    pub cache: Arc<MarketDataCache>,
    pub bars: Arc<PriceBarCache>,
    pub account: Account,
    pub llm: Arc<dyn LlmAdvisor>,
}

impl Context {
    pub async fn klines(&self, symbol: &Symbol, timeframe: Timeframe, limit: usize) -> anyhow::Result<BarSeries> {
        self.bars.get(symbol, timeframe, limit).await
    }

    pub async fn source(&self, source: SourceKind, key: &str) -> CacheLookup<SourceValue> {
        let lookups = self.cache.get_all(&[CacheKey::new(source, key)]).await;
        lookups.into_values().next().unwrap_or(CacheLookup::Absent)
    }

    pub async fn ticker(&self, symbol: &Symbol) -> CacheLookup<SourceValue> {
        self.source(SourceKind::Ticker24h, symbol.as_str()).await
    }
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, strategy: &Strategy, ctx: &Context) -> anyhow::Result<(Decision, Trace)>;
}
