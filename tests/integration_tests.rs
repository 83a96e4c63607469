//! End-to-end scenarios wiring the cache, risk filter, broker, and scheduler
//! together against a real SQLite-backed store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

use crypto_strategies::broker::{LastPriceSource, PaperBroker};
use crypto_strategies::cache::price_bars::{KlinesFetcher, PriceBarCache, PriceBarRepository};
use crypto_strategies::cache::{CacheTtlConfig, MarketDataCache, SourceKind, SourceValue, TickerSnapshot, UpstreamFetcher};
use crypto_strategies::error::{PersistenceError, RiskVerdict, VetoReason};
use crypto_strategies::llm::DisabledAdvisor;
use crypto_strategies::notify::LoggingNotifier;
use crypto_strategies::persistence::Store;
use crypto_strategies::risk::{RiskFilter, RiskFilterConfig};
use crypto_strategies::scheduler::{Scheduler, SchedulerConfig};
use crypto_strategies::strategies::grid::GridEvaluator;
use crypto_strategies::strategies::Evaluator;
use crypto_strategies::types::{
    Candle, Money, Order, Side, Strategy, StrategyKind, StrategyStatus, Symbol, Timeframe,
};

struct FixedTicker(f64);

#[async_trait]
impl UpstreamFetcher for FixedTicker {
    async fn fetch(&self, _key: &str) -> anyhow::Result<SourceValue> {
        Ok(SourceValue::Ticker24h(TickerSnapshot {
            last_price: self.0,
            change_24h_pct: 0.0,
            high_24h: self.0,
            low_24h: self.0,
            volume_24h: 1_000.0,
        }))
    }
}

struct FailingTicker;

#[async_trait]
impl UpstreamFetcher for FailingTicker {
    async fn fetch(&self, _key: &str) -> anyhow::Result<SourceValue> {
        anyhow::bail!("upstream exchange is down")
    }
}

struct NoBars;

#[async_trait]
impl PriceBarRepository for NoBars {
    async fn highest_open_time(
        &self,
        _symbol: &Symbol,
        _timeframe: Timeframe,
    ) -> Result<Option<chrono::DateTime<Utc>>, PersistenceError> {
        Ok(None)
    }

    async fn load_bars(&self, _symbol: &Symbol, _timeframe: Timeframe, _limit: usize) -> Result<Vec<Candle>, PersistenceError> {
        Ok(Vec::new())
    }

    async fn insert_bars(&self, _symbol: &Symbol, _timeframe: Timeframe, _bars: &[Candle]) -> Result<(), PersistenceError> {
        Ok(())
    }
}

struct NoKlines;

#[async_trait]
impl KlinesFetcher for NoKlines {
    async fn fetch_history(&self, _symbol: &Symbol, _timeframe: Timeframe, _limit: usize) -> anyhow::Result<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn fetch_since(&self, _symbol: &Symbol, _timeframe: Timeframe, _since: chrono::DateTime<Utc>) -> anyhow::Result<Vec<Candle>> {
        Ok(Vec::new())
    }
}

fn open_store(initial_cash: f64) -> Arc<Store> {
    let file = NamedTempFile::new().unwrap();
    let store = Arc::new(Store::open(file.path()).unwrap());
    store.init_account(Money::from_f64(initial_cash)).unwrap();
    std::mem::forget(file);
    store
}

fn test_scheduler(store: Arc<Store>, price: f64) -> Arc<Scheduler> {
    let mut fetchers: HashMap<SourceKind, Arc<dyn UpstreamFetcher>> = HashMap::new();
    fetchers.insert(SourceKind::Ticker24h, Arc::new(FixedTicker(price)));
    let cache = Arc::new(MarketDataCache::new(fetchers, CacheTtlConfig::default(), Duration::from_secs(5)));
    let bars = Arc::new(PriceBarCache::new(Arc::new(NoBars), Arc::new(NoKlines), 300));
    let broker = Arc::new(PaperBroker::new(store.clone(), 10, 5));
    let risk = Arc::new(RiskFilter::new(store.clone(), RiskFilterConfig::default()));

    let mut evaluators: HashMap<StrategyKind, Arc<dyn Evaluator>> = HashMap::new();
    evaluators.insert(StrategyKind::Grid, Arc::new(GridEvaluator));

    Arc::new(Scheduler::new(
        store,
        cache,
        bars,
        broker,
        risk,
        Arc::new(LoggingNotifier),
        Arc::new(DisabledAdvisor),
        evaluators,
        SchedulerConfig::default(),
    ))
}

fn grid_strategy(level_index: usize) -> Strategy {
    Strategy {
        id: 0,
        name: "grid-btc".to_string(),
        kind: StrategyKind::Grid,
        symbol: Symbol::new("BTC"),
        status: StrategyStatus::Active,
        schedule_interval_s: 60,
        parameters: serde_json::json!({
            "symbol": "BTC",
            "lower_price": 100.0,
            "upper_price": 200.0,
            "grid_count": 4,
            "capital_per_grid": 500.0,
            "levels": [100.0, 120.0, 144.0, 173.0, 200.0],
            "level_index": level_index,
        }),
        last_run_at: None,
        created_at: Utc::now(),
    }
}

/// Price drops to a lower grid level than the strategy's recorded index: the
/// evaluator should cross down and the scheduler should execute a BUY.
#[tokio::test]
async fn scenario_a_grid_buy_on_downward_cross() {
    let store = open_store(10_000.0);
    let scheduler = test_scheduler(store.clone(), 115.0);
    let strategy = store.insert_strategy(&grid_strategy(2)).unwrap();

    scheduler.tick(strategy.id).await.unwrap();

    let trades = store.load_trades(Some(strategy.id)).unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].side, Side::Buy);

    // Only the line just below the recorded index (2 -> 1) is registered
    // this tick, even though price also dropped past level 1's own line.
    let reloaded = store.load_strategy(strategy.id).unwrap().unwrap();
    assert_eq!(reloaded.parameters["level_index"], 1);
}

/// A proposed BUY whose notional would push the symbol's exposure above the
/// configured cap is vetoed before it ever reaches the broker.
///
/// A single order with no prior position can never isolate the exposure cap
/// (25%) from the trade cap (5%) — any notional big enough to breach 25% of
/// equity on its own also breaches the 5% trade cap first. So this needs an
/// existing position doing most of the exposure, with a small top-up order
/// that stays under the trade cap but tips the total over the exposure cap.
#[tokio::test]
async fn scenario_d_risk_veto_on_exposure() {
    let store = open_store(7_000.0); // cash 7000 + position 2000 = equity 9000
    store
        .upsert_position(&crypto_strategies::types::Position {
            symbol: Symbol::new("BTC"),
            amount: Money::from_f64(20.0),
            average_cost: Money::from_f64(100.0),
            opened_at: Utc::now(),
            last_updated_at: Utc::now(),
        })
        .unwrap();
    let risk = RiskFilter::new(store.clone(), RiskFilterConfig::default());
    struct FixedPrice(Money);
    impl LastPriceSource for FixedPrice {
        fn last_price(&self, _symbol: &Symbol) -> Option<Money> {
            Some(self.0)
        }
    }
    let prices = FixedPrice(Money::from_f64(100.0));

    // Trade cap allows up to 450 (5% of 9000); this 400 buy stays under it
    // but pushes the BTC position from 2000 to 2400, past the 25%/2250
    // exposure cap.
    let order = Order {
        strategy_id: 1,
        symbol: Symbol::new("BTC"),
        side: Side::Buy,
        notional_or_amount: Money::from_f64(400.0),
        reason: "test".to_string(),
    };

    let verdict = risk.evaluate(&order, &prices).unwrap();
    assert_eq!(verdict, RiskVerdict::Veto(VetoReason::ExposureCap));
}

/// A hard drawdown breach trips the circuit breaker, and every subsequent
/// order is vetoed until an explicit admin reset clears it.
#[tokio::test]
async fn scenario_f_circuit_breaker_trip() {
    let store = open_store(10_000.0);
    let risk = RiskFilter::new(store.clone(), RiskFilterConfig::default());
    struct FixedPrice(Money);
    impl LastPriceSource for FixedPrice {
        fn last_price(&self, _symbol: &Symbol) -> Option<Money> {
            Some(self.0)
        }
    }

    let mut account = store.load_account().unwrap();
    account.equity_high_water_mark = Money::from_f64(10_000.0);
    account.cash = Money::from_f64(7_000.0); // 30% drawdown, past the 20% hard limit
    store.save_account(&account).unwrap();

    let order = Order {
        strategy_id: 1,
        symbol: Symbol::new("BTC"),
        side: Side::Buy,
        notional_or_amount: Money::from_f64(10.0),
        reason: "test".to_string(),
    };
    let prices = FixedPrice(Money::from_f64(100.0));

    let verdict = risk.evaluate(&order, &prices).unwrap();
    assert_eq!(verdict, RiskVerdict::Veto(VetoReason::DrawdownHard));

    let tripped = store.load_account().unwrap();
    assert!(tripped.circuit_breaker_active);

    // Circuit breaker never self-clears: a second, otherwise-fine order is
    // still vetoed.
    let small_order = Order {
        strategy_id: 1,
        symbol: Symbol::new("BTC"),
        side: Side::Buy,
        notional_or_amount: Money::from_f64(1.0),
        reason: "test".to_string(),
    };
    let verdict = risk.evaluate(&small_order, &prices).unwrap();
    assert_eq!(verdict, RiskVerdict::Veto(VetoReason::CircuitBreaker));

    // Only an explicit admin action (mirrors the `reset-circuit-breaker`
    // command) clears it.
    let mut account = store.load_account().unwrap();
    account.circuit_breaker_active = false;
    account.circuit_breaker_reason = None;
    store.save_account(&account).unwrap();
    assert!(!store.load_account().unwrap().circuit_breaker_active);
}

/// When the upstream ticker source is unreachable and no prior value has
/// ever been cached, lookups resolve to `Absent` rather than failing the caller.
#[tokio::test]
async fn scenario_e_upstream_outage_resilience() {
    let mut fetchers: HashMap<SourceKind, Arc<dyn UpstreamFetcher>> = HashMap::new();
    fetchers.insert(SourceKind::Ticker24h, Arc::new(FailingTicker));
    let cache = MarketDataCache::new(fetchers, CacheTtlConfig::default(), Duration::from_secs(2));

    let key = crypto_strategies::cache::CacheKey::new(SourceKind::Ticker24h, "BTC");
    let lookups = cache.get_all(&[key.clone()]).await;
    let lookup = lookups.get(&key).unwrap();
    assert!(lookup.value().is_none());
}

/// A strategy that is stopped should never be picked up by a tick, even when
/// its schedule interval has long since elapsed.
#[tokio::test]
async fn stopped_strategy_is_never_ticked() {
    let store = open_store(10_000.0);
    let scheduler = test_scheduler(store.clone(), 150.0);
    let mut strategy = grid_strategy(2);
    strategy.status = StrategyStatus::Stopped;
    let strategy = store.insert_strategy(&strategy).unwrap();

    scheduler.tick(strategy.id).await.unwrap();

    assert!(store.load_trades(Some(strategy.id)).unwrap().is_empty());
    assert!(store.load_strategy(strategy.id).unwrap().unwrap().last_run_at.is_none());
}
