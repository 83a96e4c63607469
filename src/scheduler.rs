//! Scheduler / run coordinator.
//!
//! Owns the set of active strategies and drives their periodic ticks. Each
//! strategy gets its own non-reentrant lock so at most one tick per strategy
//! runs at a time; ticks across different strategies run concurrently on the
//! shared tokio runtime. A tick's steps mirror the run coordinator procedure:
//! evaluate, persist the signal, route through the risk filter, execute or
//! veto, and always close the `RunLog`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{LastPriceSource, PaperBroker};
use crate::cache::price_bars::PriceBarCache;
use crate::cache::{CacheKey, MarketDataCache, SourceKind, SourceValue};
use crate::error::RiskVerdict;
use crate::llm::LlmAdvisor;
use crate::notify::{Notification, Notifier};
use crate::persistence::Store;
use crate::risk::RiskFilter;
use crate::strategies::{Context, Evaluator};
use crate::types::{
    Account, Action, Money, Order, RunLog, RunOutcome, Side, Signal, Strategy, StrategyKind,
    StrategyStatus, Symbol, Trace, TraceStepKind,
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_consecutive_failures: u32,
    pub failure_window: Duration,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            failure_window: Duration::from_secs(3600),
            shutdown_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Tickers fetched once per tick and reused across signal pricing, the risk
/// filter, and the broker, so a single tick never issues duplicate cache
/// lookups for the same symbol.
struct PriceSnapshot(HashMap<Symbol, Money>);

impl LastPriceSource for PriceSnapshot {
    fn last_price(&self, symbol: &Symbol) -> Option<Money> {
        self.0.get(symbol).copied()
    }
}

pub struct Scheduler {
    store: Arc<Store>,
    cache: Arc<MarketDataCache>,
    bars: Arc<PriceBarCache>,
    broker: Arc<PaperBroker>,
    risk: Arc<RiskFilter>,
    notifier: Arc<dyn Notifier>,
    llm: Arc<dyn LlmAdvisor>,
    evaluators: HashMap<StrategyKind, Arc<dyn Evaluator>>,
    locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
    failures: DashMap<i64, Vec<DateTime<Utc>>>,
    config: SchedulerConfig,
    shutting_down: AtomicBool,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<MarketDataCache>,
        bars: Arc<PriceBarCache>,
        broker: Arc<PaperBroker>,
        risk: Arc<RiskFilter>,
        notifier: Arc<dyn Notifier>,
        llm: Arc<dyn LlmAdvisor>,
        evaluators: HashMap<StrategyKind, Arc<dyn Evaluator>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            cache,
            bars,
            broker,
            risk,
            notifier,
            llm,
            evaluators,
            locks: DashMap::new(),
            failures: DashMap::new(),
            config,
            shutting_down: AtomicBool::new(false),
        }
    }

    fn lock_for(&self, strategy_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(strategy_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run one tick for `strategy_id`. Skips (returns `Ok`) if the strategy
    /// is not ACTIVE or already mid-tick; scheduler-level errors (unknown
    /// strategy, persistence failures outside the tick body) propagate.
    pub async fn tick(&self, strategy_id: i64) -> anyhow::Result<()> {
        let Some(strategy) = self.store.load_strategy(strategy_id)? else {
            anyhow::bail!("unknown strategy {strategy_id}");
        };
        if strategy.status != StrategyStatus::Active {
            return Ok(());
        }

        let lock = self.lock_for(strategy_id);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(strategy_id, "tick already in flight, skipping");
            return Ok(());
        };

        self.run_locked(strategy).await
    }

    /// Manual run: same procedure, same lock, invoked on admin request rather
    /// than the periodic trigger.
    pub async fn run_now(&self, strategy_id: i64) -> anyhow::Result<()> {
        self.tick(strategy_id).await
    }

    async fn run_locked(&self, strategy: Strategy) -> anyhow::Result<()> {
        let started_at = Utc::now();

        let account = self.store.load_account()?;
        let ctx = Context {
            cache: self.cache.clone(),
            bars: self.bars.clone(),
            account: account.clone(),
            llm: self.llm.clone(),
        };

        let evaluator = match self.evaluators.get(&strategy.kind) {
            Some(e) => e.clone(),
            None => anyhow::bail!("no evaluator registered for {:?}", strategy.kind),
        };

        let (decision, mut trace) = match evaluator.evaluate(&strategy, &ctx).await {
            Ok(pair) => pair,
            Err(err) => {
                self.record_failure(&strategy).await?;
                let mut trace = Trace::new();
                trace_error(&mut trace, &err);
                self.finish_run(strategy.id, started_at, RunOutcome::Failed, trace)?;
                self.notifier
                    .notify(Notification::RunFailed {
                        strategy_id: strategy.id,
                        error: err.to_string(),
                    })
                    .await;
                return Ok(());
            }
        };
        self.failures.remove(&strategy.id);

        let prices = self.price_snapshot(&strategy.symbol).await;
        let price_at_signal = prices.last_price(&strategy.symbol).unwrap_or(Money::ZERO);

        let signal = Signal {
            id: 0,
            strategy_id: strategy.id,
            symbol: strategy.symbol.clone(),
            action: decision.action,
            conviction: decision.conviction,
            price_at_signal,
            reason: decision.reason.clone(),
            raw_analysis: decision.raw_analysis.clone(),
            created_at: Utc::now(),
        };
        let signal = self.store.append_signal(&signal)?;

        if let Some(patch) = &decision.state_patch {
            self.store.update_strategy_parameters(strategy.id, patch)?;
        }
        if let Some(status) = decision.requested_status {
            self.store.update_strategy_status(strategy.id, status)?;
        }

        if decision.action == Action::Hold {
            self.finish_run(strategy.id, started_at, RunOutcome::Ok, trace)?;
            self.store.update_strategy_last_run(strategy.id, Utc::now())?;
            return Ok(());
        }

        let side = match decision.action {
            Action::Buy => Side::Buy,
            Action::Sell => Side::Sell,
            Action::Hold => unreachable!("HOLD handled above"),
        };
        let order = Order {
            strategy_id: strategy.id,
            symbol: strategy.symbol.clone(),
            side,
            notional_or_amount: decision.suggested_notional,
            reason: decision.reason.clone(),
        };

        match self.risk.evaluate(&order, &prices)? {
            RiskVerdict::Veto(reason) => {
                trace.push(
                    TraceStepKind::Order,
                    "veto",
                    serde_json::json!({ "reason": reason.to_string() }),
                    Duration::ZERO,
                );
                self.finish_run(strategy.id, started_at, RunOutcome::Vetoed, trace)?;
                self.notifier
                    .notify(Notification::OrderVetoed {
                        strategy_id: strategy.id,
                        signal: &signal,
                        reason: reason.to_string(),
                    })
                    .await;
            }
            RiskVerdict::Accept => {
                let last_price = prices.last_price(&strategy.symbol).unwrap_or(Money::ZERO);
                match self.broker.execute(&order, last_price).await {
                    Ok(trade) => {
                        trace.push(
                            TraceStepKind::Order,
                            "executed",
                            serde_json::json!({ "trade_id": trade.id, "amount": trade.amount.to_string() }),
                            Duration::ZERO,
                        );
                        self.finish_run(strategy.id, started_at, RunOutcome::Ok, trace)?;
                        self.notifier
                            .notify(Notification::TradeExecuted {
                                strategy_id: strategy.id,
                                trade: &trade,
                            })
                            .await;
                    }
                    Err(err) => {
                        trace.push(
                            TraceStepKind::Order,
                            "broker_error",
                            serde_json::json!({ "error": err.to_string() }),
                            Duration::ZERO,
                        );
                        self.finish_run(strategy.id, started_at, RunOutcome::Failed, trace)?;
                        self.notifier
                            .notify(Notification::RunFailed {
                                strategy_id: strategy.id,
                                error: err.to_string(),
                            })
                            .await;
                    }
                }
            }
        }

        self.store.update_strategy_last_run(strategy.id, Utc::now())?;
        Ok(())
    }

    async fn price_snapshot(&self, primary: &Symbol) -> PriceSnapshot {
        let mut symbols: Vec<Symbol> = self
            .store
            .load_positions()
            .unwrap_or_default()
            .into_keys()
            .collect();
        if !symbols.contains(primary) {
            symbols.push(primary.clone());
        }

        let keys: Vec<CacheKey> = symbols
            .iter()
            .map(|s| CacheKey::new(SourceKind::Ticker24h, s.as_str()))
            .collect();
        let lookups = self.cache.get_all(&keys).await;

        let mut prices = HashMap::new();
        for (symbol, key) in symbols.into_iter().zip(keys) {
            if let Some(SourceValue::Ticker24h(ticker)) = lookups.get(&key).and_then(|l| l.value()) {
                prices.insert(symbol, Money::from_f64(ticker.last_price));
            }
        }
        PriceSnapshot(prices)
    }

    fn finish_run(
        &self,
        strategy_id: i64,
        started_at: DateTime<Utc>,
        outcome: RunOutcome,
        trace: Trace,
    ) -> anyhow::Result<()> {
        let run_log = RunLog {
            id: 0,
            strategy_id,
            started_at,
            finished_at: Some(Utc::now()),
            outcome,
            steps: trace.into_steps(),
        };
        self.store.insert_run_log(&run_log)?;
        Ok(())
    }

    /// Records a failure and transitions the strategy to `ERROR` after three
    /// consecutive failures within the failure window. A success anywhere in
    /// between (see `run_locked`'s `self.failures.remove`) resets the count.
    async fn record_failure(&self, strategy: &Strategy) -> anyhow::Result<()> {
        let now = Utc::now();
        let mut entry = self.failures.entry(strategy.id).or_default();
        entry.retain(|t| now.signed_duration_since(*t).to_std().unwrap_or(Duration::ZERO) <= self.config.failure_window);
        entry.push(now);
        let count = entry.len() as u32;
        drop(entry);

        if count >= self.config.max_consecutive_failures {
            self.store.update_strategy_status(strategy.id, StrategyStatus::Error)?;
            self.notifier
                .notify(Notification::StrategyErrored {
                    strategy_id: strategy.id,
                    consecutive_failures: count,
                })
                .await;
        }
        Ok(())
    }

    /// Poll the strategy table on `poll_interval` and spawn a tick for every
    /// ACTIVE strategy whose `schedule_interval_s` has elapsed. Runs until
    /// `shutdown` fires; then stops scheduling new ticks and waits up to
    /// `shutdown_grace` for in-flight ones before force-cancelling the rest.
    pub async fn run(self: Arc<Self>, shutdown: Arc<tokio::sync::Notify>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        continue;
                    }
                    self.spawn_due_ticks(&mut tasks);
                }
                _ = shutdown.notified() => {
                    self.shutting_down.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }

        let grace = self.config.shutdown_grace;
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("shutdown grace period elapsed with ticks still in flight; cancelling");
            tasks.abort_all();
        }
    }

    fn spawn_due_ticks(self: &Arc<Self>, tasks: &mut tokio::task::JoinSet<()>) {
        let Ok(strategies) = self.store.load_strategies() else {
            return;
        };
        let now = Utc::now();
        for strategy in strategies {
            if strategy.status != StrategyStatus::Active {
                continue;
            }
            let due = strategy
                .last_run_at
                .map(|last| {
                    now.signed_duration_since(last).num_seconds() as u64 >= strategy.schedule_interval_s
                })
                .unwrap_or(true);
            if !due {
                continue;
            }
            let scheduler = self.clone();
            let id = strategy.id;
            tasks.spawn(async move {
                if let Err(err) = scheduler.tick(id).await {
                    tracing::warn!(strategy_id = id, error = %err, "tick failed");
                }
            });
        }
    }
}

fn trace_error(trace: &mut Trace, err: &anyhow::Error) {
    trace.push(
        TraceStepKind::Order,
        "evaluation_error",
        serde_json::json!({ "error": err.to_string() }),
        Duration::ZERO,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheTtlConfig, UpstreamFetcher};
    use crate::llm::DisabledAdvisor;
    use crate::risk::RiskFilterConfig;
    use crate::strategies::grid::GridEvaluator;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use tempfile::NamedTempFile;

    struct FixedTicker(f64);

    #[async_trait]
    impl UpstreamFetcher for FixedTicker {
        async fn fetch(&self, _key: &str) -> anyhow::Result<SourceValue> {
            Ok(SourceValue::Ticker24h(crate::cache::TickerSnapshot {
                last_price: self.0,
                change_24h_pct: 0.0,
                high_24h: self.0,
                low_24h: self.0,
                volume_24h: 1000.0,
            }))
        }
    }

    fn test_scheduler(price: f64) -> (Arc<Scheduler>, Arc<Store>) {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::open(file.path()).unwrap());
        store.init_account(Money::from_f64(10_000.0)).unwrap();
        std::mem::forget(file);

        let mut fetchers: StdHashMap<SourceKind, Arc<dyn UpstreamFetcher>> = StdHashMap::new();
        fetchers.insert(SourceKind::Ticker24h, Arc::new(FixedTicker(price)));
        let cache = Arc::new(MarketDataCache::new(fetchers, CacheTtlConfig::default(), Duration::from_secs(5)));

        struct NoBars;
        #[async_trait]
        impl crate::cache::price_bars::PriceBarRepository for NoBars {
            async fn highest_open_time(&self, _: &Symbol, _: crate::types::Timeframe) -> Result<Option<DateTime<Utc>>, crate::error::PersistenceError> {
                Ok(None)
            }
            async fn load_bars(&self, _: &Symbol, _: crate::types::Timeframe, _: usize) -> Result<Vec<crate::types::Candle>, crate::error::PersistenceError> {
                Ok(Vec::new())
            }
            async fn insert_bars(&self, _: &Symbol, _: crate::types::Timeframe, _: &[crate::types::Candle]) -> Result<(), crate::error::PersistenceError> {
                Ok(())
            }
        }
        struct NoKlines;
        #[async_trait]
        impl crate::cache::price_bars::KlinesFetcher for NoKlines {
            async fn fetch_history(&self, _: &Symbol, _: crate::types::Timeframe, _: usize) -> anyhow::Result<Vec<crate::types::Candle>> {
                Ok(Vec::new())
            }
            async fn fetch_since(&self, _: &Symbol, _: crate::types::Timeframe, _: DateTime<Utc>) -> anyhow::Result<Vec<crate::types::Candle>> {
                Ok(Vec::new())
            }
        }
        let bars = Arc::new(PriceBarCache::new(Arc::new(NoBars), Arc::new(NoKlines), 300));

        let broker = Arc::new(PaperBroker::new(store.clone(), 10, 5));
        let risk = Arc::new(RiskFilter::new(store.clone(), RiskFilterConfig::default()));

        let mut evaluators: HashMap<StrategyKind, Arc<dyn Evaluator>> = HashMap::new();
        evaluators.insert(StrategyKind::Grid, Arc::new(GridEvaluator));

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            cache,
            bars,
            broker,
            risk,
            Arc::new(crate::notify::LoggingNotifier),
            Arc::new(DisabledAdvisor),
            evaluators,
            SchedulerConfig::default(),
        ));
        (scheduler, store)
    }

    #[tokio::test]
    async fn hold_tick_updates_last_run_without_trading() {
        let (scheduler, store) = test_scheduler(150.0);
        let strategy = store
            .insert_strategy(&Strategy {
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
                }),
                last_run_at: None,
                created_at: Utc::now(),
            })
            .unwrap();

        scheduler.tick(strategy.id).await.unwrap();

        let reloaded = store.load_strategy(strategy.id).unwrap().unwrap();
        assert!(reloaded.last_run_at.is_some());
        assert!(reloaded.parameters["level_index"].is_number());
    }

    #[tokio::test]
    async fn concurrent_ticks_for_same_strategy_are_serialized() {
        let (scheduler, store) = test_scheduler(150.0);
        let strategy = store
            .insert_strategy(&Strategy {
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
                }),
                last_run_at: None,
                created_at: Utc::now(),
            })
            .unwrap();

        let a = scheduler.tick(strategy.id);
        let b = scheduler.tick(strategy.id);
        let (r1, r2) = tokio::join!(a, b);
        r1.unwrap();
        r2.unwrap();
    }
}
