//! `run`: start the scheduler daemon.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crypto_strategies::broker::PaperBroker;
use crypto_strategies::cache::fetchers::{
    parse_etf_flows, parse_miners, parse_onchain_btc, parse_scalar, ConfigurableJsonFetcher,
    ExchangeKlinesFetcher, ExchangeTickerFetcher, FearGreedFetcher,
};
use crypto_strategies::cache::{SourceKind, UpstreamFetcher};
use crypto_strategies::cache::{price_bars::PriceBarCache, MarketDataCache};
use crypto_strategies::llm::{DisabledAdvisor, HttpLlmAdvisor, LlmAdvisor};
use crypto_strategies::notify::LoggingNotifier;
use crypto_strategies::persistence::Store;
use crypto_strategies::risk::RiskFilter;
use crypto_strategies::scheduler::Scheduler;
use crypto_strategies::strategies::grid::GridEvaluator;
use crypto_strategies::strategies::macro_trend::MacroTrendEvaluator;
use crypto_strategies::strategies::ta::TaEvaluator;
use crypto_strategies::strategies::Evaluator;
use crypto_strategies::types::{Money, StrategyKind};
use crypto_strategies::Config;

const EXCHANGE_BASE_URL: &str = "https://api.coindcx.com";
const PRICE_BAR_HISTORY_CAP: usize = 1000;

/// Builds the full scheduler stack (cache, price bars, broker, risk filter,
/// evaluators) from config. Shared by the daemon and the one-shot `run-now`
/// admin command so both drive the same wiring.
pub(crate) async fn build_scheduler(config_path: &Path) -> Result<(Arc<Store>, Arc<Scheduler>)> {
    let config = Config::from_file(config_path).context("loading configuration")?;
    let http = Arc::new(reqwest::Client::new());

    let store = Arc::new(Store::open(&config.database_path).context("opening store")?);
    store
        .init_account(Money::from_f64(config.account.initial_cash))
        .context("initializing account")?;

    let cache = Arc::new(MarketDataCache::new(
        upstream_fetchers(http.clone()),
        config.to_cache_ttl_config(),
        config.cache.upstream_timeout(),
    ));
    let bars = Arc::new(PriceBarCache::new(
        store.clone(),
        Arc::new(ExchangeKlinesFetcher::new(http.clone(), EXCHANGE_BASE_URL)),
        PRICE_BAR_HISTORY_CAP,
    ));
    let broker = Arc::new(PaperBroker::new(
        store.clone(),
        config.account.fee_bps,
        config.account.slippage_bps,
    ));
    let risk = Arc::new(RiskFilter::new(store.clone(), config.to_risk_filter_config()));
    let llm = llm_advisor(&config, http.clone());

    let mut evaluators: HashMap<StrategyKind, Arc<dyn Evaluator>> = HashMap::new();
    evaluators.insert(StrategyKind::Ta, Arc::new(TaEvaluator));
    evaluators.insert(StrategyKind::Macro, Arc::new(MacroTrendEvaluator));
    evaluators.insert(StrategyKind::Grid, Arc::new(GridEvaluator));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        cache,
        bars,
        broker,
        risk,
        Arc::new(LoggingNotifier),
        llm,
        evaluators,
        config.scheduler.to_scheduler_config(),
    ));

    Ok((store, scheduler))
}

pub async fn run(config_path: &Path) -> Result<()> {
    let (_store, scheduler) = build_scheduler(config_path).await?;

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown_signal.notify_one();
    });

    tracing::info!("scheduler starting");
    scheduler.run(shutdown).await;
    tracing::info!("scheduler stopped");
    Ok(())
}

fn upstream_fetchers(http: Arc<reqwest::Client>) -> HashMap<SourceKind, Arc<dyn UpstreamFetcher>> {
    let mut fetchers: HashMap<SourceKind, Arc<dyn UpstreamFetcher>> = HashMap::new();
    fetchers.insert(
        SourceKind::Ticker24h,
        Arc::new(ExchangeTickerFetcher::new(http.clone(), EXCHANGE_BASE_URL)),
    );
    fetchers.insert(SourceKind::FearGreed, Arc::new(FearGreedFetcher::new(http.clone())));
    fetchers.insert(
        SourceKind::MacroFred,
        Arc::new(ConfigurableJsonFetcher::new(
            http.clone(),
            "https://api.stlouisfed.org/macro-snapshot",
            crypto_strategies::cache::fetchers::parse_macro_fred,
        )),
    );
    fetchers.insert(
        SourceKind::EtfFlows,
        Arc::new(ConfigurableJsonFetcher::new(
            http.clone(),
            "https://api.example-etf-flows.invalid/flows",
            parse_etf_flows,
        )),
    );
    fetchers.insert(
        SourceKind::OnchainBtc,
        Arc::new(ConfigurableJsonFetcher::new(
            http.clone(),
            "https://api.example-onchain.invalid/btc",
            parse_onchain_btc,
        )),
    );
    fetchers.insert(
        SourceKind::Miners,
        Arc::new(ConfigurableJsonFetcher::new(
            http.clone(),
            "https://api.example-miners.invalid/health",
            parse_miners,
        )),
    );
    fetchers.insert(
        SourceKind::StablecoinSupply,
        Arc::new(ConfigurableJsonFetcher::new(
            http.clone(),
            "https://api.example-stablecoins.invalid/supply",
            parse_scalar,
        )),
    );
    fetchers.insert(
        SourceKind::MstrMnav,
        Arc::new(ConfigurableJsonFetcher::new(
            http,
            "https://api.example-mstr.invalid/mnav",
            parse_scalar,
        )),
    );
    fetchers
}

fn llm_advisor(config: &Config, http: Arc<reqwest::Client>) -> Arc<dyn LlmAdvisor> {
    match (&config.llm.endpoint, &config.llm.api_token) {
        (Some(endpoint), Some(token)) if config.llm.enabled => {
            Arc::new(HttpLlmAdvisor::new(http, endpoint.clone(), token.clone()))
        }
        _ => Arc::new(DisabledAdvisor),
    }
}
