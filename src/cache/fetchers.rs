//! Concrete [`UpstreamFetcher`] implementations.
//!
//! The exchange ticker and fear/greed index have a stable, free, public HTTP
//! shape so they're implemented directly, in the same reqwest-client style
//! as `exchange.rs`'s `CoinDCXClient`. The macro/on-chain/institutional
//! sources in §4.2 are genuinely opaque collaborators per the system's
//! scope — `ConfigurableJsonFetcher` demonstrates the one pattern needed to
//! wire any of them in (GET a URL, parse the JSON body) without hand-rolling
//! a bespoke client per provider.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

use super::price_bars::KlinesFetcher;
use super::{
    EtfFlowSnapshot, FearGreedClass, FearGreedSnapshot, MacroFredSnapshot, MinersSnapshot,
    OnchainBtcSnapshot, SourceValue, TickerSnapshot, UpstreamFetcher,
};
use crate::types::{Candle, Symbol, Timeframe};

/// Fetches `ticker_24h` from a CoinDCX-shaped public ticker endpoint.
pub struct ExchangeTickerFetcher {
    client: Arc<reqwest::Client>,
    base_url: String,
}

impl ExchangeTickerFetcher {
    pub fn new(client: Arc<reqwest::Client>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct RawTicker {
    market: String,
    last_price: String,
    #[serde(default)]
    high: String,
    #[serde(default)]
    low: String,
    #[serde(default)]
    volume: String,
    #[serde(default)]
    change_24_hour: String,
}

#[async_trait]
impl UpstreamFetcher for ExchangeTickerFetcher {
    async fn fetch(&self, key: &str) -> anyhow::Result<SourceValue> {
        let url = format!("{}/exchange/ticker", self.base_url);
        let tickers: Vec<RawTicker> = self.client.get(&url).send().await?.json().await?;
        let ticker = tickers
            .into_iter()
            .find(|t| t.market == key)
            .ok_or_else(|| anyhow::anyhow!("ticker not found for {key}"))?;

        Ok(SourceValue::Ticker24h(TickerSnapshot {
            last_price: ticker.last_price.parse().unwrap_or(0.0),
            change_24h_pct: ticker.change_24_hour.parse().unwrap_or(0.0),
            high_24h: ticker.high.parse().unwrap_or(0.0),
            low_24h: ticker.low.parse().unwrap_or(0.0),
            volume_24h: ticker.volume.parse().unwrap_or(0.0),
        }))
    }
}

/// Fetches `fear_greed` from the public alternative.me Fear & Greed index.
pub struct FearGreedFetcher {
    client: Arc<reqwest::Client>,
}

impl FearGreedFetcher {
    pub fn new(client: Arc<reqwest::Client>) -> Self {
        Self { client }
    }
}

#[derive(serde::Deserialize)]
struct FngResponse {
    data: Vec<FngData>,
}

#[derive(serde::Deserialize)]
struct FngData {
    value: String,
}

#[async_trait]
impl UpstreamFetcher for FearGreedFetcher {
    async fn fetch(&self, _key: &str) -> anyhow::Result<SourceValue> {
        let resp: FngResponse = self
            .client
            .get("https://api.alternative.me/fng/?limit=1")
            .send()
            .await?
            .json()
            .await?;
        let value: u8 = resp
            .data
            .first()
            .ok_or_else(|| anyhow::anyhow!("empty fear/greed response"))?
            .value
            .parse()?;

        let classification = match value {
            0..=24 => FearGreedClass::ExtremeFear,
            25..=44 => FearGreedClass::Fear,
            45..=55 => FearGreedClass::Neutral,
            56..=75 => FearGreedClass::Greed,
            _ => FearGreedClass::ExtremeGreed,
        };

        Ok(SourceValue::FearGreed(FearGreedSnapshot {
            value,
            classification,
        }))
    }
}

/// Generic GET-and-parse fetcher for sources with no stable free API in this
/// deployment: macro rates, ETF flows, on-chain valuation, miner health, and
/// the MSTR mNAV ratio. `parse` maps the raw JSON body to the source's
/// typed snapshot.
pub struct ConfigurableJsonFetcher {
    client: Arc<reqwest::Client>,
    url: String,
    parse: fn(&serde_json::Value) -> anyhow::Result<SourceValue>,
}

impl ConfigurableJsonFetcher {
    pub fn new(
        client: Arc<reqwest::Client>,
        url: impl Into<String>,
        parse: fn(&serde_json::Value) -> anyhow::Result<SourceValue>,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            parse,
        }
    }
}

#[async_trait]
impl UpstreamFetcher for ConfigurableJsonFetcher {
    async fn fetch(&self, _key: &str) -> anyhow::Result<SourceValue> {
        let body: serde_json::Value = self.client.get(&self.url).send().await?.json().await?;
        (self.parse)(&body)
    }
}

/// Parses a `{fed_rate, treasury_10y, dxy, m2_growth_yoy}` body.
pub fn parse_macro_fred(body: &serde_json::Value) -> anyhow::Result<SourceValue> {
    Ok(SourceValue::MacroFred(MacroFredSnapshot {
        fed_rate: body["fed_rate"].as_f64().unwrap_or(0.0),
        treasury_10y: body["treasury_10y"].as_f64().unwrap_or(0.0),
        dxy: body["dxy"].as_f64().unwrap_or(0.0),
        m2_growth_yoy: body["m2_growth_yoy"].as_f64().unwrap_or(0.0),
    }))
}

/// Parses a `{btc, eth, sol}` net-USD-flow body.
pub fn parse_etf_flows(body: &serde_json::Value) -> anyhow::Result<SourceValue> {
    Ok(SourceValue::EtfFlows(EtfFlowSnapshot {
        btc_usd: body["btc"].as_f64().unwrap_or(0.0),
        eth_usd: body["eth"].as_f64().unwrap_or(0.0),
        sol_usd: body["sol"].as_f64().unwrap_or(0.0),
    }))
}

/// Parses a `{ahr999, mvrv_ratio, wma200, hashrate, halving_days}` body.
pub fn parse_onchain_btc(body: &serde_json::Value) -> anyhow::Result<SourceValue> {
    Ok(SourceValue::OnchainBtc(OnchainBtcSnapshot {
        ahr999: body["ahr999"].as_f64().unwrap_or(0.0),
        mvrv_ratio: body["mvrv_ratio"].as_f64().unwrap_or(0.0),
        wma200: body["wma200"].as_f64().unwrap_or(0.0),
        hashrate: body["hashrate"].as_f64().unwrap_or(0.0),
        halving_days: body["halving_days"].as_i64().unwrap_or(0),
    }))
}

/// Parses a `{profitable, total}` miner-count body.
pub fn parse_miners(body: &serde_json::Value) -> anyhow::Result<SourceValue> {
    Ok(SourceValue::Miners(MinersSnapshot {
        profitable: body["profitable"].as_u64().unwrap_or(0) as u32,
        total: body["total"].as_u64().unwrap_or(0) as u32,
    }))
}

/// Parses a bare numeric body (stablecoin supply in USD billions, or a ratio
/// like the MSTR mNAV) under a `value` field.
pub fn parse_scalar(body: &serde_json::Value) -> anyhow::Result<SourceValue> {
    body["value"]
        .as_f64()
        .map(SourceValue::StablecoinSupply)
        .ok_or_else(|| anyhow::anyhow!("missing numeric `value` field"))
}

/// Fetches OHLCV candles from a CoinDCX-shaped `/market_data/candles`
/// endpoint, backing [`KlinesFetcher`] for [`crate::cache::price_bars::PriceBarCache`].
pub struct ExchangeKlinesFetcher {
    client: Arc<reqwest::Client>,
    base_url: String,
}

impl ExchangeKlinesFetcher {
    pub fn new(client: Arc<reqwest::Client>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn fetch(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
        start_time_ms: Option<i64>,
    ) -> anyhow::Result<Vec<Candle>> {
        let mut request = self
            .client
            .get(format!("{}/market_data/candles", self.base_url))
            .query(&[
                ("pair", symbol.as_str()),
                ("interval", timeframe.as_str()),
                ("limit", &limit.to_string()),
            ]);
        if let Some(start) = start_time_ms {
            request = request.query(&[("startTime", start)]);
        }

        let raw: Vec<RawCandle> = request.send().await?.json().await?;
        let mut candles: Vec<Candle> = raw
            .into_iter()
            .filter_map(|c| {
                let open_time = Utc.timestamp_millis_opt(c.time).single()?;
                Some(Candle::new_unchecked(
                    open_time, c.open, c.high, c.low, c.close, c.volume,
                ))
            })
            .collect();
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }
}

#[derive(serde::Deserialize)]
struct RawCandle {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[async_trait]
impl KlinesFetcher for ExchangeKlinesFetcher {
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>> {
        self.fetch(symbol, timeframe, limit, None).await
    }

    async fn fetch_since(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candle>> {
        let bars = self
            .fetch(symbol, timeframe, 1000, Some(since.timestamp_millis()))
            .await?;
        Ok(bars.into_iter().filter(|c| c.open_time > since).collect())
    }
}
