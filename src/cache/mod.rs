//! Market data cache.
//!
//! A process-wide mapping from `(source, key)` to `(value, fetched_at)` with
//! a per-source TTL, concurrent fan-out, and single-flight refreshes. Fronts
//! every upstream fetcher so evaluators never see an upstream failure
//! directly — only `Fresh`, `Stale`, or `Absent`.
//!
//! `PriceBar` series are handled separately (see [`PriceBarCache`]) since
//! they are persisted and backfilled incrementally rather than held as a
//! single TTL'd value.

pub mod fetchers;
pub mod price_bars;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use price_bars::PriceBarCache;

/// Upstream sources the cache recognizes, each with its own default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Ticker24h,
    MacroFred,
    FearGreed,
    EtfFlows,
    OnchainBtc,
    Miners,
    StablecoinSupply,
    MstrMnav,
}

impl SourceKind {
    /// Default TTL per §4.2's source table. Overridable via `CacheTtlConfig`.
    pub fn default_ttl(self) -> Duration {
        match self {
            SourceKind::Ticker24h => Duration::from_secs(60),
            SourceKind::MacroFred => Duration::from_secs(3600),
            SourceKind::FearGreed => Duration::from_secs(300),
            SourceKind::EtfFlows => Duration::from_secs(86_400),
            SourceKind::OnchainBtc => Duration::from_secs(300),
            SourceKind::Miners => Duration::from_secs(1800),
            SourceKind::StablecoinSupply => Duration::from_secs(600),
            SourceKind::MstrMnav => Duration::from_secs(3600),
        }
    }
}

/// A `(source, key)` cache key. `key` is typically a symbol ("BTC") or empty
/// for process-global sources like `macro_fred`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: SourceKind,
    pub key: String,
}

impl CacheKey {
    pub fn new(source: SourceKind, key: impl Into<String>) -> Self {
        Self {
            source,
            key: key.into(),
        }
    }
}

/// Typed payloads returned by upstream fetchers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SourceValue {
    Ticker24h(TickerSnapshot),
    MacroFred(MacroFredSnapshot),
    FearGreed(FearGreedSnapshot),
    EtfFlows(EtfFlowSnapshot),
    OnchainBtc(OnchainBtcSnapshot),
    Miners(MinersSnapshot),
    StablecoinSupply(f64),
    MstrMnav(f64),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub last_price: f64,
    pub change_24h_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MacroFredSnapshot {
    pub fed_rate: f64,
    pub treasury_10y: f64,
    pub dxy: f64,
    pub m2_growth_yoy: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FearGreedSnapshot {
    pub value: u8,
    pub classification: FearGreedClass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FearGreedClass {
    ExtremeFear,
    Fear,
    Neutral,
    Greed,
    ExtremeGreed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EtfFlowSnapshot {
    pub btc_usd: f64,
    pub eth_usd: f64,
    pub sol_usd: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OnchainBtcSnapshot {
    pub ahr999: f64,
    pub mvrv_ratio: f64,
    pub wma200: f64,
    pub hashrate: f64,
    pub halving_days: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MinersSnapshot {
    pub profitable: u32,
    pub total: u32,
}

/// Cache lookup outcome: a fresh value, a value past its TTL whose refresh
/// just failed (retained anyway), or no value ever obtained.
#[derive(Debug, Clone)]
pub enum CacheLookup<T> {
    Fresh(T),
    Stale(T, Duration),
    Absent,
}

impl<T> CacheLookup<T> {
    pub fn value(&self) -> Option<&T> {
        match self {
            CacheLookup::Fresh(v) | CacheLookup::Stale(v, _) => Some(v),
            CacheLookup::Absent => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheLookup::Fresh(_))
    }
}

/// Implemented once per upstream source. The cache never calls an upstream
/// directly outside of this trait, so fetch failures are always funneled
/// through the single retry/timeout/single-flight path below.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> anyhow::Result<SourceValue>;
}

struct Entry {
    value: SourceValue,
    fetched_at: DateTime<Utc>,
}

/// Per-source TTL overrides; falls back to [`SourceKind::default_ttl`].
#[derive(Debug, Clone, Default)]
pub struct CacheTtlConfig {
    overrides: HashMap<SourceKind, Duration>,
}

impl CacheTtlConfig {
    pub fn ttl_for(&self, source: SourceKind) -> Duration {
        self.overrides
            .get(&source)
            .copied()
            .unwrap_or_else(|| source.default_ttl())
    }

    pub fn set(&mut self, source: SourceKind, ttl: Duration) {
        self.overrides.insert(source, ttl);
    }
}

/// The market data cache. One instance per process, shared via `Arc`.
pub struct MarketDataCache {
    entries: DashMap<CacheKey, Entry>,
    inflight: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    fetchers: HashMap<SourceKind, Arc<dyn UpstreamFetcher>>,
    ttls: CacheTtlConfig,
    upstream_timeout: Duration,
}

impl MarketDataCache {
    pub fn new(
        fetchers: HashMap<SourceKind, Arc<dyn UpstreamFetcher>>,
        ttls: CacheTtlConfig,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            fetchers,
            ttls,
            upstream_timeout,
        }
    }

    /// Fetch, for every requested key, the freshest value this cache can
    /// produce. Distinct keys fan out concurrently; duplicate keys among
    /// concurrent callers share one in-flight refresh (single-flight).
    pub async fn get_all(&self, keys: &[CacheKey]) -> HashMap<CacheKey, CacheLookup<SourceValue>> {
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            tasks.push(self.get_one(key.clone()));
        }
        let results = futures::future::join_all(tasks).await;
        keys.iter().cloned().zip(results).collect()
    }

    async fn get_one(&self, key: CacheKey) -> CacheLookup<SourceValue> {
        let ttl = self.ttls.ttl_for(key.source);

        if let Some(lookup) = self.fresh_from_store(&key, ttl) {
            if lookup.is_fresh() {
                return lookup;
            }
        }

        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Double-check: another caller may have refreshed while we waited.
        if let Some(lookup) = self.fresh_from_store(&key, ttl) {
            if lookup.is_fresh() {
                self.inflight.remove(&key);
                return lookup;
            }
        }

        let refreshed = self.refresh(&key).await;
        self.inflight.remove(&key);
        refreshed
    }

    fn fresh_from_store(&self, key: &CacheKey, ttl: Duration) -> Option<CacheLookup<SourceValue>> {
        let entry = self.entries.get(key)?;
        let age = (Utc::now() - entry.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Some(if age <= ttl {
            CacheLookup::Fresh(entry.value.clone())
        } else {
            CacheLookup::Stale(entry.value.clone(), age)
        })
    }

    async fn refresh(&self, key: &CacheKey) -> CacheLookup<SourceValue> {
        let Some(fetcher) = self.fetchers.get(&key.source) else {
            warn!(source = ?key.source, "no fetcher registered for source");
            return self.stale_or_absent(key);
        };

        let fetch = fetcher.fetch(&key.key);
        match tokio::time::timeout(self.upstream_timeout, fetch).await {
            Ok(Ok(value)) => {
                debug!(source = ?key.source, key = %key.key, "refreshed cache entry");
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        fetched_at: Utc::now(),
                    },
                );
                CacheLookup::Fresh(value)
            }
            Ok(Err(err)) => {
                warn!(source = ?key.source, key = %key.key, error = %err, "upstream fetch failed");
                self.stale_or_absent(key)
            }
            Err(_) => {
                warn!(source = ?key.source, key = %key.key, "upstream fetch timed out");
                self.stale_or_absent(key)
            }
        }
    }

    fn stale_or_absent(&self, key: &CacheKey) -> CacheLookup<SourceValue> {
        match self.entries.get(key) {
            Some(entry) => {
                let age = (Utc::now() - entry.fetched_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                CacheLookup::Stale(entry.value.clone(), age)
            }
            None => CacheLookup::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFetcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl UpstreamFetcher for CountingFetcher {
        async fn fetch(&self, _key: &str) -> anyhow::Result<SourceValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(SourceValue::MstrMnav(1.5))
        }
    }

    #[tokio::test]
    async fn concurrent_gets_for_same_key_single_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut fetchers: HashMap<SourceKind, Arc<dyn UpstreamFetcher>> = HashMap::new();
        fetchers.insert(
            SourceKind::MstrMnav,
            Arc::new(CountingFetcher {
                calls: calls.clone(),
            }),
        );
        let cache = Arc::new(MarketDataCache::new(
            fetchers,
            CacheTtlConfig::default(),
            Duration::from_secs(5),
        ));

        let key = CacheKey::new(SourceKind::MstrMnav, "");
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.get_one(key).await }));
        }
        for h in handles {
            let lookup = h.await.unwrap();
            assert!(lookup.is_fresh());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FailingFetcher;

    #[async_trait]
    impl UpstreamFetcher for FailingFetcher {
        async fn fetch(&self, _key: &str) -> anyhow::Result<SourceValue> {
            anyhow::bail!("upstream down")
        }
    }

    #[tokio::test]
    async fn stale_value_retained_after_fetch_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut fetchers: HashMap<SourceKind, Arc<dyn UpstreamFetcher>> = HashMap::new();
        fetchers.insert(
            SourceKind::MstrMnav,
            Arc::new(CountingFetcher {
                calls: calls.clone(),
            }),
        );
        let cache = MarketDataCache::new(fetchers, CacheTtlConfig::default(), Duration::from_secs(5));
        let key = CacheKey::new(SourceKind::MstrMnav, "");

        let first = cache.get_one(key.clone()).await;
        assert!(first.is_fresh());

        // Swap in a failing fetcher by constructing a fresh cache that
        // shares no entries would lose the point of the test, so instead
        // directly exercise `stale_or_absent` against the already-seeded
        // entry to emulate a subsequent failed refresh.
        let stale = cache.stale_or_absent(&key);
        assert!(matches!(stale, CacheLookup::Stale(_, _)));
    }
}
