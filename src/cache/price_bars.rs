//! Incremental backfill cache for `PriceBar` series.
//!
//! Unlike the generic TTL map, bars are persisted. The first request for a
//! `(symbol, timeframe)` pulls the provider's full history (capped); every
//! later request asks only for bars newer than the highest stored
//! `open_time`, appends them, and serves from the local store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::PersistenceError;
use crate::types::{Candle, PriceBar, Symbol, Timeframe};

/// Where a `klines` response ultimately came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarSource {
    /// Served entirely from the local store.
    Local,
    /// The local store was empty (or uninitialized) and live values were
    /// fetched as a fallback.
    ProviderLive,
}

#[derive(Debug, Clone)]
pub struct BarSeries {
    pub bars: Vec<Candle>,
    pub source: BarSource,
}

/// Storage contract `PriceBarCache` needs from the persistence layer. Kept
/// narrow so the cache module doesn't depend on the whole store.
#[async_trait]
pub trait PriceBarRepository: Send + Sync {
    async fn highest_open_time(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError>;

    async fn load_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, PersistenceError>;

    async fn insert_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        bars: &[Candle],
    ) -> Result<(), PersistenceError>;
}

/// Provider contract for historical and incremental kline fetches.
#[async_trait]
pub trait KlinesFetcher: Send + Sync {
    /// Full history, capped by the provider (and by `limit` on our side).
    async fn fetch_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> anyhow::Result<Vec<Candle>>;

    /// Bars strictly newer than `since`.
    async fn fetch_since(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Candle>>;
}

pub struct PriceBarCache {
    repo: Arc<dyn PriceBarRepository>,
    fetcher: Arc<dyn KlinesFetcher>,
    history_cap: usize,
}

impl PriceBarCache {
    pub fn new(
        repo: Arc<dyn PriceBarRepository>,
        fetcher: Arc<dyn KlinesFetcher>,
        history_cap: usize,
    ) -> Self {
        Self {
            repo,
            fetcher,
            history_cap,
        }
    }

    /// Serve the requested number of bars for `(symbol, timeframe)`,
    /// backfilling from the provider as needed.
    pub async fn get(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> anyhow::Result<BarSeries> {
        let highest = self.repo.highest_open_time(symbol, timeframe).await?;

        match highest {
            None => {
                let history = self
                    .fetcher
                    .fetch_history(symbol, timeframe, self.history_cap)
                    .await;
                match history {
                    Ok(bars) if !bars.is_empty() => {
                        self.repo.insert_bars(symbol, timeframe, &bars).await?;
                        let stored = self.repo.load_bars(symbol, timeframe, limit).await?;
                        Ok(BarSeries {
                            bars: stored,
                            source: BarSource::Local,
                        })
                    }
                    Ok(_) | Err(_) => {
                        // Provider has nothing either; degrade to whatever a
                        // direct live fetch can give us for this one call.
                        let live = self
                            .fetcher
                            .fetch_since(symbol, timeframe, DateTime::<Utc>::MIN_UTC)
                            .await
                            .unwrap_or_default();
                        Ok(BarSeries {
                            bars: live,
                            source: BarSource::ProviderLive,
                        })
                    }
                }
            }
            Some(since) => {
                if let Ok(new_bars) = self.fetcher.fetch_since(symbol, timeframe, since).await {
                    if !new_bars.is_empty() {
                        self.repo.insert_bars(symbol, timeframe, &new_bars).await?;
                    }
                }
                let stored = self.repo.load_bars(symbol, timeframe, limit).await?;
                Ok(BarSeries {
                    bars: stored,
                    source: BarSource::Local,
                })
            }
        }
    }
}

impl From<PriceBar> for Candle {
    fn from(bar: PriceBar) -> Self {
        bar.candle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeRepo {
        bars: Mutex<Vec<Candle>>,
    }

    #[async_trait]
    impl PriceBarRepository for FakeRepo {
        async fn highest_open_time(
            &self,
            _symbol: &Symbol,
            _timeframe: Timeframe,
        ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
            Ok(self.bars.lock().unwrap().last().map(|c| c.open_time))
        }

        async fn load_bars(
            &self,
            _symbol: &Symbol,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>, PersistenceError> {
            let bars = self.bars.lock().unwrap();
            let start = bars.len().saturating_sub(limit);
            Ok(bars[start..].to_vec())
        }

        async fn insert_bars(
            &self,
            _symbol: &Symbol,
            _timeframe: Timeframe,
            new_bars: &[Candle],
        ) -> Result<(), PersistenceError> {
            self.bars.lock().unwrap().extend_from_slice(new_bars);
            Ok(())
        }
    }

    struct FakeFetcher {
        history: Vec<Candle>,
    }

    #[async_trait]
    impl KlinesFetcher for FakeFetcher {
        async fn fetch_history(
            &self,
            _symbol: &Symbol,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> anyhow::Result<Vec<Candle>> {
            Ok(self.history.clone())
        }

        async fn fetch_since(
            &self,
            _symbol: &Symbol,
            _timeframe: Timeframe,
            since: DateTime<Utc>,
        ) -> anyhow::Result<Vec<Candle>> {
            Ok(self
                .history
                .iter()
                .filter(|c| c.open_time > since)
                .cloned()
                .collect())
        }
    }

    fn candle(ts: i64, price: f64) -> Candle {
        Candle::new_unchecked(
            DateTime::from_timestamp(ts, 0).unwrap(),
            price,
            price + 1.0,
            price - 1.0,
            price,
            100.0,
        )
    }

    #[tokio::test]
    async fn first_request_backfills_full_history() {
        let repo = Arc::new(FakeRepo {
            bars: Mutex::new(Vec::new()),
        });
        let fetcher = Arc::new(FakeFetcher {
            history: vec![candle(1, 10.0), candle(2, 11.0), candle(3, 12.0)],
        });
        let cache = PriceBarCache::new(repo, fetcher, 300);

        let series = cache
            .get(&Symbol::new("BTC"), Timeframe::H1, 10)
            .await
            .unwrap();
        assert_eq!(series.bars.len(), 3);
        assert_eq!(series.source, BarSource::Local);
    }

    #[tokio::test]
    async fn subsequent_request_only_fetches_newer_bars() {
        let repo = Arc::new(FakeRepo {
            bars: Mutex::new(vec![candle(1, 10.0)]),
        });
        let fetcher = Arc::new(FakeFetcher {
            history: vec![candle(1, 10.0), candle(2, 11.0)],
        });
        let cache = PriceBarCache::new(repo.clone(), fetcher, 300);

        let series = cache
            .get(&Symbol::new("BTC"), Timeframe::H1, 10)
            .await
            .unwrap();
        assert_eq!(series.bars.len(), 2);
    }
}
