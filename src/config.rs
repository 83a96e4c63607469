//! Configuration management.
//!
//! Handles loading and parsing of a JSON configuration file, with
//! environment-variable overrides for secrets, matching the load/save idiom
//! this codebase has always used for its `Config` file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::cache::{CacheTtlConfig, SourceKind};

/// Top-level configuration. Every numeric default here matches §6's stated
/// defaults, so `Config::default()` reproduces the spec's out-of-the-box
/// behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub risk: RiskConfig,
    pub cache: CacheConfig,
    pub llm: LlmConfig,
    pub scheduler: SchedulerTuning,
    pub database_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: AccountConfig::default(),
            risk: RiskConfig::default(),
            cache: CacheConfig::default(),
            llm: LlmConfig::default(),
            scheduler: SchedulerTuning::default(),
            database_path: "crypto-strategies.db".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, applying environment overrides
    /// for secrets afterward (API keys, LLM endpoint token) — never stored
    /// in the file itself.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("failed to parse config JSON")?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("LLM_API_TOKEN") {
            self.llm.api_token = Some(token);
        }
        if let Ok(endpoint) = std::env::var("LLM_ENDPOINT") {
            self.llm.endpoint = Some(endpoint);
        }
    }

    pub fn to_risk_filter_config(&self) -> crate::risk::RiskFilterConfig {
        crate::risk::RiskFilterConfig {
            max_trade_notional_pct: self.risk.max_trade_notional_pct,
            max_symbol_exposure_pct: self.risk.max_symbol_exposure_pct,
            soft_drawdown_pct: self.risk.soft_drawdown_pct,
            hard_drawdown_pct: self.risk.hard_drawdown_pct,
        }
    }

    pub fn to_cache_ttl_config(&self) -> CacheTtlConfig {
        let mut ttls = CacheTtlConfig::default();
        for (source, seconds) in &self.cache.ttl_overrides_s {
            ttls.set(*source, Duration::from_secs(*seconds));
        }
        ttls
    }
}

/// Paper account / broker parameters (§6 `initial_cash`, `fee_bps`,
/// `slippage_bps`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    pub initial_cash: f64,
    pub fee_bps: u32,
    pub slippage_bps: u32,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            initial_cash: 10_000.0,
            fee_bps: 10,
            slippage_bps: 5,
        }
    }
}

/// Risk filter thresholds (§4.4 / §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_trade_notional_pct: f64,
    pub max_symbol_exposure_pct: f64,
    pub soft_drawdown_pct: f64,
    pub hard_drawdown_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_trade_notional_pct: 0.05,
            max_symbol_exposure_pct: 0.25,
            soft_drawdown_pct: 0.10,
            hard_drawdown_pct: 0.20,
        }
    }
}

/// Market data cache tuning: the upstream fetch timeout plus any per-source
/// TTL overrides on top of `SourceKind::default_ttl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub upstream_timeout_s: u64,
    pub ttl_overrides_s: HashMap<SourceKind, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            upstream_timeout_s: 10,
            ttl_overrides_s: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_s)
    }
}

/// Advisory LLM client settings. Secrets (`api_token`, `endpoint`) are never
/// read from the file — only from the environment overrides above — so a
/// checked-in config never carries a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub timeout_s: u64,
    #[serde(skip)]
    pub endpoint: Option<String>,
    #[serde(skip)]
    pub api_token: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_s: 15,
            endpoint: None,
            api_token: None,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

/// Scheduler-level tuning not tied to any one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerTuning {
    pub shutdown_grace_s: u64,
    pub max_consecutive_failures: u32,
    pub failure_window_s: u64,
    pub poll_interval_s: u64,
}

impl Default for SchedulerTuning {
    fn default() -> Self {
        Self {
            shutdown_grace_s: 30,
            max_consecutive_failures: 3,
            failure_window_s: 3600,
            poll_interval_s: 1,
        }
    }
}

impl SchedulerTuning {
    pub fn to_scheduler_config(&self) -> crate::scheduler::SchedulerConfig {
        crate::scheduler::SchedulerConfig {
            max_consecutive_failures: self.max_consecutive_failures,
            failure_window: Duration::from_secs(self.failure_window_s),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_s),
            poll_interval: Duration::from_secs(self.poll_interval_s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let config = Config::default();
        assert_eq!(config.account.initial_cash, 10_000.0);
        assert_eq!(config.account.fee_bps, 10);
        assert_eq!(config.account.slippage_bps, 5);
        assert_eq!(config.risk.max_trade_notional_pct, 0.05);
        assert_eq!(config.risk.max_symbol_exposure_pct, 0.25);
        assert_eq!(config.risk.soft_drawdown_pct, 0.10);
        assert_eq!(config.risk.hard_drawdown_pct, 0.20);
        assert!(!config.llm.enabled);
        assert_eq!(config.cache.upstream_timeout_s, 10);
        assert_eq!(config.llm.timeout_s, 15);
        assert_eq!(config.scheduler.shutdown_grace_s, 30);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.account.initial_cash, config.account.initial_cash);
    }
}
