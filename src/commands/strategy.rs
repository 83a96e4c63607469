//! `strategy add|list|pause|resume|stop|delete`.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::Path;

use crypto_strategies::persistence::Store;
use crypto_strategies::types::{Strategy, StrategyKind, StrategyStatus, Symbol};
use crypto_strategies::Config;

fn open_store(config_path: &Path) -> Result<Store> {
    let config = Config::from_file(config_path).context("loading configuration")?;
    Store::open(&config.database_path).context("opening store")
}

fn parse_kind(kind: &str) -> Result<StrategyKind> {
    match kind.to_lowercase().as_str() {
        "ta" => Ok(StrategyKind::Ta),
        "macro" => Ok(StrategyKind::Macro),
        "grid" => Ok(StrategyKind::Grid),
        other => anyhow::bail!("unknown strategy kind '{other}' (expected ta, macro, or grid)"),
    }
}

pub fn add(
    config_path: &Path,
    name: String,
    kind: String,
    symbol: String,
    interval_s: u64,
    parameters: String,
) -> Result<()> {
    let store = open_store(config_path)?;
    let kind = parse_kind(&kind)?;
    let parameters: serde_json::Value =
        serde_json::from_str(&parameters).context("parsing --parameters as JSON")?;

    let strategy = store.insert_strategy(&Strategy {
        id: 0,
        name,
        kind,
        symbol: Symbol::new(symbol),
        status: StrategyStatus::Active,
        schedule_interval_s: interval_s,
        parameters,
        last_run_at: None,
        created_at: Utc::now(),
    })?;

    println!("strategy {} created: {} ({}/{})", strategy.id, strategy.name, strategy.kind, strategy.symbol);
    Ok(())
}

pub fn list(config_path: &Path) -> Result<()> {
    let store = open_store(config_path)?;
    let strategies = store.load_strategies()?;
    if strategies.is_empty() {
        println!("no strategies registered");
        return Ok(());
    }
    println!("{:<5} {:<20} {:<6} {:<10} {:<10} {:<10}", "id", "name", "kind", "symbol", "status", "interval_s");
    for s in strategies {
        println!(
            "{:<5} {:<20} {:<6} {:<10} {:<10} {:<10}",
            s.id, s.name, s.kind, s.symbol, format!("{:?}", s.status), s.schedule_interval_s
        );
    }
    Ok(())
}

pub fn pause(config_path: &Path, id: i64) -> Result<()> {
    let store = open_store(config_path)?;
    store.update_strategy_status(id, StrategyStatus::Paused)?;
    println!("strategy {id} paused");
    Ok(())
}

pub fn resume(config_path: &Path, id: i64) -> Result<()> {
    let store = open_store(config_path)?;
    store.update_strategy_status(id, StrategyStatus::Active)?;
    println!("strategy {id} resumed");
    Ok(())
}

pub fn stop(config_path: &Path, id: i64) -> Result<()> {
    let store = open_store(config_path)?;
    store.update_strategy_status(id, StrategyStatus::Stopped)?;
    println!("strategy {id} stopped");
    Ok(())
}

pub fn delete(config_path: &Path, id: i64) -> Result<()> {
    let store = open_store(config_path)?;
    store.delete_strategy(id)?;
    println!("strategy {id} deleted");
    Ok(())
}
