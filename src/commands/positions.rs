//! `positions`: show account cash and open positions at their stored cost basis.
//!
//! Deliberately does not mark positions to market — that would require
//! standing up the full ticker-fetching stack for a read-only listing. Use
//! `run-now` against a strategy if live equity matters.

use anyhow::{Context, Result};
use std::path::Path;

use crypto_strategies::persistence::Store;
use crypto_strategies::Config;

pub async fn run(config_path: &Path) -> Result<()> {
    let config = Config::from_file(config_path).context("loading configuration")?;
    let store = Store::open(&config.database_path).context("opening store")?;

    let account = store.load_account()?;
    println!(
        "cash: {} | equity high water mark: {} | circuit breaker: {}{}",
        account.cash,
        account.equity_high_water_mark,
        account.circuit_breaker_active,
        account
            .circuit_breaker_reason
            .map(|r| format!(" ({r})"))
            .unwrap_or_default(),
    );

    let positions = store.load_positions()?;
    if positions.is_empty() {
        println!("no open positions");
        return Ok(());
    }

    println!("{:<10} {:<14} {:<14}", "symbol", "amount", "avg_cost");
    for (symbol, position) in positions {
        println!("{:<10} {:<14} {:<14}", symbol, position.amount, position.average_cost);
    }
    Ok(())
}
