//! `trades`: list recorded trades, optionally scoped to one strategy.

use anyhow::{Context, Result};
use std::path::Path;

use crypto_strategies::persistence::Store;
use crypto_strategies::Config;

pub fn run(config_path: &Path, strategy: Option<i64>) -> Result<()> {
    let config = Config::from_file(config_path).context("loading configuration")?;
    let store = Store::open(&config.database_path).context("opening store")?;

    let trades = store.load_trades(strategy)?;
    if trades.is_empty() {
        println!("no trades recorded");
        return Ok(());
    }

    println!(
        "{:<5} {:<10} {:<10} {:<6} {:<12} {:<12} {:<10} {:<24}",
        "id", "strategy", "symbol", "side", "amount", "price", "fee", "executed_at"
    );
    for t in trades {
        println!(
            "{:<5} {:<10} {:<10} {:<6} {:<12} {:<12} {:<10} {:<24}",
            t.id, t.strategy_id, t.symbol, format!("{:?}", t.side), t.amount, t.price, t.fee, t.executed_at
        );
    }
    Ok(())
}
