//! `reset-circuit-breaker`: the only way the circuit breaker is ever cleared.

use anyhow::{Context, Result};
use std::path::Path;

use crypto_strategies::persistence::Store;
use crypto_strategies::Config;

pub fn run(config_path: &Path) -> Result<()> {
    let config = Config::from_file(config_path).context("loading configuration")?;
    let store = Store::open(&config.database_path).context("opening store")?;

    let mut account = store.load_account()?;
    if !account.circuit_breaker_active {
        println!("circuit breaker is not active");
        return Ok(());
    }

    account.circuit_breaker_active = false;
    account.circuit_breaker_reason = None;
    store.save_account(&account)?;
    println!("circuit breaker cleared");
    Ok(())
}
