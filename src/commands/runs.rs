//! `runs`: show recent run-log history (and trace steps) for one strategy.

use anyhow::{Context, Result};
use std::path::Path;

use crypto_strategies::persistence::Store;
use crypto_strategies::Config;

pub fn run(config_path: &Path, id: i64, limit: usize) -> Result<()> {
    let config = Config::from_file(config_path).context("loading configuration")?;
    let store = Store::open(&config.database_path).context("opening store")?;

    let runs = store.load_run_logs(Some(id), limit)?;
    if runs.is_empty() {
        println!("no runs recorded for strategy {id}");
        return Ok(());
    }

    for run_log in runs {
        println!(
            "run {} | strategy {} | {:?} | started {} | finished {:?}",
            run_log.id, run_log.strategy_id, run_log.outcome, run_log.started_at, run_log.finished_at
        );
        for step in &run_log.steps {
            println!("    [{}] {:?}: {}", step.step_index, step.kind, step.label);
        }
    }
    Ok(())
}
