//! `run-now`: trigger a single out-of-band scheduler tick for one strategy.

use anyhow::Result;
use std::path::Path;

use super::run::build_scheduler;

pub async fn run(config_path: &Path, id: i64) -> Result<()> {
    let (_store, scheduler) = build_scheduler(config_path).await?;
    scheduler.run_now(id).await?;
    println!("strategy {id} run triggered");
    Ok(())
}
