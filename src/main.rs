//! Crypto trading strategies - main entry point
//!
//! A daemon and an admin CLI over one SQLite-backed paper trading engine:
//! `run` starts the scheduler, the rest inspect and manage strategies,
//! positions, trades, and run history against the same store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "crypto-strategies")]
#[command(about = "Personal-scale paper trading engine for crypto strategies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the scheduler daemon, running every ACTIVE strategy on its cadence
    Run,

    /// Manage strategies
    Strategy {
        #[command(subcommand)]
        action: StrategyAction,
    },

    /// Trigger an immediate out-of-cadence run for one strategy
    RunNow {
        /// Strategy id
        id: i64,
    },

    /// Clear a tripped circuit breaker (the risk filter never clears it itself)
    ResetCircuitBreaker,

    /// Show current cash, positions, and equity
    Positions,

    /// Show the trade ledger, optionally filtered to one strategy
    Trades {
        /// Restrict to this strategy id
        #[arg(long)]
        strategy: Option<i64>,
    },

    /// Tail run logs for one strategy
    Runs {
        /// Strategy id
        id: i64,

        /// Number of recent runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum StrategyAction {
    /// Register a new strategy
    Add {
        /// Human-readable name
        name: String,

        /// Evaluator kind: ta, macro, or grid
        kind: String,

        /// Traded symbol, e.g. BTC
        symbol: String,

        /// Tick cadence in seconds
        #[arg(long, default_value = "300")]
        interval_s: u64,

        /// Evaluator-specific parameters as a JSON object
        #[arg(long, default_value = "{}")]
        parameters: String,
    },

    /// List every registered strategy
    List,

    /// Pause a strategy (skips future ticks until resumed)
    Pause { id: i64 },

    /// Resume a paused or errored strategy
    Resume { id: i64 },

    /// Stop a strategy permanently
    Stop { id: i64 },

    /// Delete a strategy and its history
    Delete { id: i64 },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // Create log file with naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Set log level - filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    // File appender
    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Keep console clean, e.g. while a progress bar owns stdout.
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run => "run",
        Commands::Strategy { .. } => "strategy",
        Commands::RunNow { .. } => "run-now",
        Commands::ResetCircuitBreaker => "reset-circuit-breaker",
        Commands::Positions => "positions",
        Commands::Trades { .. } => "trades",
        Commands::Runs { .. } => "runs",
    };
    setup_logging(cli.verbose, command_name, false)?;

    match cli.command {
        Commands::Run => commands::run::run(&cli.config).await,
        Commands::Strategy { action } => match action {
            StrategyAction::Add { name, kind, symbol, interval_s, parameters } => {
                commands::strategy::add(&cli.config, name, kind, symbol, interval_s, parameters)
            }
            StrategyAction::List => commands::strategy::list(&cli.config),
            StrategyAction::Pause { id } => commands::strategy::pause(&cli.config, id),
            StrategyAction::Resume { id } => commands::strategy::resume(&cli.config, id),
            StrategyAction::Stop { id } => commands::strategy::stop(&cli.config, id),
            StrategyAction::Delete { id } => commands::strategy::delete(&cli.config, id),
        },
        Commands::RunNow { id } => commands::run_now::run(&cli.config, id).await,
        Commands::ResetCircuitBreaker => commands::reset_circuit_breaker::run(&cli.config),
        Commands::Positions => commands::positions::run(&cli.config).await,
        Commands::Trades { strategy } => commands::trades::run(&cli.config, strategy),
        Commands::Runs { id, limit } => commands::runs::run(&cli.config, id, limit),
    }
}
