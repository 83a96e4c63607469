//! Crypto Trading Strategies
//!
//! A personal-scale automated paper-trading engine for cryptocurrency
//! markets: a market data cache, a handful of strategy evaluators, a risk
//! filter, and a scheduler that runs them on a cadence against a simulated
//! broker.

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod strategies;
pub mod risk;
pub mod indicators;
pub mod llm;
pub mod notify;
pub mod persistence;
pub mod scheduler;
pub mod types;

pub use config::Config;
pub use types::*;
