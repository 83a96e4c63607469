//! Outbound notifications.
//!
//! Write-only: the scheduler tells a `Notifier` about trades, vetoes, and
//! run failures; nothing in this system reads notifications back. The
//! default implementation just logs — a real deployment wires in whatever
//! channel (webhook, email, chat) the operator wants without the scheduler
//! knowing the difference.

use async_trait::async_trait;

use crate::types::{Signal, Trade};

#[derive(Debug, Clone)]
pub enum Notification<'a> {
    TradeExecuted { strategy_id: i64, trade: &'a Trade },
    OrderVetoed { strategy_id: i64, signal: &'a Signal, reason: String },
    RunFailed { strategy_id: i64, error: String },
    StrategyErrored { strategy_id: i64, consecutive_failures: u32 },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Notification<'_>);
}

pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, event: Notification<'_>) {
        match event {
            Notification::TradeExecuted { strategy_id, trade } => {
                tracing::info!(strategy_id, trade_id = trade.id, side = %trade.side, symbol = %trade.symbol, "trade executed");
            }
            Notification::OrderVetoed { strategy_id, signal, reason } => {
                tracing::info!(strategy_id, signal_id = signal.id, reason = %reason, "order vetoed");
            }
            Notification::RunFailed { strategy_id, error } => {
                tracing::warn!(strategy_id, error = %error, "run failed");
            }
            Notification::StrategyErrored { strategy_id, consecutive_failures } => {
                tracing::error!(strategy_id, consecutive_failures, "strategy transitioned to ERROR");
            }
        }
    }
}
