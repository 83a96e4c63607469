//! Paper broker: owns the virtual trading account.
//!
//! Holds cash, positions keyed by symbol, and an append-only trade ledger.
//! All mutations are serialized under a single writer lock; `snapshot()`
//! gives readers a consistent point-in-time view without blocking writers
//! for long, matching the single-writer discipline `state_manager.rs`
//! already uses for the embedded store.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BrokerError;
use crate::persistence::Store;
use crate::types::{Account, Money, Order, Position, Side, Symbol, Trade};

/// Read-only view of account + positions, taken under the writer lock.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub cash: Money,
    pub positions: HashMap<Symbol, Position>,
    pub equity: Money,
}

/// Resolves the "last price" a symbol needs for equity/exposure math.
/// Implemented by the scheduler's cache-backed context; kept as a trait so
/// the broker has no direct dependency on the cache module.
pub trait LastPriceSource {
    fn last_price(&self, symbol: &Symbol) -> Option<Money>;
}

pub struct PaperBroker {
    store: Arc<Store>,
    fee_bps: u32,
    slippage_bps: u32,
    /// Serializes every mutation; no operation holds this across a network
    /// call (cache lookups happen before the lock is taken).
    writer: tokio::sync::Mutex<()>,
}

impl PaperBroker {
    pub fn new(store: Arc<Store>, fee_bps: u32, slippage_bps: u32) -> Self {
        Self {
            store,
            fee_bps,
            slippage_bps,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// `equity = cash + Σ amount*last_price(symbol)`, falling back to
    /// `amount*average_cost` for symbols the cache can't currently price.
    pub async fn snapshot(&self, prices: &dyn LastPriceSource) -> Result<Snapshot, BrokerError> {
        let _guard = self.writer.lock().await;
        let account = self.store.load_account().expect("account row must exist");
        let positions = self.store.load_positions().unwrap_or_default();

        let mut equity = account.cash;
        for position in positions.values() {
            let mark = prices
                .last_price(&position.symbol)
                .unwrap_or(position.average_cost);
            equity += position.amount * mark;
        }

        Ok(Snapshot {
            cash: account.cash,
            positions,
            equity,
        })
    }

    /// Execute an order against `last_price`. Returns the appended `Trade`.
    pub async fn execute(
        &self,
        order: &Order,
        last_price: Money,
    ) -> Result<Trade, BrokerError> {
        let _guard = self.writer.lock().await;

        match order.side {
            Side::Buy => self.execute_buy(order, last_price).await,
            Side::Sell => self.execute_sell(order, last_price).await,
        }
    }

    /// Convenience SELL of the entire position in `symbol`.
    pub async fn close_all(&self, symbol: &Symbol, strategy_id: i64, last_price: Money) -> Result<Option<Trade>, BrokerError> {
        let position = {
            let _guard = self.writer.lock().await;
            self.store.load_position(symbol).ok().flatten()
        };
        let Some(position) = position else {
            return Ok(None);
        };
        let order = Order {
            strategy_id,
            symbol: symbol.clone(),
            side: Side::Sell,
            notional_or_amount: position.amount,
            reason: "close_all".to_string(),
        };
        self.execute(&order, last_price).await.map(Some)
    }

    async fn execute_buy(&self, order: &Order, last_price: Money) -> Result<Trade, BrokerError> {
        let exec_price = self.buy_execution_price(last_price);
        let amount = order.notional_or_amount / exec_price;
        let value = exec_price * amount;
        let fee = value * Money::from_f64(self.fee_bps as f64 / 10_000.0);
        let cost = value + fee;

        let mut account = self.store.load_account().expect("account row must exist");
        if cost > account.cash {
            return Err(BrokerError::InsufficientCash {
                required: cost,
                available: account.cash,
            });
        }
        account.cash -= cost;

        let mut position = self
            .store
            .load_position(&order.symbol)
            .ok()
            .flatten()
            .unwrap_or(Position {
                symbol: order.symbol.clone(),
                amount: Money::ZERO,
                average_cost: Money::ZERO,
                opened_at: Utc::now(),
                last_updated_at: Utc::now(),
            });

        let prior_value = position.amount * position.average_cost;
        let new_amount = position.amount + amount;
        position.average_cost = if new_amount.is_zero() {
            Money::ZERO
        } else {
            (prior_value + value) / new_amount
        };
        position.amount = new_amount;
        position.last_updated_at = Utc::now();

        let trade = Trade {
            id: 0,
            strategy_id: order.strategy_id,
            symbol: order.symbol.clone(),
            side: Side::Buy,
            price: exec_price,
            amount,
            value,
            fee,
            reason: order.reason.clone(),
            executed_at: Utc::now(),
        };

        let equity = self.mark_to_market_equity(account.cash, &position, exec_price);
        self.update_high_water_mark(&mut account, equity);
        self.store.save_account(&account).map_err(|_| BrokerError::NoPriceAvailable(order.symbol.clone()))?;
        self.store.upsert_position(&position).map_err(|_| BrokerError::NoPosition(order.symbol.clone()))?;
        let trade = self
            .store
            .append_trade(&trade)
            .map_err(|_| BrokerError::NoPosition(order.symbol.clone()))?;

        Ok(trade)
    }

    async fn execute_sell(&self, order: &Order, last_price: Money) -> Result<Trade, BrokerError> {
        let exec_price = self.sell_execution_price(last_price);

        let mut position = self
            .store
            .load_position(&order.symbol)
            .ok()
            .flatten()
            .ok_or_else(|| BrokerError::NoPosition(order.symbol.clone()))?;

        let amount = order.notional_or_amount;
        if amount > position.amount {
            return Err(BrokerError::InsufficientHolding {
                required: amount,
                available: position.amount,
            });
        }

        let value = exec_price * amount;
        let fee = value * Money::from_f64(self.fee_bps as f64 / 10_000.0);
        let proceeds = value - fee;

        let mut account = self.store.load_account().expect("account row must exist");
        account.cash += proceeds;

        // SELLs never change average_cost (§3 invariant); only amount shrinks.
        position.amount -= amount;
        position.last_updated_at = Utc::now();

        let trade = Trade {
            id: 0,
            strategy_id: order.strategy_id,
            symbol: order.symbol.clone(),
            side: Side::Sell,
            price: exec_price,
            amount,
            value,
            fee,
            reason: order.reason.clone(),
            executed_at: Utc::now(),
        };

        let equity = self.mark_to_market_equity(account.cash, &position, exec_price);
        self.update_high_water_mark(&mut account, equity);
        self.store.save_account(&account).map_err(|_| BrokerError::NoPosition(order.symbol.clone()))?;
        if position.amount.is_zero() {
            self.store.delete_position(&order.symbol).map_err(|_| BrokerError::NoPosition(order.symbol.clone()))?;
        } else {
            self.store.upsert_position(&position).map_err(|_| BrokerError::NoPosition(order.symbol.clone()))?;
        }
        let trade = self
            .store
            .append_trade(&trade)
            .map_err(|_| BrokerError::NoPosition(order.symbol.clone()))?;

        Ok(trade)
    }

    fn buy_execution_price(&self, last_price: Money) -> Money {
        let bps = (self.fee_bps + self.slippage_bps) as f64 / 10_000.0;
        last_price * Money::from_f64(1.0 + bps)
    }

    fn sell_execution_price(&self, last_price: Money) -> Money {
        let bps = (self.fee_bps + self.slippage_bps) as f64 / 10_000.0;
        last_price * Money::from_f64(1.0 - bps)
    }

    /// `cash + Σ position value`, marking `traded` at `mark_price` (its
    /// execution price this trade) and every other held position at the
    /// cache's last price, falling back to `average_cost` — the same
    /// fallback `snapshot()` uses for symbols it can't currently price.
    fn mark_to_market_equity(&self, cash: Money, traded: &Position, mark_price: Money) -> Money {
        let mut equity = cash;
        let positions = self.store.load_positions().unwrap_or_default();
        for position in positions.values() {
            if position.symbol == traded.symbol {
                continue;
            }
            equity += position.amount * position.average_cost;
        }
        equity += traded.amount * mark_price;
        equity
    }

    /// Updates `equity_high_water_mark` to `max(prior, current_equity)`. The
    /// circuit breaker flag itself is owned by the risk filter, not here.
    fn update_high_water_mark(&self, account: &mut Account, equity: Money) {
        account.equity_high_water_mark = account.equity_high_water_mark.max(equity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Store;
    use tempfile::NamedTempFile;

    struct FixedPrice(Money);
    impl LastPriceSource for FixedPrice {
        fn last_price(&self, _symbol: &Symbol) -> Option<Money> {
            Some(self.0)
        }
    }

    fn test_store() -> Arc<Store> {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path()).unwrap();
        store
            .init_account(Money::from_f64(10_000.0))
            .unwrap();
        // keep the tempfile alive for the duration of the store by leaking it;
        // tests are short-lived processes so this is acceptable.
        std::mem::forget(file);
        Arc::new(store)
    }

    #[tokio::test]
    async fn buy_deducts_cash_with_fee_and_slippage() {
        let store = test_store();
        let broker = PaperBroker::new(store.clone(), 10, 5);
        let order = Order {
            strategy_id: 1,
            symbol: Symbol::new("BTC"),
            side: Side::Buy,
            notional_or_amount: Money::from_f64(1_000.0),
            reason: "test".to_string(),
        };

        let trade = broker.execute(&order, Money::from_f64(100.0)).await.unwrap();
        let account = store.load_account().unwrap();

        let expected_price = Money::from_f64(100.0) * Money::from_f64(1.0015);
        assert_eq!(trade.price, expected_price);
        assert_eq!(account.cash, Money::from_f64(10_000.0) - trade.value - trade.fee);
    }

    #[tokio::test]
    async fn sell_more_than_held_is_rejected() {
        let store = test_store();
        let broker = PaperBroker::new(store.clone(), 10, 5);
        let buy = Order {
            strategy_id: 1,
            symbol: Symbol::new("BTC"),
            side: Side::Buy,
            notional_or_amount: Money::from_f64(1_000.0),
            reason: "test".to_string(),
        };
        broker.execute(&buy, Money::from_f64(100.0)).await.unwrap();

        let sell = Order {
            strategy_id: 1,
            symbol: Symbol::new("BTC"),
            side: Side::Sell,
            notional_or_amount: Money::from_f64(999.0),
            reason: "test".to_string(),
        };
        let result = broker.execute(&sell, Money::from_f64(100.0)).await;
        assert!(matches!(result, Err(BrokerError::InsufficientHolding { .. })));
    }

    #[tokio::test]
    async fn position_deleted_when_amount_reaches_zero() {
        let store = test_store();
        let broker = PaperBroker::new(store.clone(), 10, 5);
        let buy = Order {
            strategy_id: 1,
            symbol: Symbol::new("BTC"),
            side: Side::Buy,
            notional_or_amount: Money::from_f64(1_000.0),
            reason: "test".to_string(),
        };
        let trade = broker.execute(&buy, Money::from_f64(100.0)).await.unwrap();

        let sell = Order {
            strategy_id: 1,
            symbol: Symbol::new("BTC"),
            side: Side::Sell,
            notional_or_amount: trade.amount,
            reason: "test".to_string(),
        };
        broker.execute(&sell, Money::from_f64(100.0)).await.unwrap();

        assert!(store.load_position(&Symbol::new("BTC")).unwrap().is_none());
    }
}
