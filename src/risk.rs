//! Risk filter.
//!
//! A stateless-per-decision predicate: given a proposed order, the account,
//! and current positions, it accepts or vetoes. The one piece of state it
//! owns is the circuit breaker flag on `Account`, which it may *set* (never
//! clear — that's an explicit admin action) when a hard-drawdown breach
//! fires.
//!
//! Generalizes the drawdown/heat-limiting shape of the original
//! `RiskManager` (percentage thresholds, a capital high-water mark) to the
//! ordered veto-reason contract the scheduler needs, instead of a position
//! sizer.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::LastPriceSource;
use crate::error::{PersistenceError, RiskVerdict, VetoReason};
use crate::persistence::Store;
use crate::types::{Account, Money, Order, Position, Side, Symbol};

#[derive(Debug, Clone)]
pub struct RiskFilterConfig {
    pub max_trade_notional_pct: f64,
    pub max_symbol_exposure_pct: f64,
    pub soft_drawdown_pct: f64,
    pub hard_drawdown_pct: f64,
}

impl Default for RiskFilterConfig {
    fn default() -> Self {
        Self {
            max_trade_notional_pct: 0.05,
            max_symbol_exposure_pct: 0.25,
            soft_drawdown_pct: 0.10,
            hard_drawdown_pct: 0.20,
        }
    }
}

pub struct RiskFilter {
    store: Arc<Store>,
    config: RiskFilterConfig,
}

impl RiskFilter {
    pub fn new(store: Arc<Store>, config: RiskFilterConfig) -> Self {
        Self { store, config }
    }

    /// Evaluate a proposed order against the current account/position state.
    /// May persist an updated `Account` if this call trips the circuit breaker.
    pub fn evaluate(
        &self,
        order: &Order,
        prices: &dyn LastPriceSource,
    ) -> Result<RiskVerdict, PersistenceError> {
        let mut account = self.store.load_account()?;
        let positions = self.store.load_positions()?;
        let equity = compute_equity(&account, &positions, prices);

        if account.circuit_breaker_active {
            return Ok(RiskVerdict::Veto(VetoReason::CircuitBreaker));
        }

        let notional = order_notional(order, &positions, prices);
        if equity.is_positive() && notional > equity * Money::from_f64(self.config.max_trade_notional_pct)
        {
            return Ok(RiskVerdict::Veto(VetoReason::TradeCap));
        }

        if order.side == Side::Buy {
            let projected_value = projected_symbol_value(order, &positions, prices, notional);
            if equity.is_positive()
                && projected_value > equity * Money::from_f64(self.config.max_symbol_exposure_pct)
            {
                return Ok(RiskVerdict::Veto(VetoReason::ExposureCap));
            }
        }

        let drawdown = compute_drawdown(&account, equity);

        if drawdown >= self.config.hard_drawdown_pct {
            account.circuit_breaker_active = true;
            account.circuit_breaker_reason = Some(VetoReason::DrawdownHard.to_string());
            self.store.save_account(&account)?;
            tracing::warn!(drawdown, "circuit breaker tripped: hard drawdown");
            return Ok(RiskVerdict::Veto(VetoReason::DrawdownHard));
        }

        if drawdown >= self.config.soft_drawdown_pct && order.side == Side::Buy {
            return Ok(RiskVerdict::Veto(VetoReason::DrawdownSoft));
        }

        Ok(RiskVerdict::Accept)
    }
}

fn compute_equity(account: &Account, positions: &HashMap<Symbol, Position>, prices: &dyn LastPriceSource) -> Money {
    let mut equity = account.cash;
    for position in positions.values() {
        let mark = prices.last_price(&position.symbol).unwrap_or(position.average_cost);
        equity += position.amount * mark;
    }
    equity
}

fn compute_drawdown(account: &Account, equity: Money) -> f64 {
    if account.equity_high_water_mark.is_zero() {
        return 0.0;
    }
    1.0 - (equity.to_f64() / account.equity_high_water_mark.to_f64())
}

/// For a BUY, `notional_or_amount` already is the notional. For a SELL, it's
/// an amount; convert to notional at the last price for the trade-cap check.
fn order_notional(order: &Order, _positions: &HashMap<Symbol, Position>, prices: &dyn LastPriceSource) -> Money {
    match order.side {
        Side::Buy => order.notional_or_amount,
        Side::Sell => {
            let last_price = prices.last_price(&order.symbol).unwrap_or(Money::ZERO);
            order.notional_or_amount * last_price
        }
    }
}

fn projected_symbol_value(
    order: &Order,
    positions: &HashMap<Symbol, Position>,
    prices: &dyn LastPriceSource,
    notional: Money,
) -> Money {
    let last_price = prices.last_price(&order.symbol).unwrap_or(Money::ZERO);
    let existing_value = positions
        .get(&order.symbol)
        .map(|p| p.value_at(last_price))
        .unwrap_or(Money::ZERO);
    existing_value + notional
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    struct FixedPrice(Money);
    impl LastPriceSource for FixedPrice {
        fn last_price(&self, _symbol: &Symbol) -> Option<Money> {
            Some(self.0)
        }
    }

    fn store_with_cash(cash: f64) -> Arc<Store> {
        let file = NamedTempFile::new().unwrap();
        let store = Store::open(file.path()).unwrap();
        store.init_account(Money::from_f64(cash)).unwrap();
        std::mem::forget(file);
        Arc::new(store)
    }

    fn order(side: Side, notional_or_amount: f64) -> Order {
        Order {
            strategy_id: 1,
            symbol: Symbol::new("BTC"),
            side,
            notional_or_amount: Money::from_f64(notional_or_amount),
            reason: "test".to_string(),
        }
    }

    #[test]
    fn vetoes_trade_exceeding_notional_cap() {
        let store = store_with_cash(10_000.0);
        let filter = RiskFilter::new(store, RiskFilterConfig::default());
        let verdict = filter
            .evaluate(&order(Side::Buy, 600.0), &FixedPrice(Money::from_f64(100.0)))
            .unwrap();
        assert_eq!(verdict, RiskVerdict::Veto(VetoReason::TradeCap));
    }

    #[test]
    fn accepts_trade_within_caps() {
        let store = store_with_cash(10_000.0);
        let filter = RiskFilter::new(store, RiskFilterConfig::default());
        let verdict = filter
            .evaluate(&order(Side::Buy, 400.0), &FixedPrice(Money::from_f64(100.0)))
            .unwrap();
        assert_eq!(verdict, RiskVerdict::Accept);
    }

    #[test]
    fn vetoes_exposure_cap_on_existing_position() {
        // cash 7000 + position value 2000 = equity 9000, so the 400 buy
        // below (well under the 5% / 450 trade cap) still pushes the BTC
        // position to 2400, past the 25% / 2250 exposure cap.
        let store = store_with_cash(7_000.0);
        store
            .upsert_position(&Position {
                symbol: Symbol::new("BTC"),
                amount: Money::from_f64(20.0),
                average_cost: Money::from_f64(100.0),
                opened_at: chrono::Utc::now(),
                last_updated_at: chrono::Utc::now(),
            })
            .unwrap();
        let filter = RiskFilter::new(store, RiskFilterConfig::default());
        let verdict = filter
            .evaluate(&order(Side::Buy, 400.0), &FixedPrice(Money::from_f64(100.0)))
            .unwrap();
        assert_eq!(verdict, RiskVerdict::Veto(VetoReason::ExposureCap));
    }

    #[test]
    fn hard_drawdown_trips_circuit_breaker_and_vetoes_sells_too() {
        let store = store_with_cash(7_900.0);
        {
            let mut account = store.load_account().unwrap();
            account.equity_high_water_mark = Money::from_f64(10_000.0);
            store.save_account(&account).unwrap();
        }
        let filter = RiskFilter::new(store.clone(), RiskFilterConfig::default());

        let verdict = filter
            .evaluate(&order(Side::Buy, 100.0), &FixedPrice(Money::from_f64(100.0)))
            .unwrap();
        assert_eq!(verdict, RiskVerdict::Veto(VetoReason::DrawdownHard));
        assert!(store.load_account().unwrap().circuit_breaker_active);

        let verdict = filter
            .evaluate(&order(Side::Sell, 1.0), &FixedPrice(Money::from_f64(100.0)))
            .unwrap();
        assert_eq!(verdict, RiskVerdict::Veto(VetoReason::CircuitBreaker));
    }
}
