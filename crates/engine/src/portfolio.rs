//! Cash and position ledger
//!
//! Every mutation goes through `buy` / `sell` / `close` and leaves a
//! `TradeRecord` behind. Rejected orders leave the ledger untouched.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::fees::FeeModel;
use crate::types::{OrderResult, Position, TradeRecord, TradeSide};

/// Shortfall tolerated on buys so that "spend all cash" orders survive
/// rounding in the caller's sizing arithmetic.
pub const CAPITAL_EPSILON: Decimal = dec!(0.001);

#[derive(Debug, Clone)]
pub struct Portfolio {
    initial_capital: Decimal,
    capital: Decimal,
    fee_model: FeeModel,
    positions: BTreeMap<String, Position>,
    trades: Vec<TradeRecord>,
    total_fees: Decimal,
}

impl Portfolio {
    pub fn new(initial_capital: Decimal, fee_model: FeeModel) -> Self {
        Self {
            initial_capital,
            capital: initial_capital,
            fee_model,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            total_fees: Decimal::ZERO,
        }
    }

    pub fn initial_capital(&self) -> Decimal {
        self.initial_capital
    }

    /// Free cash
    pub fn capital(&self) -> Decimal {
        self.capital
    }

    pub fn position(&self, token_id: &str) -> Option<&Position> {
        self.positions.get(token_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn total_fees(&self) -> Decimal {
        self.total_fees
    }

    pub fn fee_model(&self) -> &FeeModel {
        &self.fee_model
    }

    /// Buy `size` shares of `token_id` at `price`
    pub fn buy(&mut self, token_id: &str, size: Decimal, price: Decimal, timestamp: i64) -> OrderResult {
        if size <= Decimal::ZERO {
            return OrderResult::rejected(format!("Invalid order size {size}"));
        }
        if price <= Decimal::ZERO {
            return OrderResult::rejected(format!("Invalid price {price}"));
        }

        let cost = size * price;
        let fee = self.fee_model.fee(size, price);
        let total = cost + fee;

        if self.capital < total - CAPITAL_EPSILON {
            debug!(
                token = token_id,
                required = %total,
                available = %self.capital,
                "Buy rejected: insufficient capital"
            );
            return OrderResult::rejected(format!(
                "Insufficient capital: need {total}, have {}",
                self.capital
            ));
        }

        let debit = total.min(self.capital);
        self.capital -= debit;
        self.total_fees += fee;

        let position = self
            .positions
            .entry(token_id.to_string())
            .or_insert_with(|| Position {
                token_id: token_id.to_string(),
                size: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                current_value: Decimal::ZERO,
                pnl: Decimal::ZERO,
            });

        let new_size = position.size + size;
        position.avg_price = (position.avg_price * position.size + price * size) / new_size;
        position.size = new_size;
        position.current_value = new_size * price;
        position.pnl = position.current_value - new_size * position.avg_price;

        let trade = TradeRecord {
            timestamp,
            token_id: token_id.to_string(),
            side: TradeSide::Buy,
            size,
            price,
            fee,
            total_cost: debit,
            position_size_after: new_size,
            capital_after: self.capital,
        };
        self.trades.push(trade.clone());

        OrderResult::filled(trade)
    }

    /// Sell `size` shares of an existing position at `price`
    pub fn sell(&mut self, token_id: &str, size: Decimal, price: Decimal, timestamp: i64) -> OrderResult {
        if size <= Decimal::ZERO {
            return OrderResult::rejected(format!("Invalid order size {size}"));
        }
        if price <= Decimal::ZERO {
            return OrderResult::rejected(format!("Invalid price {price}"));
        }

        let Some(position) = self.positions.get_mut(token_id) else {
            return OrderResult::rejected(format!("No position in {token_id}"));
        };
        if position.size < size {
            return OrderResult::rejected(format!(
                "Insufficient position: holding {}, selling {size}",
                position.size
            ));
        }

        let fee = self.fee_model.fee(size, price);
        let proceeds = (size * price - fee).max(Decimal::ZERO);

        position.size -= size;
        let remaining = position.size;
        if remaining.is_zero() {
            self.positions.remove(token_id);
        } else {
            position.current_value = remaining * price;
            position.pnl = position.current_value - remaining * position.avg_price;
        }

        self.capital += proceeds;
        self.total_fees += fee;

        let trade = TradeRecord {
            timestamp,
            token_id: token_id.to_string(),
            side: TradeSide::Sell,
            size,
            price,
            fee,
            total_cost: proceeds,
            position_size_after: remaining,
            capital_after: self.capital,
        };
        self.trades.push(trade.clone());

        OrderResult::filled(trade)
    }

    /// Sell the entire position
    pub fn close(&mut self, token_id: &str, price: Decimal, timestamp: i64) -> OrderResult {
        match self.positions.get(token_id) {
            Some(position) => {
                let size = position.size;
                self.sell(token_id, size, price, timestamp)
            }
            None => OrderResult::rejected(format!("No position in {token_id}")),
        }
    }

    /// Mark positions to market. Tokens without a price keep their last value.
    pub fn update_position_values<F>(&mut self, price_of: F)
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        for position in self.positions.values_mut() {
            if let Some(price) = price_of(&position.token_id) {
                position.current_value = position.size * price;
                position.pnl = position.current_value - position.size * position.avg_price;
            }
        }
    }

    /// Cash plus positions at the given prices
    pub fn total_value<F>(&self, price_of: F) -> Decimal
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        let holdings: Decimal = self
            .positions
            .values()
            .map(|p| match price_of(&p.token_id) {
                Some(price) => p.size * price,
                None => p.current_value,
            })
            .sum();
        self.capital + holdings
    }

    pub fn pnl<F>(&self, price_of: F) -> Decimal
    where
        F: Fn(&str) -> Option<Decimal>,
    {
        self.total_value(price_of) - self.initial_capital
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_portfolio() -> Portfolio {
        Portfolio::new(dec!(1000), FeeModel::default())
    }

    #[test]
    fn test_weighted_average_price() {
        let mut p = free_portfolio();
        assert!(p.buy("A", dec!(100), dec!(0.40), 1).success);
        assert!(p.buy("A", dec!(300), dec!(0.60), 2).success);

        let pos = p.position("A").unwrap();
        assert_eq!(pos.size, dec!(400));
        // (100×0.40 + 300×0.60) / 400 = 0.55
        assert_eq!(pos.avg_price, dec!(0.55));
        assert_eq!(p.capital(), dec!(780));
    }

    #[test]
    fn test_buy_rejected_without_capital() {
        let mut p = free_portfolio();
        let result = p.buy("A", dec!(5000), dec!(0.50), 1);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Insufficient capital"));
        assert_eq!(p.capital(), dec!(1000));
        assert!(p.position("A").is_none());
        assert!(p.trades().is_empty());
    }

    #[test]
    fn test_buy_within_epsilon_never_goes_negative() {
        let mut p = free_portfolio();
        // Costs 1000.0005, inside the tolerance
        let result = p.buy("A", dec!(2000.001), dec!(0.50), 1);
        assert!(result.success);
        assert_eq!(p.capital(), Decimal::ZERO);
    }

    #[test]
    fn test_oversell_fails_without_mutation() {
        let mut p = free_portfolio();
        p.buy("A", dec!(10), dec!(0.50), 1);
        let before = p.clone();

        let result = p.sell("A", dec!(11), dec!(0.50), 2);
        assert!(!result.success);
        assert_eq!(p.capital(), before.capital());
        assert_eq!(p.position("A"), before.position("A"));
        assert_eq!(p.trades().len(), 1);

        assert!(!p.sell("B", dec!(1), dec!(0.50), 2).success);
    }

    #[test]
    fn test_full_sell_removes_position() {
        let mut p = free_portfolio();
        p.buy("A", dec!(10), dec!(0.50), 1);
        p.sell("A", dec!(4), dec!(0.60), 2);
        assert_eq!(p.position("A").unwrap().size, dec!(6));

        let result = p.close("A", dec!(0.70), 3);
        assert!(result.success);
        assert!(p.position("A").is_none());
        assert_eq!(p.positions().count(), 0);
        assert_eq!(result.trade.unwrap().position_size_after, Decimal::ZERO);
        assert!(!p.close("A", dec!(0.70), 4).success);
    }

    #[test]
    fn test_round_trip_fee_cost() {
        let mut p = Portfolio::new(dec!(1000), FeeModel::flat(dec!(0.01)));
        // $100 notional: pay 101, receive 99
        let buy = p.buy("A", dec!(200), dec!(0.50), 1);
        assert_eq!(buy.trade.unwrap().total_cost, dec!(101));
        let sell = p.sell("A", dec!(200), dec!(0.50), 2);
        assert_eq!(sell.trade.unwrap().total_cost, dec!(99));

        assert_eq!(p.capital(), dec!(998));
        assert_eq!(p.pnl(|_| None), dec!(-2));
        assert_eq!(p.total_fees(), dec!(2));
    }

    #[test]
    fn test_mark_to_market() {
        let mut p = free_portfolio();
        p.buy("A", dec!(100), dec!(0.40), 1);
        p.buy("B", dec!(100), dec!(0.60), 1);

        let prices = |id: &str| match id {
            "A" => Some(dec!(0.50)),
            _ => None,
        };
        p.update_position_values(prices);

        let a = p.position("A").unwrap();
        assert_eq!(a.current_value, dec!(50));
        assert_eq!(a.pnl, dec!(10));
        // B has no price, keeps its fill-time value
        assert_eq!(p.position("B").unwrap().current_value, dec!(60));
        assert_eq!(p.total_value(prices), dec!(1010));
    }

    #[test]
    fn test_rejects_non_positive_inputs() {
        let mut p = free_portfolio();
        assert!(!p.buy("A", Decimal::ZERO, dec!(0.5), 1).success);
        assert!(!p.buy("A", dec!(1), Decimal::ZERO, 1).success);
        assert!(!p.buy("A", dec!(-1), dec!(0.5), 1).success);
        assert!(p.trades().is_empty());
    }
}
