//! Trading fee models
//!
//! Two models are supported:
//! - `Flat`: fee = size × price × rate (the default, used by the optimizer)
//! - `PolymarketTaker`: fee = C × feeRate × (p × (1 - p))^exponent, the curve
//!   used on Polymarket's short-horizon crypto markets

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Polymarket taker fee curve parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolymarketFeeConfig {
    /// Fee rate (default 0.25)
    pub fee_rate: Decimal,
    /// Exponent for the price factor (default 2)
    pub exponent: u32,
}

impl Default for PolymarketFeeConfig {
    fn default() -> Self {
        Self {
            fee_rate: dec!(0.25),
            exponent: 2,
        }
    }
}

/// Fee charged on every fill, buys and sells alike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeModel {
    /// Proportional to notional: `size × price × rate`
    Flat { rate: Decimal },
    PolymarketTaker(PolymarketFeeConfig),
}

impl Default for FeeModel {
    fn default() -> Self {
        FeeModel::Flat {
            rate: Decimal::ZERO,
        }
    }
}

impl FeeModel {
    pub fn flat(rate: Decimal) -> Self {
        FeeModel::Flat { rate }
    }

    /// Fee for a fill of `size` shares at `price`
    pub fn fee(&self, size: Decimal, price: Decimal) -> Decimal {
        match self {
            FeeModel::Flat { rate } => size * price * *rate,
            FeeModel::PolymarketTaker(config) => calculate_taker_fee(size, price, config),
        }
    }
}

impl std::fmt::Display for FeeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeeModel::Flat { rate } => write!(f, "flat {}%", rate * dec!(100)),
            FeeModel::PolymarketTaker(c) => {
                write!(f, "polymarket taker (rate {}, exp {})", c.fee_rate, c.exponent)
            }
        }
    }
}

/// Taker fee for `shares` at `price` on the Polymarket curve.
///
/// Rounded down to 4 decimal places; anything below 0.0001 is free.
pub fn calculate_taker_fee(
    shares: Decimal,
    price: Decimal,
    config: &PolymarketFeeConfig,
) -> Decimal {
    if shares <= Decimal::ZERO || price <= Decimal::ZERO || price >= Decimal::ONE {
        return Decimal::ZERO;
    }

    let base = price * (Decimal::ONE - price);
    let factor = (0..config.exponent).fold(Decimal::ONE, |acc, _| acc * base);

    let scale = dec!(10000);
    let fee = (shares * config.fee_rate * factor * scale).floor() / scale;

    if fee < dec!(0.0001) {
        Decimal::ZERO
    } else {
        fee
    }
}
