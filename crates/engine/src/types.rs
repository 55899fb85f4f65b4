//! Types for the backtesting engine

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::fees::FeeModel;

// ============================================================================
// Market data
// ============================================================================

/// A single observed price for one outcome token
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    #[serde(rename = "t")]
    pub timestamp: i64,
    #[serde(rename = "p")]
    pub price: Decimal,
}

impl PricePoint {
    pub fn new(timestamp: i64, price: Decimal) -> Self {
        Self { timestamp, price }
    }
}

/// One tradeable outcome of a market (e.g. "Yes" / "No")
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketToken {
    pub token_id: String,
    #[serde(default)]
    pub outcome: String,
}

/// Market metadata as shipped with a dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Market {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub tokens: Vec<MarketToken>,
    #[serde(default)]
    pub end_date: Option<String>,
}

/// Collection-level metadata of a dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionMetadata {
    #[serde(default)]
    pub collected_at: Option<String>,
    #[serde(default)]
    pub total_markets: usize,
    #[serde(default)]
    pub total_tokens: usize,
    #[serde(default)]
    pub source: Option<String>,
}

/// Per-token price history plus market metadata, fully loaded in memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub markets: Vec<Market>,
    #[serde(default, alias = "priceHistory")]
    pub price_history: BTreeMap<String, Vec<PricePoint>>,
    #[serde(default, alias = "collectionMetadata")]
    pub metadata: CollectionMetadata,
}

impl Dataset {
    pub fn token_ids(&self) -> impl Iterator<Item = &str> {
        self.price_history.keys().map(String::as_str)
    }

    pub fn token_count(&self) -> usize {
        self.price_history.len()
    }

    pub fn point_count(&self) -> usize {
        self.price_history.values().map(Vec::len).sum()
    }

    /// A dataset restricted to the given tokens (unknown ids are ignored)
    pub fn subset<'a, I>(&self, tokens: I) -> Dataset
    where
        I: IntoIterator<Item = &'a str>,
    {
        let price_history: BTreeMap<String, Vec<PricePoint>> = tokens
            .into_iter()
            .filter_map(|id| {
                self.price_history
                    .get(id)
                    .map(|points| (id.to_string(), points.clone()))
            })
            .collect();

        let markets = self
            .markets
            .iter()
            .filter(|m| {
                m.tokens
                    .iter()
                    .any(|t| price_history.contains_key(&t.token_id))
            })
            .cloned()
            .collect();

        Dataset {
            markets,
            metadata: CollectionMetadata {
                total_tokens: price_history.len(),
                ..self.metadata.clone()
            },
            price_history,
        }
    }
}

/// A synthetic bar built from one price point (open = high = low = close)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub token_id: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Bar {
    pub fn from_point(token_id: &str, point: &PricePoint) -> Self {
        Self {
            timestamp: point.timestamp,
            token_id: token_id.to_string(),
            open: point.price,
            high: point.price,
            low: point.price,
            close: point.price,
        }
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Side of a trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "BUY"),
            TradeSide::Sell => write!(f, "SELL"),
        }
    }
}

/// An executed trade. `total_cost` includes the fee on buys and is net of the
/// fee on sells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub token_id: String,
    pub side: TradeSide,
    pub size: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub total_cost: Decimal,
    pub position_size_after: Decimal,
    pub capital_after: Decimal,
}

/// An open holding in one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub token_id: String,
    pub size: Decimal,
    /// Weighted-average entry price (fees excluded)
    pub avg_price: Decimal,
    pub current_value: Decimal,
    pub pnl: Decimal,
}

/// Outcome of an order request. Failures never mutate the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade: Option<TradeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrderResult {
    pub fn filled(trade: TradeRecord) -> Self {
        Self {
            success: true,
            trade: Some(trade),
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            trade: None,
            error: Some(reason.into()),
        }
    }
}

// ============================================================================
// Backtest configuration and result
// ============================================================================

/// Configuration for a backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: Decimal,
    pub fee_model: FeeModel,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: Decimal::from(1000),
            fee_model: FeeModel::default(),
        }
    }
}

impl BacktestConfig {
    pub fn with_fee_rate(fee_rate: Decimal) -> Self {
        Self {
            fee_model: FeeModel::Flat { rate: fee_rate },
            ..Default::default()
        }
    }
}

/// A point on the equity curve, sampled after each trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub time: i64,
    pub equity: Decimal,
}

/// Result of a backtest run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy: String,
    pub start_time: i64,
    pub end_time: i64,
    pub bars_processed: usize,
    pub initial_capital: Decimal,
    /// Cash plus residual positions valued at their last prices
    pub final_capital: Decimal,
    pub total_return: Decimal,
    /// Percent, e.g. 12.5 = +12.5%
    pub total_return_pct: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: f64,
    /// Percent below the running peak, 25.0 = 25%
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub total_fees: Decimal,
    pub positions: Vec<Position>,
    pub trades: Vec<TradeRecord>,
    pub equity_curve: Vec<EquityPoint>,
}
