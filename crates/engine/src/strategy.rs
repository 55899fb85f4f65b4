//! Strategy interface and the generic indicator strategies
//!
//! Every catalogued strategy shares one shape: an indicator decides entries
//! (and optionally exits), a stop loss / trailing stop protects open trades,
//! and each entry spends `risk_percent` of free cash. Only the indicator and
//! its parameters differ between kinds.

use std::collections::HashMap;
use std::str::FromStr;

use persistence::{ParamMap, ParameterStore};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::BacktestContext;
use crate::error::{EngineError, EngineResult};
use crate::indicators::{
    build_signal_generator, CombineMode, IndicatorConfig, MaKind, Signal, SignalGenerator,
};
use crate::optimizer::{ParamConfig, ParamSpace};
use crate::types::Bar;

// ============================================================================
// Strategy trait
// ============================================================================

/// Callbacks driven by [`crate::engine::BacktestEngine::run`]
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn on_init(&mut self, _ctx: &mut BacktestContext<'_>) {}

    /// Called once per bar, tokens in ascending id order within a timestamp
    fn on_next(&mut self, ctx: &mut BacktestContext<'_>, bar: &Bar);

    fn on_complete(&mut self, _ctx: &mut BacktestContext<'_>) {}
}

// ============================================================================
// Catalog
// ============================================================================

/// Entries only happen strictly inside this price band
pub const MIN_ENTRY_PRICE: Decimal = dec!(0.05);
pub const MAX_ENTRY_PRICE: Decimal = dec!(0.95);
/// Fraction of the allotted cash actually spent, leaving room for fees
pub const CASH_BUFFER: Decimal = dec!(0.995);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SimpleMa,
    EmaCross,
    Rsi,
    Stochastic,
    Bollinger,
    ChannelBreakout,
    RsiBollinger,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 7] = [
        StrategyKind::SimpleMa,
        StrategyKind::EmaCross,
        StrategyKind::Rsi,
        StrategyKind::Stochastic,
        StrategyKind::Bollinger,
        StrategyKind::ChannelBreakout,
        StrategyKind::RsiBollinger,
    ];

    /// Identifier used on the command line and for `<name>.params.json`
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::SimpleMa => "simple_ma",
            StrategyKind::EmaCross => "ema_cross",
            StrategyKind::Rsi => "rsi",
            StrategyKind::Stochastic => "stochastic",
            StrategyKind::Bollinger => "bollinger",
            StrategyKind::ChannelBreakout => "channel_breakout",
            StrategyKind::RsiBollinger => "rsi_bollinger",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StrategyKind::SimpleMa => "SMA crossover with stop loss and optional trailing stop",
            StrategyKind::EmaCross => "EMA crossover with stop loss and optional trailing stop",
            StrategyKind::Rsi => "RSI mean reversion: buy oversold, sell overbought",
            StrategyKind::Stochastic => "Stochastic %K/%D crosses in oversold/overbought zones",
            StrategyKind::Bollinger => "Bollinger Bands, mean reversion or breakout",
            StrategyKind::ChannelBreakout => "Donchian channel breakout",
            StrategyKind::RsiBollinger => "RSI and Bollinger mean reversion must agree",
        }
    }

    /// Built-in parameter values
    pub fn default_params(&self) -> ParamMap {
        let pairs: &[(&str, f64)] = match self {
            StrategyKind::SimpleMa => &[
                ("fast_period", 10.0),
                ("slow_period", 30.0),
                ("stop_loss", 0.05),
                ("trailing_stop", 0.0),
                ("risk_percent", 0.2),
            ],
            StrategyKind::EmaCross => &[
                ("fast_period", 12.0),
                ("slow_period", 26.0),
                ("stop_loss", 0.05),
                ("trailing_stop", 1.0),
                ("risk_percent", 0.2),
            ],
            StrategyKind::Rsi => &[
                ("rsi_period", 14.0),
                ("rsi_oversold", 30.0),
                ("rsi_overbought", 70.0),
                ("stop_loss", 0.05),
                ("trailing_stop", 0.0),
                ("risk_percent", 0.1),
            ],
            StrategyKind::Stochastic => &[
                ("k_period", 14.0),
                ("d_period", 3.0),
                ("oversold", 20.0),
                ("overbought", 80.0),
                ("stop_loss", 0.04),
                ("trailing_stop", 0.0),
                ("risk_percent", 0.05),
            ],
            StrategyKind::Bollinger => &[
                ("period", 20.0),
                ("std_dev_multiplier", 2.0),
                ("stop_loss", 0.03),
                ("trailing_stop", 1.0),
                ("risk_percent", 0.15),
                ("mean_reversion", 1.0),
            ],
            StrategyKind::ChannelBreakout => &[
                ("channel_period", 20.0),
                ("stop_loss", 0.05),
                ("trailing_stop", 1.0),
                ("risk_percent", 0.1),
            ],
            StrategyKind::RsiBollinger => &[
                ("rsi_period", 14.0),
                ("rsi_oversold", 30.0),
                ("rsi_overbought", 70.0),
                ("bb_period", 20.0),
                ("bb_std_dev", 2.0),
                ("stop_loss", 0.05),
                ("trailing_stop", 0.0),
                ("risk_percent", 0.1),
            ],
        };
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Default optimization ranges
    pub fn param_space(&self) -> ParamSpace {
        let space = ParamSpace::new();
        match self {
            StrategyKind::SimpleMa => space
                .with("fast_period", ParamConfig::new(5.0, 30.0, 5.0))
                .with("slow_period", ParamConfig::new(20.0, 100.0, 10.0))
                .with("stop_loss", ParamConfig::new(0.02, 0.1, 0.02))
                .with("trailing_stop", ParamConfig::new(0.0, 0.0, 1.0))
                .with("risk_percent", ParamConfig::new(0.1, 0.5, 0.1)),
            StrategyKind::EmaCross => space
                .with("fast_period", ParamConfig::new(3.0, 20.0, 1.0))
                .with("slow_period", ParamConfig::new(15.0, 60.0, 5.0))
                .with("stop_loss", ParamConfig::new(0.02, 0.1, 0.02))
                .with("trailing_stop", ParamConfig::new(0.0, 1.0, 1.0))
                .with("risk_percent", ParamConfig::new(0.1, 0.5, 0.1)),
            StrategyKind::Rsi => space
                .with("rsi_period", ParamConfig::new(3.0, 10.0, 1.0))
                .with("rsi_oversold", ParamConfig::new(15.0, 35.0, 5.0))
                .with("rsi_overbought", ParamConfig::new(65.0, 85.0, 5.0))
                .with("stop_loss", ParamConfig::new(0.02, 0.1, 0.02))
                .with("risk_percent", ParamConfig::new(0.05, 0.3, 0.05)),
            StrategyKind::Stochastic => space
                .with("k_period", ParamConfig::new(5.0, 21.0, 1.0))
                .with("d_period", ParamConfig::new(2.0, 6.0, 1.0))
                .with("oversold", ParamConfig::new(5.0, 30.0, 5.0))
                .with("overbought", ParamConfig::new(70.0, 95.0, 5.0))
                .with("stop_loss", ParamConfig::new(0.02, 0.1, 0.01))
                .with("risk_percent", ParamConfig::new(0.05, 0.3, 0.05)),
            StrategyKind::Bollinger => space
                .with("period", ParamConfig::new(10.0, 50.0, 5.0))
                .with("std_dev_multiplier", ParamConfig::new(1.5, 3.0, 0.5))
                .with("stop_loss", ParamConfig::new(0.01, 0.1, 0.02))
                .with("trailing_stop", ParamConfig::new(0.0, 1.0, 1.0))
                .with("risk_percent", ParamConfig::new(0.05, 0.3, 0.05))
                .with("mean_reversion", ParamConfig::new(0.0, 1.0, 1.0)),
            StrategyKind::ChannelBreakout => space
                .with("channel_period", ParamConfig::new(5.0, 50.0, 5.0))
                .with("stop_loss", ParamConfig::new(0.02, 0.1, 0.02))
                .with("trailing_stop", ParamConfig::new(0.0, 1.0, 1.0))
                .with("risk_percent", ParamConfig::new(0.05, 0.3, 0.05)),
            StrategyKind::RsiBollinger => space
                .with("rsi_period", ParamConfig::new(3.0, 14.0, 1.0))
                .with("rsi_oversold", ParamConfig::new(15.0, 35.0, 5.0))
                .with("rsi_overbought", ParamConfig::new(65.0, 85.0, 5.0))
                .with("bb_period", ParamConfig::new(10.0, 40.0, 5.0))
                .with("bb_std_dev", ParamConfig::new(1.5, 3.0, 0.5))
                .with("stop_loss", ParamConfig::new(0.02, 0.1, 0.02))
                .with("risk_percent", ParamConfig::new(0.05, 0.3, 0.05)),
        }
    }

    /// Indicator configuration for a fully resolved parameter map
    pub fn indicator(&self, params: &ParamMap) -> EngineResult<IndicatorConfig> {
        Ok(match self {
            StrategyKind::SimpleMa | StrategyKind::EmaCross => IndicatorConfig::MaCross {
                kind: if *self == StrategyKind::SimpleMa {
                    MaKind::Sma
                } else {
                    MaKind::Ema
                },
                fast_period: period(params, "fast_period")?,
                slow_period: period(params, "slow_period")?,
            },
            StrategyKind::Rsi => IndicatorConfig::Rsi {
                period: period(params, "rsi_period")?,
                oversold: value(params, "rsi_oversold")?,
                overbought: value(params, "rsi_overbought")?,
            },
            StrategyKind::Stochastic => IndicatorConfig::Stochastic {
                k_period: period(params, "k_period")?,
                d_period: period(params, "d_period")?,
                oversold: value(params, "oversold")?,
                overbought: value(params, "overbought")?,
            },
            StrategyKind::Bollinger => IndicatorConfig::Bollinger {
                period: period(params, "period")?,
                std_dev_multiplier: value(params, "std_dev_multiplier")?,
                mean_reversion: flag(params, "mean_reversion")?,
            },
            StrategyKind::ChannelBreakout => IndicatorConfig::ChannelBreakout {
                period: period(params, "channel_period")?,
            },
            StrategyKind::RsiBollinger => IndicatorConfig::Combo {
                mode: CombineMode::Unanimous,
                members: vec![
                    IndicatorConfig::Rsi {
                        period: period(params, "rsi_period")?,
                        oversold: value(params, "rsi_oversold")?,
                        overbought: value(params, "rsi_overbought")?,
                    },
                    IndicatorConfig::Bollinger {
                        period: period(params, "bb_period")?,
                        std_dev_multiplier: value(params, "bb_std_dev")?,
                        mean_reversion: true,
                    },
                ],
            },
        })
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        StrategyKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| EngineError::UnknownStrategy(s.to_string()))
    }
}

// ============================================================================
// Parameter helpers
// ============================================================================

fn value(params: &ParamMap, name: &str) -> EngineResult<f64> {
    let v = params
        .get(name)
        .copied()
        .ok_or_else(|| EngineError::MissingParameter(name.to_string()))?;
    if !v.is_finite() {
        return Err(EngineError::InvalidParameter {
            name: name.to_string(),
            reason: format!("{v} is not a finite number"),
        });
    }
    Ok(v)
}

/// Window lengths are floored and at least 1
fn period(params: &ParamMap, name: &str) -> EngineResult<usize> {
    Ok(value(params, name)?.floor().max(1.0) as usize)
}

fn flag(params: &ParamMap, name: &str) -> EngineResult<bool> {
    Ok(value(params, name)? >= 0.5)
}

fn fraction(params: &ParamMap, name: &str) -> EngineResult<Decimal> {
    let v = value(params, name)?;
    if !(0.0..=1.0).contains(&v) {
        return Err(EngineError::InvalidParameter {
            name: name.to_string(),
            reason: format!("{v} is outside [0, 1]"),
        });
    }
    Decimal::from_f64(v).ok_or_else(|| EngineError::InvalidParameter {
        name: name.to_string(),
        reason: format!("{v} cannot be represented"),
    })
}

/// Merge parameters: built-in defaults < saved override < explicit values.
///
/// Saved keys the strategy does not know are dropped; unknown explicit keys
/// are an error.
pub fn resolve_params(
    kind: StrategyKind,
    store: Option<&dyn ParameterStore>,
    explicit: &ParamMap,
) -> EngineResult<ParamMap> {
    let mut params = kind.default_params();

    if let Some(store) = store {
        if let Some(saved) = store.load(kind.name())? {
            for (key, v) in saved {
                match params.get_mut(&key) {
                    Some(slot) => *slot = v,
                    None => debug!(strategy = kind.name(), key = %key, "Ignoring unknown saved param"),
                }
            }
        }
    }

    for (key, v) in explicit {
        match params.get_mut(key) {
            Some(slot) => *slot = *v,
            None => {
                return Err(EngineError::InvalidParameter {
                    name: key.clone(),
                    reason: format!("not a parameter of {}", kind.name()),
                })
            }
        }
    }

    Ok(params)
}

// ============================================================================
// Generic strategy
// ============================================================================

/// Stop loss, trailing stop and sizing shared by all kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    pub stop_loss: Decimal,
    pub trailing_stop: bool,
    pub risk_percent: Decimal,
}

impl ExitRules {
    pub fn from_params(params: &ParamMap) -> EngineResult<Self> {
        Ok(Self {
            stop_loss: fraction(params, "stop_loss")?,
            trailing_stop: match params.get("trailing_stop") {
                Some(_) => flag(params, "trailing_stop")?,
                None => false,
            },
            risk_percent: fraction(params, "risk_percent")?,
        })
    }
}

#[derive(Debug, Clone)]
struct OpenTrade {
    entry_price: Decimal,
    highest: Decimal,
}

/// Per-token state: the indicator lives from the token's first bar, the open
/// trade only while a position is held
struct TokenState {
    signals: Box<dyn SignalGenerator>,
    trade: Option<OpenTrade>,
}

pub struct GenericStrategy {
    kind: StrategyKind,
    params: ParamMap,
    exits: ExitRules,
    prototype: Box<dyn SignalGenerator>,
    tokens: HashMap<String, TokenState>,
}

impl GenericStrategy {
    /// Build from a fully resolved parameter map (see [`resolve_params`])
    pub fn new(kind: StrategyKind, params: ParamMap) -> EngineResult<Self> {
        let indicator = kind.indicator(&params)?;
        let prototype = build_signal_generator(&indicator)?;
        let exits = ExitRules::from_params(&params)?;
        Ok(Self {
            kind,
            params,
            exits,
            prototype,
            tokens: HashMap::new(),
        })
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn params(&self) -> &ParamMap {
        &self.params
    }

    pub fn exits(&self) -> &ExitRules {
        &self.exits
    }

    fn should_exit(&self, trade: &OpenTrade, price: Decimal, signal: Signal) -> bool {
        let stop = Decimal::ONE - self.exits.stop_loss;
        if price <= trade.entry_price * stop {
            return true;
        }
        if self.exits.trailing_stop && price > trade.entry_price && price <= trade.highest * stop {
            return true;
        }
        signal == Signal::Sell
    }
}

impl Strategy for GenericStrategy {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn on_init(&mut self, _ctx: &mut BacktestContext<'_>) {
        self.tokens.clear();
    }

    fn on_next(&mut self, ctx: &mut BacktestContext<'_>, bar: &Bar) {
        let price = bar.close;
        let Some(price_f64) = price.to_f64() else {
            return;
        };

        let prototype = &self.prototype;
        let state = self
            .tokens
            .entry(bar.token_id.clone())
            .or_insert_with(|| TokenState {
                signals: prototype.boxed_clone(),
                trade: None,
            });
        let signal = state.signals.on_price(price_f64);

        if ctx.position(&bar.token_id).is_none() {
            // Flat: forget any stale trade, look for an entry
            state.trade = None;
            if signal == Signal::Buy && price > MIN_ENTRY_PRICE && price < MAX_ENTRY_PRICE {
                let cash = ctx.capital() * self.exits.risk_percent * CASH_BUFFER;
                let size = cash / price;
                if size > Decimal::ZERO && ctx.buy(&bar.token_id, size).success {
                    state.trade = Some(OpenTrade {
                        entry_price: price,
                        highest: price,
                    });
                }
            }
            return;
        }

        let trade = state.trade.get_or_insert(OpenTrade {
            entry_price: price,
            highest: price,
        });
        if price > trade.highest {
            trade.highest = price;
        }
        let trade = trade.clone();

        if self.should_exit(&trade, price, signal) && ctx.close(&bar.token_id).success {
            if let Some(state) = self.tokens.get_mut(&bar.token_id) {
                state.trade = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BacktestEngine;
    use crate::types::{BacktestConfig, Dataset, PricePoint};
    use persistence::MemoryParameterStore;

    fn dataset(prices: &[Decimal]) -> Dataset {
        let mut dataset = Dataset::default();
        dataset.price_history.insert(
            "tok".to_string(),
            prices
                .iter()
                .enumerate()
                .map(|(i, &p)| PricePoint::new(i as i64 * 60, p))
                .collect(),
        );
        dataset
    }

    fn channel_params(stop_loss: f64, trailing: f64) -> ParamMap {
        let mut params = StrategyKind::ChannelBreakout.default_params();
        params.insert("channel_period".to_string(), 2.0);
        params.insert("stop_loss".to_string(), stop_loss);
        params.insert("trailing_stop".to_string(), trailing);
        params.insert("risk_percent".to_string(), 0.1);
        params
    }

    #[test]
    fn test_catalog_is_consistent() {
        for kind in StrategyKind::ALL {
            let defaults = kind.default_params();
            let space = kind.param_space();
            space.validate().unwrap();
            for name in space.names() {
                assert!(defaults.contains_key(name), "{kind}: {name} has no default");
            }
            GenericStrategy::new(kind, defaults).unwrap();
            assert_eq!(kind.name().parse::<StrategyKind>().unwrap(), kind);
        }
        assert!("nope".parse::<StrategyKind>().is_err());
        assert_eq!("Simple-MA".parse::<StrategyKind>().unwrap(), StrategyKind::SimpleMa);
    }

    #[test]
    fn test_param_precedence() {
        let mut saved = ParamMap::new();
        saved.insert("fast_period".to_string(), 15.0);
        saved.insert("slow_period".to_string(), 50.0);
        saved.insert("unknown".to_string(), 1.0);
        let store = MemoryParameterStore::new().with("simple_ma", saved);

        let mut explicit = ParamMap::new();
        explicit.insert("slow_period".to_string(), 60.0);

        let params = resolve_params(StrategyKind::SimpleMa, Some(&store), &explicit).unwrap();
        assert_eq!(params["fast_period"], 15.0);
        assert_eq!(params["slow_period"], 60.0);
        assert_eq!(params["stop_loss"], 0.05);
        assert!(!params.contains_key("unknown"));

        let without_store = resolve_params(StrategyKind::SimpleMa, None, &ParamMap::new()).unwrap();
        assert_eq!(without_store, StrategyKind::SimpleMa.default_params());

        explicit.insert("bogus".to_string(), 1.0);
        assert!(resolve_params(StrategyKind::SimpleMa, None, &explicit).is_err());
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let mut params = StrategyKind::Rsi.default_params();
        params.insert("risk_percent".to_string(), 1.5);
        assert!(GenericStrategy::new(StrategyKind::Rsi, params).is_err());
    }

    #[test]
    fn test_entry_sizing_and_stop_loss() {
        let prices = [dec!(0.5), dec!(0.5), dec!(0.6), dec!(0.5)];
        let mut strategy = GenericStrategy::new(StrategyKind::ChannelBreakout, channel_params(0.05, 0.0)).unwrap();
        let result = BacktestEngine::new(&dataset(&prices), BacktestConfig::default()).run(&mut strategy);

        assert_eq!(result.total_trades, 2);
        let entry = &result.trades[0];
        assert_eq!(entry.price, dec!(0.6));
        // 1000 × 0.1 × 0.995 / 0.6
        assert_eq!(entry.size, dec!(99.5) / dec!(0.6));
        let exit = &result.trades[1];
        assert_eq!(exit.price, dec!(0.5));
        assert_eq!(result.losing_trades, 1);
        assert!(result.positions.is_empty());
    }

    #[test]
    fn test_trailing_stop_locks_in_gain() {
        let prices = [dec!(0.5), dec!(0.5), dec!(0.6), dec!(0.8), dec!(0.71)];
        let mut strategy = GenericStrategy::new(StrategyKind::ChannelBreakout, channel_params(0.1, 1.0)).unwrap();
        let result = BacktestEngine::new(&dataset(&prices), BacktestConfig::default()).run(&mut strategy);

        assert_eq!(result.total_trades, 2);
        assert_eq!(result.trades[1].price, dec!(0.71));
        assert_eq!(result.winning_trades, 1);

        // Same path without the trailing stop keeps the position
        let mut strategy = GenericStrategy::new(StrategyKind::ChannelBreakout, channel_params(0.1, 0.0)).unwrap();
        let result = BacktestEngine::new(&dataset(&prices), BacktestConfig::default()).run(&mut strategy);
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.positions.len(), 1);
    }

    #[test]
    fn test_no_entry_outside_price_band() {
        let prices = [dec!(0.90), dec!(0.90), dec!(0.96), dec!(0.97)];
        let mut strategy = GenericStrategy::new(StrategyKind::ChannelBreakout, channel_params(0.05, 0.0)).unwrap();
        let result = BacktestEngine::new(&dataset(&prices), BacktestConfig::default()).run(&mut strategy);
        assert_eq!(result.total_trades, 0);
    }

    #[test]
    fn test_tokens_have_independent_state() {
        let mut dataset = dataset(&[dec!(0.5), dec!(0.5), dec!(0.6)]);
        // Second token never breaks out
        dataset.price_history.insert(
            "flat".to_string(),
            (0..3).map(|i| PricePoint::new(i * 60, dec!(0.4))).collect(),
        );
        let mut strategy = GenericStrategy::new(StrategyKind::ChannelBreakout, channel_params(0.05, 0.0)).unwrap();
        let result = BacktestEngine::new(&dataset, BacktestConfig::default()).run(&mut strategy);

        assert_eq!(result.total_trades, 1);
        assert_eq!(result.trades[0].token_id, "tok");
    }
}
