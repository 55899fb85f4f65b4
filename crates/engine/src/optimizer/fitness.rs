//! Fitness of one parameter vector
//!
//! ```text
//! fitness = (0.1 · max(0, sharpe) + 0.9 · total_return / 100) · min(1, trades / 3)
//! ```
//!
//! `total_return` is the dollar P&L of the backtest, not a percentage.
//!
//! The trade factor keeps "never trades" from scoring as well as "trades and
//! breaks even"; zero trades always scores 0.

use std::sync::Arc;

use persistence::ParamMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::engine::{BacktestEngine, BarSeries};
use crate::error::EngineResult;
use crate::fees::FeeModel;
use crate::strategy::{GenericStrategy, StrategyKind};
use crate::types::{BacktestConfig, BacktestResult};

const SHARPE_WEIGHT: f64 = 0.1;
const RETURN_WEIGHT: f64 = 0.9;
const FULL_CONFIDENCE_TRADES: f64 = 3.0;

pub fn fitness_score(sharpe: f64, total_return: f64, trades: u32) -> f64 {
    let confidence = (trades as f64 / FULL_CONFIDENCE_TRADES).min(1.0);
    (SHARPE_WEIGHT * sharpe.max(0.0) + RETURN_WEIGHT * total_return / 100.0) * confidence
}

/// Score of one evaluated vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub fitness: f64,
    /// Dollar P&L
    pub total_return: f64,
    pub sharpe: f64,
    pub trades: u32,
}

impl Evaluation {
    pub fn from_result(result: &BacktestResult) -> Self {
        let total_return = result.total_return.to_f64().unwrap_or(0.0);
        Self {
            fitness: fitness_score(result.sharpe_ratio, total_return, result.total_trades),
            total_return,
            sharpe: result.sharpe_ratio,
            trades: result.total_trades,
        }
    }
}

/// What the optimizers maximize. Must be callable from many threads at once.
pub trait Objective: Send + Sync {
    fn evaluate(&self, params: &ParamMap) -> EngineResult<Evaluation>;
}

impl<F> Objective for F
where
    F: Fn(&ParamMap) -> EngineResult<Evaluation> + Send + Sync,
{
    fn evaluate(&self, params: &ParamMap) -> EngineResult<Evaluation> {
        self(params)
    }
}

/// Backtests one strategy kind over a fixed bar series
#[derive(Clone)]
pub struct FitnessEvaluator {
    kind: StrategyKind,
    base_params: ParamMap,
    series: Arc<BarSeries>,
    config: BacktestConfig,
}

impl FitnessEvaluator {
    /// Evaluation uses $1000 and a flat 0.2% fee
    pub fn new(kind: StrategyKind, base_params: ParamMap, series: Arc<BarSeries>) -> Self {
        Self {
            kind,
            base_params,
            series,
            config: BacktestConfig {
                initial_capital: dec!(1000),
                fee_model: FeeModel::flat(dec!(0.002)),
            },
        }
    }

    pub fn with_config(mut self, config: BacktestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kind(&self) -> StrategyKind {
        self.kind
    }

    pub fn series(&self) -> &Arc<BarSeries> {
        &self.series
    }

    /// Full backtest; `params` overlay the base parameters
    pub fn run(&self, params: &ParamMap) -> EngineResult<BacktestResult> {
        let mut merged = self.base_params.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), *v)));

        let mut strategy = GenericStrategy::new(self.kind, merged)?;
        let engine = BacktestEngine::with_series(Arc::clone(&self.series), self.config.clone());
        Ok(engine.run(&mut strategy))
    }
}

impl Objective for FitnessEvaluator {
    fn evaluate(&self, params: &ParamMap) -> EngineResult<Evaluation> {
        Ok(Evaluation::from_result(&self.run(params)?))
    }
}
