//! Poly Optimize Engine: backtesting and parameter optimization
//!
//! Replays sparse prediction-market price histories through trading
//! strategies and searches their parameter spaces.
//! Provides:
//! - Event-driven backtest engine over a merged multi-token timeline
//! - Cash and position ledger with flat or Polymarket taker fees
//! - Generic indicator strategies (MA cross, RSI, stochastic, Bollinger, channel)
//! - 3-phase differential evolution and exhaustive grid search
//! - Optimization driver with per-token train/test split and validation modes

pub mod dataset;
pub mod engine;
pub mod error;
pub mod fees;
pub mod indicators;
pub mod optimizer;
pub mod portfolio;
pub mod strategy;
pub mod types;

// Re-exports for convenience
pub use dataset::{limit_tokens, load_dataset, seeded_shuffle, split_train_test};
pub use engine::{BacktestContext, BacktestEngine, BarSeries};
pub use error::{EngineError, EngineResult};
pub use fees::{calculate_taker_fee, FeeModel, PolymarketFeeConfig};
pub use indicators::{build_signal_generator, IndicatorConfig, Signal, SignalGenerator};
pub use optimizer::{
    run_optimization, DeConfig, DifferentialEvolutionOptimizer, FitnessEvaluator,
    GridSearchOptimizer, OptimizationReport, OptimizationResult, OptimizeProgress,
    OptimizeRequest, OptimizeStatus, ParamConfig, ParamSpace, ValidationMode,
};
pub use portfolio::Portfolio;
pub use strategy::{resolve_params, GenericStrategy, Strategy, StrategyKind};
pub use types::*;
