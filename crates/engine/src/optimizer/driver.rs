//! Optimization driver
//!
//! Limits and splits the dataset, runs several independent DE attempts on the
//! train side, keeps the attempt with the best held-out return and scores the
//! winner on train, test and the full dataset.

use std::sync::Arc;

use chrono::Utc;
use persistence::repository::{compute_params_hash, OptimizationRunRecord};
use persistence::{FinalMetrics, ParamMap, ParamMetadata, RunHistory};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::differential_evolution::{DeConfig, DifferentialEvolutionOptimizer};
use super::fitness::FitnessEvaluator;
use super::{OptimizationResult, OptimizeProgress, OptimizeStatus, ParamSpace};
use crate::dataset::{limit_tokens, split_train_test, token_batches, token_folds};
use crate::engine::{BacktestEngine, BarSeries};
use crate::error::{EngineError, EngineResult};
use crate::fees::FeeModel;
use crate::strategy::{GenericStrategy, StrategyKind};
use crate::types::{BacktestConfig, Dataset};

/// Tokens with fewer points are left out of train and test
pub const MIN_TOKEN_POINTS: usize = 10;
/// Tokens per batch inside each cross-validation fold
const FOLD_BATCH_SIZE: usize = 50;

// ============================================================================
// Request
// ============================================================================

/// How a parameter vector is scored on held-out data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ValidationMode {
    /// One backtest over all tokens
    Holdout,
    /// Backtests over fixed-size token batches, returns summed
    Batched { batch_size: usize },
    /// k folds over shuffled tokens, validation returns averaged
    CrossValidated { folds: usize },
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationMode::Holdout => write!(f, "holdout"),
            ValidationMode::Batched { batch_size } => write!(f, "batched({batch_size})"),
            ValidationMode::CrossValidated { folds } => write!(f, "cv({folds})"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeRequest {
    pub strategy: StrategyKind,
    /// Refinement generations per attempt
    pub max_iterations: usize,
    pub random_samples: usize,
    pub attempts: u32,
    /// Stop early once an attempt's test return (dollars) reaches this
    pub min_test_return: f64,
    pub max_tokens: Option<usize>,
    pub train_ratio: f64,
    pub validation: ValidationMode,
    pub fee_rate: Decimal,
    pub initial_capital: Decimal,
    pub seed: Option<u64>,
    pub workers: Option<usize>,
    /// Overrides the strategy's default space
    pub space: Option<ParamSpace>,
}

impl OptimizeRequest {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            max_iterations: 30,
            random_samples: 50,
            attempts: 5,
            min_test_return: 10.0,
            max_tokens: Some(500),
            train_ratio: 0.7,
            validation: ValidationMode::Holdout,
            fee_rate: dec!(0.002),
            initial_capital: dec!(1000),
            seed: None,
            workers: None,
            space: None,
        }
    }

    pub fn param_space(&self) -> ParamSpace {
        self.space
            .clone()
            .unwrap_or_else(|| self.strategy.param_space())
    }

    pub fn backtest_config(&self) -> BacktestConfig {
        BacktestConfig {
            initial_capital: self.initial_capital,
            fee_model: FeeModel::flat(self.fee_rate),
        }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.attempts == 0 {
            return Err(EngineError::Optimization("attempts must be at least 1".to_string()));
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(EngineError::Optimization(format!(
                "train ratio {} must be inside (0, 1)",
                self.train_ratio
            )));
        }
        match self.validation {
            ValidationMode::Batched { batch_size: 0 } => Err(EngineError::Optimization(
                "batch size must be at least 1".to_string(),
            )),
            ValidationMode::CrossValidated { folds } if folds < 2 => Err(EngineError::Optimization(
                "cross-validation needs at least 2 folds".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// Held-out evaluation
// ============================================================================

/// Score of one parameter vector on one data split
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitMetrics {
    /// Profit in dollars
    pub total_return: f64,
    pub sharpe: f64,
    pub trades: u32,
    /// Population std-dev of per-batch / per-fold returns, 0 for holdout
    pub std_dev: f64,
}

fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

fn backtest(
    kind: StrategyKind,
    params: &ParamMap,
    dataset: &Dataset,
    config: &BacktestConfig,
) -> EngineResult<(f64, f64, u32)> {
    let mut strategy = GenericStrategy::new(kind, params.clone())?;
    let engine = BacktestEngine::with_series(Arc::new(BarSeries::build(dataset)), config.clone());
    let result = engine.run(&mut strategy);
    Ok((
        result.total_return.to_f64().unwrap_or(0.0),
        result.sharpe_ratio,
        result.total_trades,
    ))
}

fn evaluate_batched(
    kind: StrategyKind,
    params: &ParamMap,
    dataset: &Dataset,
    config: &BacktestConfig,
    batch_size: usize,
) -> EngineResult<SplitMetrics> {
    let ids: Vec<String> = dataset.token_ids().map(str::to_string).collect();
    let mut returns = Vec::new();
    let mut trades = 0u32;
    for batch in token_batches(&ids, batch_size) {
        let part = dataset.subset(batch.iter().map(String::as_str));
        let (ret, _, n) = backtest(kind, params, &part, config)?;
        returns.push(ret);
        trades += n;
    }
    Ok(SplitMetrics {
        total_return: returns.iter().sum(),
        sharpe: 0.0,
        trades,
        std_dev: population_std(&returns),
    })
}

/// Score fully resolved `params` on `dataset` under the given validation mode
pub fn evaluate_params(
    kind: StrategyKind,
    params: &ParamMap,
    dataset: &Dataset,
    config: &BacktestConfig,
    mode: ValidationMode,
) -> EngineResult<SplitMetrics> {
    match mode {
        ValidationMode::Holdout => {
            let (total_return, sharpe, trades) = backtest(kind, params, dataset, config)?;
            Ok(SplitMetrics {
                total_return,
                sharpe,
                trades,
                std_dev: 0.0,
            })
        }
        ValidationMode::Batched { batch_size } => {
            evaluate_batched(kind, params, dataset, config, batch_size)
        }
        ValidationMode::CrossValidated { folds } => {
            let ids: Vec<String> = dataset.token_ids().map(str::to_string).collect();
            let mut fold_returns = Vec::with_capacity(folds);
            let mut trades = 0u32;
            for fold in token_folds(&ids, folds)? {
                let validation = dataset.subset(fold.validation.iter().map(String::as_str));
                let metrics = evaluate_batched(kind, params, &validation, config, FOLD_BATCH_SIZE)?;
                fold_returns.push(metrics.total_return);
                trades += metrics.trades;
            }
            Ok(SplitMetrics {
                total_return: fold_returns.iter().sum::<f64>() / folds as f64,
                sharpe: 0.0,
                trades: trades / folds as u32,
                std_dev: population_std(&fold_returns),
            })
        }
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub strategy: StrategyKind,
    /// Optimized dimensions only, as saved to the parameter store
    pub best_params: ParamMap,
    /// Base parameters overlaid with `best_params`
    pub resolved_params: ParamMap,
    pub result: OptimizationResult,
    pub attempts_run: u32,
    pub train: SplitMetrics,
    pub test: SplitMetrics,
    pub full: SplitMetrics,
    pub validation: ValidationMode,
    pub train_tokens: usize,
    pub test_tokens: usize,
    pub optimized_at: String,
}

impl OptimizationReport {
    pub fn metadata(&self) -> ParamMetadata {
        ParamMetadata {
            best_test_return: self.test.total_return,
            optimized_at: self.optimized_at.clone(),
        }
    }

    pub fn final_metrics(&self) -> FinalMetrics {
        FinalMetrics {
            train_return: self.train.total_return,
            train_std_dev: self.train.std_dev,
            test_return: self.test.total_return,
            test_std_dev: self.test.std_dev,
            test_sharpe: self.test.sharpe,
            test_trades: self.test.trades,
            full_return: self.full.total_return,
            full_std_dev: self.full.std_dev,
            full_sharpe: self.full.sharpe,
        }
    }

    pub fn run_history(&self) -> RunHistory {
        RunHistory {
            strategy: self.strategy.name().to_string(),
            best_params: self.best_params.clone(),
            history: self.result.history.clone(),
            final_metrics: self.final_metrics(),
        }
    }

    /// Row for the run log; `dataset` labels where the data came from
    pub fn run_record(&self, dataset: Option<String>) -> OptimizationRunRecord {
        let name = self.strategy.name();
        OptimizationRunRecord {
            id: None,
            params_hash: compute_params_hash(name, &self.best_params),
            strategy: name.to_string(),
            params_json: serde_json::to_string(&self.best_params).unwrap_or_default(),
            validation: self.validation.to_string(),
            attempts: self.attempts_run as i64,
            best_fitness: self.result.best_fitness,
            train_return: self.train.total_return,
            test_return: self.test.total_return,
            test_std_dev: self.test.std_dev,
            test_sharpe: self.test.sharpe,
            test_trades: self.test.trades as i64,
            full_return: self.full.total_return,
            iterations: self.result.iterations as i64,
            converged: self.result.converged,
            dataset,
            created_at: None,
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Run the full optimization. `base_params` are the strategy's resolved
/// parameters; optimized dimensions are overlaid on them.
pub fn run_optimization(
    request: &OptimizeRequest,
    dataset: &Dataset,
    base_params: ParamMap,
    progress: Arc<OptimizeProgress>,
) -> EngineResult<OptimizationReport> {
    progress.reset(request.strategy.name(), request.attempts);

    match optimize_attempts(request, dataset, base_params, &progress) {
        Ok(report) => {
            let status = if progress.is_cancelled() {
                OptimizeStatus::Cancelled
            } else {
                OptimizeStatus::Complete
            };
            progress.finish(status);
            Ok(report)
        }
        Err(EngineError::Cancelled) => {
            progress.finish(OptimizeStatus::Cancelled);
            Err(EngineError::Cancelled)
        }
        Err(e) => {
            progress.fail(e.to_string());
            Err(e)
        }
    }
}

fn optimize_attempts(
    request: &OptimizeRequest,
    dataset: &Dataset,
    base_params: ParamMap,
    progress: &Arc<OptimizeProgress>,
) -> EngineResult<OptimizationReport> {
    request.validate()?;
    let kind = request.strategy;
    let space = request.param_space();
    space.validate()?;
    let config = request.backtest_config();

    let limited = match request.max_tokens {
        Some(max) => limit_tokens(dataset, max),
        None => dataset.clone(),
    };
    let (train, test) = split_train_test(&limited, request.train_ratio, MIN_TOKEN_POINTS);
    if train.token_count() == 0 || test.token_count() == 0 {
        return Err(EngineError::Dataset(format!(
            "no token has at least {MIN_TOKEN_POINTS} price points"
        )));
    }

    info!(
        strategy = %kind,
        tokens = limited.token_count(),
        train_points = train.point_count(),
        test_points = test.point_count(),
        attempts = request.attempts,
        max_iterations = request.max_iterations,
        validation = %request.validation,
        "Starting optimization"
    );

    let evaluator = FitnessEvaluator::new(kind, base_params.clone(), Arc::new(BarSeries::build(&train)))
        .with_config(config.clone());
    let resolve = |params: &ParamMap| {
        let mut merged = base_params.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), *v)));
        merged
    };

    let mut best: Option<(OptimizationResult, SplitMetrics)> = None;
    let mut attempts_run = 0;

    for attempt in 1..=request.attempts {
        if progress.is_cancelled() {
            break;
        }
        progress.start_attempt(attempt);
        attempts_run = attempt;

        let de_config = DeConfig {
            max_iterations: request.max_iterations,
            random_samples: request.random_samples,
            seed: request.seed.map(|s| s.wrapping_add(attempt as u64 - 1)),
            workers: request.workers,
            ..Default::default()
        };
        let mut optimizer =
            DifferentialEvolutionOptimizer::new(space.clone(), de_config).with_progress(Arc::clone(progress));
        if let Some((previous, _)) = &best {
            optimizer = optimizer.with_initial(previous.final_params.clone());
        }

        let result = optimizer.optimize(&evaluator)?;
        if result.final_params.is_empty() {
            break;
        }
        let test_metrics = evaluate_params(kind, &resolve(&result.final_params), &test, &config, request.validation)?;

        info!(
            attempt,
            train_fitness = result.best_fitness,
            train_return = result.best_return,
            test_return = test_metrics.total_return,
            test_trades = test_metrics.trades,
            "Attempt complete"
        );

        let improved = best
            .as_ref()
            .map_or(true, |(_, m)| test_metrics.total_return > m.total_return);
        if improved {
            info!(attempt, test_return = test_metrics.total_return, "New best");
            let reached = test_metrics.total_return >= request.min_test_return;
            best = Some((result, test_metrics));
            if reached {
                info!(min_test_return = request.min_test_return, "Reached target test return");
                break;
            }
        }
    }

    let Some((result, _)) = best else {
        if progress.is_cancelled() {
            warn!("Optimization cancelled before any attempt finished");
            return Err(EngineError::Cancelled);
        }
        return Err(EngineError::Optimization("no attempt produced parameters".to_string()));
    };

    let resolved = resolve(&result.final_params);
    let train_metrics = evaluate_params(kind, &resolved, &train, &config, request.validation)?;
    let test_metrics = evaluate_params(kind, &resolved, &test, &config, request.validation)?;
    let full_metrics = evaluate_params(kind, &resolved, dataset, &config, request.validation)?;

    info!(
        strategy = %kind,
        train_return = train_metrics.total_return,
        test_return = test_metrics.total_return,
        full_return = full_metrics.total_return,
        test_trades = test_metrics.trades,
        converged = result.converged,
        "Optimization complete"
    );

    Ok(OptimizationReport {
        strategy: kind,
        best_params: result.final_params.clone(),
        resolved_params: resolved,
        result,
        attempts_run,
        train: train_metrics,
        test: test_metrics,
        full: full_metrics,
        validation: request.validation,
        train_tokens: train.token_count(),
        test_tokens: test.token_count(),
        optimized_at: Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PricePoint;
    use rust_decimal::prelude::FromPrimitive;

    /// Oscillating tokens so channel breakouts fire in both halves
    fn dataset(tokens: usize) -> Dataset {
        let mut dataset = Dataset::default();
        for t in 0..tokens {
            let points = (0..60)
                .map(|i| {
                    let wave = ((i + t * 3) as f64 * 0.7).sin() * 0.15;
                    let price = Decimal::from_f64(0.5 + wave).unwrap().round_dp(4);
                    PricePoint::new(i as i64 * 60, price)
                })
                .collect();
            dataset.price_history.insert(format!("token-{t}"), points);
        }
        dataset
    }

    fn request() -> OptimizeRequest {
        OptimizeRequest {
            max_iterations: 5,
            random_samples: 12,
            attempts: 2,
            min_test_return: f64::INFINITY,
            seed: Some(42),
            workers: Some(2),
            ..OptimizeRequest::new(StrategyKind::ChannelBreakout)
        }
    }

    #[test]
    fn test_population_std() {
        assert_eq!(population_std(&[5.0]), 0.0);
        assert!((population_std(&[1.0, 3.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_validation_modes_agree_on_totals() {
        let data = dataset(6);
        let kind = StrategyKind::ChannelBreakout;
        let mut params = kind.default_params();
        params.insert("channel_period".to_string(), 5.0);
        let config = BacktestConfig::with_fee_rate(dec!(0.002));

        let holdout = evaluate_params(kind, &params, &data, &config, ValidationMode::Holdout).unwrap();
        assert!(holdout.trades > 0);
        assert_eq!(holdout.std_dev, 0.0);

        // Batch size 1 backtests every token alone
        let batched =
            evaluate_params(kind, &params, &data, &config, ValidationMode::Batched { batch_size: 1 }).unwrap();
        let single: f64 = data
            .token_ids()
            .map(|id| {
                let part = data.subset([id]);
                evaluate_params(kind, &params, &part, &config, ValidationMode::Holdout)
                    .unwrap()
                    .total_return
            })
            .sum();
        assert!((batched.total_return - single).abs() < 1e-9);
        assert_eq!(batched.sharpe, 0.0);

        let cv = evaluate_params(kind, &params, &data, &config, ValidationMode::CrossValidated { folds: 3 })
            .unwrap();
        // Every token lands in exactly one validation fold
        let fold_sum: f64 = token_folds(&data.token_ids().map(str::to_string).collect::<Vec<_>>(), 3)
            .unwrap()
            .iter()
            .map(|fold| {
                let part = data.subset(fold.validation.iter().map(String::as_str));
                evaluate_params(kind, &params, &part, &config, ValidationMode::Holdout)
                    .unwrap()
                    .total_return
            })
            .sum();
        assert!(cv.trades > 0);
        assert!((cv.total_return - fold_sum / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_run_optimization_produces_report() {
        let data = dataset(4);
        let progress = Arc::new(OptimizeProgress::new());
        let kind = StrategyKind::ChannelBreakout;
        let report = run_optimization(&request(), &data, kind.default_params(), Arc::clone(&progress)).unwrap();

        assert_eq!(progress.status(), OptimizeStatus::Complete);
        assert_eq!(report.attempts_run, 2);
        assert!(kind.param_space().contains(&report.best_params));
        assert_eq!(report.train_tokens, 4);
        assert_eq!(report.resolved_params.len(), kind.default_params().len());

        let history = report.run_history();
        assert_eq!(history.strategy, "channel_breakout");
        assert_eq!(history.final_metrics.test_return, report.test.total_return);
        assert!(!history.history.is_empty());

        let record = report.run_record(Some("synthetic".to_string()));
        assert_eq!(record.attempts, 2);
        assert_eq!(record.validation, "holdout");
        assert_eq!(report.metadata().best_test_return, report.test.total_return);
    }

    #[test]
    fn test_early_stop_on_target_return() {
        let data = dataset(4);
        let progress = Arc::new(OptimizeProgress::new());
        let request = OptimizeRequest {
            min_test_return: f64::NEG_INFINITY,
            attempts: 5,
            ..request()
        };
        let report = run_optimization(
            &request,
            &data,
            StrategyKind::ChannelBreakout.default_params(),
            progress,
        )
        .unwrap();
        assert_eq!(report.attempts_run, 1);
    }

    #[test]
    fn test_too_little_data_fails() {
        let mut data = Dataset::default();
        data.price_history.insert(
            "tiny".to_string(),
            (0..5).map(|i| PricePoint::new(i, dec!(0.5))).collect(),
        );
        let progress = Arc::new(OptimizeProgress::new());
        let err = run_optimization(
            &request(),
            &data,
            StrategyKind::ChannelBreakout.default_params(),
            Arc::clone(&progress),
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::Dataset(_)));
        assert_eq!(progress.status(), OptimizeStatus::Error);
        assert!(progress.error_message().is_some());
    }

    #[test]
    fn test_invalid_request_is_rejected() {
        let bad = OptimizeRequest {
            validation: ValidationMode::CrossValidated { folds: 1 },
            ..request()
        };
        let progress = Arc::new(OptimizeProgress::new());
        assert!(run_optimization(&bad, &dataset(3), ParamMap::new(), progress).is_err());
    }
}
