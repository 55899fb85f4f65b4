//! Parameter optimization for the generic strategies
//!
//! - [`differential_evolution`]: 3-phase hybrid (random search → short
//!   evolution → full DE), the default search
//! - [`grid`]: exhaustive search over stepped ranges
//! - [`fitness`]: turns one backtest into a scalar score
//! - [`driver`]: train/test split, attempts, final metrics
//!
//! Shared here: the parameter space, individuals, results and the progress
//! tracker polled by the CLI.

pub mod differential_evolution;
pub mod driver;
pub mod fitness;
pub mod grid;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use persistence::{HistoryPoint, ParamMap};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

pub use differential_evolution::{DeConfig, DifferentialEvolutionOptimizer};
pub use driver::{
    evaluate_params, run_optimization, OptimizationReport, OptimizeRequest, SplitMetrics,
    ValidationMode,
};
pub use fitness::{fitness_score, Evaluation, FitnessEvaluator, Objective};
pub use grid::{GridSearchOptimizer, GridSearchResult};

const TOLERANCE: f64 = 1e-9;

// ============================================================================
// Parameter space
// ============================================================================

/// Bounds and step of one parameter dimension.
///
/// `step_size >= 1` marks an integer (or 0/1 boolean) dimension: every value
/// the optimizer produces is an exact multiple of the step inside
/// `[min, max]`. Smaller steps are continuous and only used by grid search.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamConfig {
    pub min: f64,
    pub max: f64,
    pub step_size: f64,
}

impl ParamConfig {
    pub const fn new(min: f64, max: f64, step_size: f64) -> Self {
        Self {
            min,
            max,
            step_size,
        }
    }

    pub fn is_quantized(&self) -> bool {
        self.step_size >= 1.0
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn first_multiple(&self) -> f64 {
        (self.min / self.step_size).ceil() * self.step_size
    }

    fn last_multiple(&self) -> f64 {
        (self.max / self.step_size).floor() * self.step_size
    }

    pub fn validate(&self, name: &str) -> EngineResult<()> {
        let invalid = |reason: String| EngineError::InvalidParamSpace(format!("{name}: {reason}"));

        if !(self.min.is_finite() && self.max.is_finite() && self.step_size.is_finite()) {
            return Err(invalid("bounds and step must be finite".to_string()));
        }
        if self.min > self.max {
            return Err(invalid(format!("min {} exceeds max {}", self.min, self.max)));
        }
        if self.step_size <= 0.0 {
            return Err(invalid(format!("step {} must be positive", self.step_size)));
        }
        if self.is_quantized() && self.first_multiple() > self.max + TOLERANCE {
            return Err(invalid(format!(
                "no multiple of {} inside [{}, {}]",
                self.step_size, self.min, self.max
            )));
        }
        Ok(())
    }

    /// Snap to the nearest multiple of the step, kept inside the bounds.
    /// Continuous dimensions pass through.
    pub fn quantize(&self, value: f64) -> f64 {
        if !self.is_quantized() {
            return value;
        }
        let snapped = (value / self.step_size).round() * self.step_size;
        snapped.min(self.last_multiple()).max(self.first_multiple())
    }

    /// Uniform draw in `[min, max]`, quantized
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.quantize(self.sample_raw(rng))
    }

    pub(crate) fn sample_raw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.max > self.min {
            rng.gen_range(self.min..=self.max)
        } else {
            self.min
        }
    }

    /// Stepped values `min, min+step, … <= max`, rounded to 3 decimals.
    /// Never empty: a range too narrow for one step yields `[min]`.
    pub fn grid_values(&self) -> Vec<f64> {
        let steps = ((self.max - self.min) / self.step_size + TOLERANCE).floor();
        let count = if steps.is_finite() && steps >= 0.0 {
            steps as usize + 1
        } else {
            1
        };
        (0..count)
            .map(|i| round3(self.min + i as f64 * self.step_size))
            .collect()
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Named dimensions, iterated in name order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSpace {
    params: BTreeMap<String, ParamConfig>,
}

impl ParamSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, config: ParamConfig) -> Self {
        self.params.insert(name.to_string(), config);
        self
    }

    pub fn insert(&mut self, name: &str, config: ParamConfig) {
        self.params.insert(name.to_string(), config);
    }

    pub fn get(&self, name: &str) -> Option<&ParamConfig> {
        self.params.get(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamConfig)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.params.is_empty() {
            return Err(EngineError::InvalidParamSpace(
                "at least one parameter is required".to_string(),
            ));
        }
        for (name, config) in &self.params {
            config.validate(name)?;
        }
        Ok(())
    }

    /// One uniform random vector, quantized
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamMap {
        self.params
            .iter()
            .map(|(name, config)| (name.clone(), config.sample(rng)))
            .collect()
    }

    /// Whether every dimension of `params` is inside its bounds (and on its
    /// step, for quantized dimensions)
    pub fn contains(&self, params: &ParamMap) -> bool {
        self.params.iter().all(|(name, config)| {
            params.get(name).is_some_and(|&v| {
                config.contains(v) && (!config.is_quantized() || config.quantize(v) == v)
            })
        })
    }
}

// ============================================================================
// Individuals and results
// ============================================================================

/// An evaluated parameter vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub params: ParamMap,
    pub fitness: f64,
    /// Dollar P&L
    #[serde(rename = "return")]
    pub total_return: f64,
}

impl Individual {
    pub fn to_history(&self, phase: &str, generation: usize) -> HistoryPoint {
        HistoryPoint {
            phase: phase.to_string(),
            generation,
            params: self.params.clone(),
            fitness: self.fitness,
            total_return: self.total_return,
        }
    }
}

/// Best of a slice; on equal fitness the earliest wins
pub(crate) fn best_of(individuals: &[Individual]) -> Option<&Individual> {
    individuals.iter().fold(None, |best: Option<&Individual>, ind| match best {
        Some(b) if b.fitness >= ind.fitness => Some(b),
        _ => Some(ind),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub final_params: ParamMap,
    pub best_fitness: f64,
    pub best_return: f64,
    pub history: Vec<HistoryPoint>,
    /// Refinement generations actually run
    pub iterations: usize,
    pub converged: bool,
    pub evaluations: u64,
}

// ============================================================================
// Progress tracking
// ============================================================================

/// Optimization run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStatus {
    Idle,
    Running,
    Complete,
    Cancelled,
    Error,
}

/// Shared progress tracker between the optimizer threads and whoever polls it
pub struct OptimizeProgress {
    pub status: RwLock<OptimizeStatus>,
    pub strategy: RwLock<Option<String>>,
    pub phase: RwLock<String>,
    pub error_message: RwLock<Option<String>>,
    pub attempt: AtomicU32,
    pub total_attempts: AtomicU32,
    pub step: AtomicU32,
    pub total_steps: AtomicU32,
    pub evaluations: AtomicU64,
    pub cancelled: AtomicBool,
    best_fitness_bits: AtomicU64,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl OptimizeProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(OptimizeStatus::Idle),
            strategy: RwLock::new(None),
            phase: RwLock::new(String::new()),
            error_message: RwLock::new(None),
            attempt: AtomicU32::new(0),
            total_attempts: AtomicU32::new(0),
            step: AtomicU32::new(0),
            total_steps: AtomicU32::new(0),
            evaluations: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            best_fitness_bits: AtomicU64::new(f64::NEG_INFINITY.to_bits()),
        }
    }

    /// Reset for a new optimization run
    pub fn reset(&self, strategy: &str, total_attempts: u32) {
        *write_lock(&self.status) = OptimizeStatus::Running;
        *write_lock(&self.strategy) = Some(strategy.to_string());
        write_lock(&self.phase).clear();
        *write_lock(&self.error_message) = None;
        self.attempt.store(0, Ordering::Relaxed);
        self.total_attempts.store(total_attempts, Ordering::Relaxed);
        self.step.store(0, Ordering::Relaxed);
        self.total_steps.store(0, Ordering::Relaxed);
        self.evaluations.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        self.best_fitness_bits
            .store(f64::NEG_INFINITY.to_bits(), Ordering::Relaxed);
    }

    pub fn start_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::Relaxed);
        self.step.store(0, Ordering::Relaxed);
    }

    pub fn set_phase(&self, phase: &str, total_steps: u32) {
        *write_lock(&self.phase) = phase.to_string();
        self.step.store(0, Ordering::Relaxed);
        self.total_steps.store(total_steps, Ordering::Relaxed);
    }

    pub fn set_step(&self, step: u32) {
        self.step.store(step, Ordering::Relaxed);
    }

    pub fn phase(&self) -> String {
        read_lock(&self.phase).clone()
    }

    pub fn add_evaluations(&self, count: u64) {
        self.evaluations.fetch_add(count, Ordering::Relaxed);
    }

    /// Keep the highest fitness seen so far
    pub fn record_fitness(&self, fitness: f64) {
        if !fitness.is_finite() {
            return;
        }
        let _ = self
            .best_fitness_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                (fitness > f64::from_bits(bits)).then(|| fitness.to_bits())
            });
    }

    pub fn best_fitness(&self) -> Option<f64> {
        let best = f64::from_bits(self.best_fitness_bits.load(Ordering::Relaxed));
        best.is_finite().then_some(best)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn finish(&self, status: OptimizeStatus) {
        *write_lock(&self.status) = status;
    }

    pub fn fail(&self, message: String) {
        *write_lock(&self.error_message) = Some(message);
        *write_lock(&self.status) = OptimizeStatus::Error;
    }

    pub fn status(&self) -> OptimizeStatus {
        *read_lock(&self.status)
    }

    pub fn error_message(&self) -> Option<String> {
        read_lock(&self.error_message).clone()
    }

    /// Progress within the current attempt, as percentage
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_steps.load(Ordering::Relaxed);
        let done = self.step.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done.min(total) as f32 / total as f32) * 100.0
        }
    }

    /// Check if currently running
    pub fn is_running(&self) -> bool {
        matches!(self.status(), OptimizeStatus::Running)
    }
}

impl Default for OptimizeProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_quantize_stays_on_step_and_in_bounds() {
        let config = ParamConfig::new(5.0, 30.0, 5.0);
        assert_eq!(config.quantize(12.4), 10.0);
        assert_eq!(config.quantize(12.6), 15.0);
        assert_eq!(config.quantize(29.9), 30.0);
        assert_eq!(config.quantize(4.0), 5.0);

        // Bounds that are not multiples of the step
        let odd = ParamConfig::new(3.0, 9.0, 4.0);
        assert_eq!(odd.quantize(3.1), 4.0);
        assert_eq!(odd.quantize(8.9), 8.0);

        // Continuous dimensions pass through
        assert_eq!(ParamConfig::new(0.0, 1.0, 0.05).quantize(0.1234), 0.1234);
    }

    #[test]
    fn test_validation() {
        assert!(ParamConfig::new(1.0, 3.0, 1.0).validate("a").is_ok());
        assert!(ParamConfig::new(2.0, 2.0, 1.0).validate("a").is_ok());
        assert!(ParamConfig::new(3.0, 1.0, 1.0).validate("a").is_err());
        assert!(ParamConfig::new(1.0, 3.0, 0.0).validate("a").is_err());
        assert!(ParamConfig::new(5.0, 7.0, 4.0).validate("a").is_err());
        assert!(ParamConfig::new(0.0, f64::NAN, 1.0).validate("a").is_err());
        assert!(ParamSpace::new().validate().is_err());
    }

    #[test]
    fn test_samples_respect_space() {
        let space = ParamSpace::new()
            .with("period", ParamConfig::new(3.0, 21.0, 2.0))
            .with("risk", ParamConfig::new(0.05, 0.3, 0.05))
            .with("flag", ParamConfig::new(0.0, 1.0, 1.0));
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let params = space.sample(&mut rng);
            assert_eq!(params.len(), 3);
            assert!(space.contains(&params), "{params:?}");
            assert_eq!(params["period"] % 2.0, 0.0);
            assert!(params["flag"] == 0.0 || params["flag"] == 1.0);
        }
    }

    #[test]
    fn test_grid_values() {
        assert_eq!(
            ParamConfig::new(0.02, 0.1, 0.02).grid_values(),
            vec![0.02, 0.04, 0.06, 0.08, 0.1]
        );
        assert_eq!(ParamConfig::new(0.0, 0.0, 1.0).grid_values(), vec![0.0]);
        assert_eq!(ParamConfig::new(5.0, 30.0, 5.0).grid_values().len(), 6);
        assert_eq!(ParamConfig::new(1.5, 3.0, 0.5).grid_values(), vec![1.5, 2.0, 2.5, 3.0]);
    }

    #[test]
    fn test_best_of_prefers_first_on_ties() {
        let ind = |f: f64, tag: f64| Individual {
            params: [("x".to_string(), tag)].into_iter().collect(),
            fitness: f,
            total_return: 0.0,
        };
        let pop = vec![ind(0.1, 1.0), ind(0.5, 2.0), ind(0.5, 3.0)];
        assert_eq!(best_of(&pop).unwrap().params["x"], 2.0);
        assert!(best_of(&[]).is_none());
    }

    #[test]
    fn test_progress_tracking() {
        let progress = OptimizeProgress::new();
        assert!(!progress.is_running());
        assert_eq!(progress.best_fitness(), None);

        progress.reset("rsi", 3);
        assert!(progress.is_running());
        progress.set_phase("refine", 4);
        progress.set_step(1);
        assert_eq!(progress.progress_pct(), 25.0);

        progress.record_fitness(0.2);
        progress.record_fitness(0.1);
        progress.record_fitness(f64::NAN);
        assert_eq!(progress.best_fitness(), Some(0.2));

        progress.fail("boom".to_string());
        assert_eq!(progress.status(), OptimizeStatus::Error);
        assert_eq!(progress.error_message().as_deref(), Some("boom"));
    }
}
