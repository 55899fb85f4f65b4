//! Exhaustive grid search
//!
//! Every combination of every parameter's stepped range
//! (see [`super::ParamConfig::grid_values`]) is evaluated once.

use std::sync::Arc;

use persistence::ParamMap;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::fitness::Objective;
use super::{best_of, Individual, OptimizeProgress, ParamSpace};
use crate::error::{EngineError, EngineResult};

pub const DEFAULT_MAX_POINTS: u64 = 100_000;

/// Points evaluated between progress updates and cancellation checks
const CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSearchResult {
    pub best_params: ParamMap,
    pub best_fitness: f64,
    pub best_return: f64,
    /// Every evaluated point, in enumeration order
    pub results: Vec<Individual>,
    pub total_points: u64,
}

impl GridSearchResult {
    /// The `n` best points, best first (ties keep enumeration order)
    pub fn top(&self, n: usize) -> Vec<&Individual> {
        let mut sorted: Vec<&Individual> = self.results.iter().collect();
        sorted.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
        sorted.truncate(n);
        sorted
    }
}

pub struct GridSearchOptimizer {
    space: ParamSpace,
    max_points: u64,
    workers: Option<usize>,
    progress: Option<Arc<OptimizeProgress>>,
}

impl GridSearchOptimizer {
    pub fn new(space: ParamSpace) -> Self {
        Self {
            space,
            max_points: DEFAULT_MAX_POINTS,
            workers: None,
            progress: None,
        }
    }

    pub fn with_max_points(mut self, max_points: u64) -> Self {
        self.max_points = max_points;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_progress(mut self, progress: Arc<OptimizeProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Number of grid points, without enumerating them
    pub fn point_count(&self) -> u128 {
        self.space
            .iter()
            .map(|(_, config)| config.grid_values().len() as u128)
            .product()
    }

    /// Cartesian product in name order; the last name varies fastest
    pub fn grid_points(&self) -> EngineResult<Vec<ParamMap>> {
        self.space.validate()?;
        let points = self.point_count();
        if points > self.max_points as u128 {
            return Err(EngineError::GridTooLarge {
                points,
                limit: self.max_points,
            });
        }

        let axes: Vec<(&str, Vec<f64>)> = self
            .space
            .iter()
            .map(|(name, config)| (name, config.grid_values()))
            .collect();

        let mut digits = vec![0usize; axes.len()];
        let mut grid = Vec::with_capacity(points as usize);
        loop {
            grid.push(
                axes.iter()
                    .zip(&digits)
                    .map(|((name, values), &d)| (name.to_string(), values[d]))
                    .collect(),
            );

            // Odometer increment from the last axis
            let mut axis = axes.len();
            loop {
                if axis == 0 {
                    return Ok(grid);
                }
                axis -= 1;
                digits[axis] += 1;
                if digits[axis] < axes[axis].1.len() {
                    break;
                }
                digits[axis] = 0;
            }
        }
    }

    pub fn optimize(&self, objective: &dyn Objective) -> EngineResult<GridSearchResult> {
        let grid = self.grid_points()?;
        let total = grid.len();
        let workers = self.workers.unwrap_or_else(rayon::current_num_threads).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| EngineError::ThreadPool(e.to_string()))?;

        info!(points = total, dimensions = self.space.len(), workers, "Starting grid search");
        if let Some(progress) = &self.progress {
            progress.set_phase("grid", total as u32);
        }

        let mut results: Vec<Individual> = Vec::with_capacity(total);
        for chunk in grid.chunks(CHUNK_SIZE) {
            if self.progress.as_ref().is_some_and(|p| p.is_cancelled()) {
                warn!(evaluated = results.len(), "Grid search cancelled");
                break;
            }

            let scored = pool.install(|| {
                chunk
                    .par_iter()
                    .map(|params| {
                        let eval = objective.evaluate(params)?;
                        Ok(Individual {
                            params: params.clone(),
                            fitness: eval.fitness,
                            total_return: eval.total_return,
                        })
                    })
                    .collect::<EngineResult<Vec<_>>>()
            })?;
            results.extend(scored);

            if let Some(progress) = &self.progress {
                progress.add_evaluations(chunk.len() as u64);
                progress.set_step(results.len() as u32);
                if let Some(best) = best_of(&results) {
                    progress.record_fitness(best.fitness);
                }
            }
        }

        let best = best_of(&results)
            .cloned()
            .ok_or(EngineError::Cancelled)?;

        info!(
            best_fitness = best.fitness,
            best_return = best.total_return,
            evaluated = results.len(),
            "Grid search complete"
        );

        Ok(GridSearchResult {
            best_params: best.params,
            best_fitness: best.fitness,
            best_return: best.total_return,
            total_points: total as u64,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::fitness::Evaluation;
    use crate::optimizer::ParamConfig;

    fn space() -> ParamSpace {
        ParamSpace::new()
            .with("fast", ParamConfig::new(5.0, 15.0, 5.0))
            .with("stop", ParamConfig::new(0.02, 0.06, 0.02))
    }

    #[test]
    fn test_enumerates_cartesian_product() {
        let grid = GridSearchOptimizer::new(space()).grid_points().unwrap();
        assert_eq!(grid.len(), 9);
        assert_eq!(grid[0]["fast"], 5.0);
        assert_eq!(grid[0]["stop"], 0.02);
        assert_eq!(grid[1]["stop"], 0.04);
        assert_eq!(grid[8]["fast"], 15.0);
        assert_eq!(grid[8]["stop"], 0.06);
    }

    #[test]
    fn test_finds_best_point_first_on_ties() {
        let objective = |p: &ParamMap| -> EngineResult<Evaluation> {
            // Two equal maxima; the first enumerated one must win
            let fitness = if p["fast"] == 10.0 { 1.0 } else { p["stop"] };
            Ok(Evaluation {
                fitness,
                total_return: fitness * 10.0,
                sharpe: 0.0,
                trades: 5,
            })
        };
        let result = GridSearchOptimizer::new(space())
            .with_workers(3)
            .optimize(&objective)
            .unwrap();

        assert_eq!(result.total_points, 9);
        assert_eq!(result.results.len(), 9);
        assert_eq!(result.best_params["fast"], 10.0);
        assert_eq!(result.best_params["stop"], 0.02);
        assert_eq!(result.best_return, 10.0);
        assert_eq!(result.top(2)[1].params["stop"], 0.04);
    }

    #[test]
    fn test_rejects_oversized_grid() {
        let space = ParamSpace::new()
            .with("a", ParamConfig::new(0.0, 1.0, 0.001))
            .with("b", ParamConfig::new(0.0, 1.0, 0.001));
        let err = GridSearchOptimizer::new(space).grid_points().unwrap_err();
        assert!(matches!(err, EngineError::GridTooLarge { points: 1_002_001, .. }));
    }
}
