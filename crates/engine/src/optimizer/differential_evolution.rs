//! 3-phase differential evolution
//!
//! 1. **random**: `random_samples` uniform draws, the top 20% (at least 2)
//!    seed the population
//! 2. **explore**: seeds padded with fresh draws to `max(10, dim + 1)` (a
//!    larger seed set is kept whole), exactly 3 DE/rand/1/bin generations,
//!    best 2 become finalists
//! 3. **refine**: finalists plus fresh draws, up to `max_iterations`
//!    generations with convergence detection
//!
//! All random draws happen on the calling thread in a fixed order and
//! evaluations come back in input order, so a seeded run is reproducible
//! whatever the worker count. Every trial of a generation is built from the
//! frozen previous population before anything is evaluated or replaced.

use std::sync::Arc;

use persistence::{HistoryPoint, ParamMap};
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fitness::Objective;
use super::{best_of, Individual, OptimizationResult, OptimizeProgress, ParamSpace};
use crate::error::{EngineError, EngineResult};

const MIN_POPULATION: usize = 10;
const SEED_FRACTION: f64 = 0.2;
const MIN_SEEDS: usize = 2;
const EXPLORE_GENERATIONS: usize = 3;
const FINALISTS: usize = 2;
/// Generations that must pass before convergence is checked, and the
/// window of best-fitness values it looks at
const CONVERGENCE_WINDOW: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeConfig {
    /// Refinement generations
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub random_samples: usize,
    /// Differential weight F
    pub mutation_factor: f64,
    /// Binomial crossover probability CR
    pub crossover_rate: f64,
    pub seed: Option<u64>,
    /// Evaluation threads, defaults to the core count
    pub workers: Option<usize>,
}

impl Default for DeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_threshold: 1e-6,
            random_samples: 50,
            mutation_factor: 0.8,
            crossover_rate: 0.9,
            seed: None,
            workers: None,
        }
    }
}

pub struct DifferentialEvolutionOptimizer {
    space: ParamSpace,
    config: DeConfig,
    initial: Option<ParamMap>,
    progress: Option<Arc<OptimizeProgress>>,
}

/// Mutable state of one run
struct Run<'a> {
    objective: &'a dyn Objective,
    pool: ThreadPool,
    rng: StdRng,
    history: Vec<HistoryPoint>,
    evaluations: u64,
}

impl DifferentialEvolutionOptimizer {
    pub fn new(space: ParamSpace, config: DeConfig) -> Self {
        Self {
            space,
            config,
            initial: None,
            progress: None,
        }
    }

    /// Include a known vector (e.g. a previous attempt's best) in the random
    /// phase; it counts against `random_samples`
    pub fn with_initial(mut self, params: ParamMap) -> Self {
        self.initial = Some(params);
        self
    }

    pub fn with_progress(mut self, progress: Arc<OptimizeProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn space(&self) -> &ParamSpace {
        &self.space
    }

    pub fn config(&self) -> &DeConfig {
        &self.config
    }

    pub fn population_size(&self) -> usize {
        MIN_POPULATION.max(self.space.len() + 1)
    }

    fn validate(&self) -> EngineResult<()> {
        self.space.validate()?;
        let c = &self.config;
        if !(c.mutation_factor.is_finite() && c.mutation_factor > 0.0) {
            return Err(EngineError::Optimization(format!(
                "mutation factor {} must be positive",
                c.mutation_factor
            )));
        }
        if !(0.0..=1.0).contains(&c.crossover_rate) {
            return Err(EngineError::Optimization(format!(
                "crossover rate {} is outside [0, 1]",
                c.crossover_rate
            )));
        }
        if c.random_samples == 0 {
            return Err(EngineError::Optimization(
                "random_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn cancelled(&self) -> bool {
        self.progress.as_ref().is_some_and(|p| p.is_cancelled())
    }

    fn set_phase(&self, phase: &str, steps: usize) {
        if let Some(progress) = &self.progress {
            progress.set_phase(phase, steps as u32);
        }
    }

    fn set_step(&self, step: usize) {
        if let Some(progress) = &self.progress {
            progress.set_step(step as u32);
        }
    }

    pub fn optimize(&self, objective: &dyn Objective) -> EngineResult<OptimizationResult> {
        self.validate()?;

        let pop_size = self.population_size();
        let workers = self
            .config
            .workers
            .unwrap_or_else(rayon::current_num_threads)
            .clamp(1, pop_size.max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| EngineError::ThreadPool(e.to_string()))?;
        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut run = Run {
            objective,
            pool,
            rng,
            history: Vec::new(),
            evaluations: 0,
        };

        info!(
            dimensions = self.space.len(),
            population = pop_size,
            workers,
            random_samples = self.config.random_samples,
            max_iterations = self.config.max_iterations,
            "Starting differential evolution"
        );

        // ---- Phase 1: random search ----
        self.set_phase("random", 1);
        let mut samples: Vec<ParamMap> = Vec::with_capacity(self.config.random_samples);
        if let Some(initial) = &self.initial {
            samples.push(self.seed_vector(&mut run.rng, initial));
        }
        while samples.len() < self.config.random_samples {
            samples.push(self.space.sample(&mut run.rng));
        }
        let mut ranked = self.evaluate(&mut run, samples)?;
        ranked.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
        if let Some(best) = ranked.first() {
            run.history.push(best.to_history("random", 0));
            info!(best_fitness = best.fitness, best_return = best.total_return, "Random search done");
        }
        let seeds = ((ranked.len() as f64 * SEED_FRACTION).ceil() as usize)
            .max(MIN_SEEDS)
            .min(ranked.len());
        ranked.truncate(seeds);
        self.set_step(1);

        if self.cancelled() {
            return Ok(self.cancelled_result(run, ranked));
        }

        // ---- Phase 2: short exploration ----
        self.set_phase("explore", EXPLORE_GENERATIONS);
        // A seed set larger than the population is kept whole
        let explore_size = pop_size.max(ranked.len());
        let mut population = self.fill_population(&mut run, ranked, explore_size)?;
        for generation in 0..EXPLORE_GENERATIONS {
            if self.cancelled() {
                return Ok(self.cancelled_result(run, population));
            }
            let (next, _) = self.generation(&mut run, &population)?;
            population = next;
            if let Some(best) = best_of(&population) {
                run.history.push(best.to_history("explore", generation));
            }
            self.set_step(generation + 1);
        }

        population.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
        population.truncate(FINALISTS);
        if let Some(best) = population.first() {
            info!(best_fitness = best.fitness, best_return = best.total_return, "Exploration done");
        }

        // ---- Phase 3: refinement ----
        self.set_phase("refine", self.config.max_iterations);
        let mut population = self.fill_population(&mut run, population, pop_size)?;
        let mut window: Vec<f64> = Vec::new();
        let mut iterations = 0;
        let mut converged = false;

        for generation in 0..self.config.max_iterations {
            if self.cancelled() {
                warn!(generation, "Optimization cancelled");
                break;
            }

            let (next, improved) = self.generation(&mut run, &population)?;
            population = next;
            iterations += 1;
            self.set_step(generation + 1);

            if let Some(best) = best_of(&population) {
                run.history.push(best.to_history("refine", generation));
                window.push(best.fitness);
                if let Some(progress) = &self.progress {
                    progress.record_fitness(best.fitness);
                }
                debug!(generation, best_fitness = best.fitness, improved, "Generation complete");
            }

            if !improved && generation > CONVERGENCE_WINDOW {
                let recent = &window[window.len().saturating_sub(CONVERGENCE_WINDOW)..];
                if spread(recent) < self.config.convergence_threshold {
                    converged = true;
                    info!(generations = generation + 1, "Converged");
                    break;
                }
            }
        }

        let best = best_of(&population)
            .cloned()
            .ok_or_else(|| EngineError::Optimization("empty population".to_string()))?;

        info!(
            best_fitness = best.fitness,
            best_return = best.total_return,
            iterations,
            converged,
            evaluations = run.evaluations,
            "Differential evolution complete"
        );

        Ok(OptimizationResult {
            final_params: best.params,
            best_fitness: best.fitness,
            best_return: best.total_return,
            history: run.history,
            iterations,
            converged,
            evaluations: run.evaluations,
        })
    }

    /// Evaluate vectors on the pool; results keep input order and the first
    /// failing evaluation aborts the run
    fn evaluate(&self, run: &mut Run<'_>, params: Vec<ParamMap>) -> EngineResult<Vec<Individual>> {
        let objective = run.objective;
        let scored: Vec<Individual> = run.pool.install(|| {
            params
                .into_par_iter()
                .map(|params| {
                    let eval = objective.evaluate(&params)?;
                    Ok(Individual {
                        params,
                        fitness: eval.fitness,
                        total_return: eval.total_return,
                    })
                })
                .collect::<EngineResult<Vec<_>>>()
        })?;

        run.evaluations += scored.len() as u64;
        if let Some(progress) = &self.progress {
            progress.add_evaluations(scored.len() as u64);
        }
        Ok(scored)
    }

    fn fill_population(
        &self,
        run: &mut Run<'_>,
        mut population: Vec<Individual>,
        size: usize,
    ) -> EngineResult<Vec<Individual>> {
        let missing = size.saturating_sub(population.len());
        let fresh: Vec<ParamMap> = (0..missing)
            .map(|_| self.space.sample(&mut run.rng))
            .collect();
        population.extend(self.evaluate(run, fresh)?);
        Ok(population)
    }

    /// One DE/rand/1/bin generation. Returns the next population and whether
    /// any trial strictly beat its target.
    fn generation(
        &self,
        run: &mut Run<'_>,
        population: &[Individual],
    ) -> EngineResult<(Vec<Individual>, bool)> {
        let trials: Vec<ParamMap> = (0..population.len())
            .map(|i| self.trial(&mut run.rng, population, i))
            .collect();
        let scored = self.evaluate(run, trials)?;

        let mut improved = false;
        let next = population
            .iter()
            .zip(scored)
            .map(|(target, trial)| {
                if trial.fitness >= target.fitness {
                    improved |= trial.fitness > target.fitness;
                    trial
                } else {
                    target.clone()
                }
            })
            .collect();
        Ok((next, improved))
    }

    /// Mutant from 3 distinct other members, then binomial crossover with
    /// one forced mutant key
    fn trial(&self, rng: &mut StdRng, population: &[Individual], target: usize) -> ParamMap {
        let others = index::sample(rng, population.len() - 1, 3);
        let pick = |k: usize| {
            let idx = others.index(k);
            &population[if idx >= target { idx + 1 } else { idx }].params
        };
        let (x1, x2, x3) = (pick(0), pick(1), pick(2));

        let forced = rng.gen_range(0..self.space.len());
        let current = &population[target].params;

        self.space
            .iter()
            .enumerate()
            .map(|(j, (name, config))| {
                let get = |p: &ParamMap| p.get(name).copied().unwrap_or(config.min);
                let mut mutant = get(x1) + self.config.mutation_factor * (get(x2) - get(x3));
                if !config.contains(mutant) {
                    mutant = config.sample_raw(rng);
                }
                let mutant = config.quantize(mutant);

                let take_mutant = rng.gen::<f64>() < self.config.crossover_rate || j == forced;
                let value = if take_mutant { mutant } else { get(current) };
                (name.to_string(), value)
            })
            .collect()
    }

    /// Known values are snapped into the space; missing or out-of-range
    /// dimensions are drawn at random
    fn seed_vector(&self, rng: &mut StdRng, initial: &ParamMap) -> ParamMap {
        self.space
            .iter()
            .map(|(name, config)| {
                let value = match initial.get(name) {
                    Some(&v) if config.contains(v) => config.quantize(v),
                    _ => config.sample(rng),
                };
                (name.to_string(), value)
            })
            .collect()
    }

    fn cancelled_result(&self, run: Run<'_>, population: Vec<Individual>) -> OptimizationResult {
        warn!("Optimization cancelled");
        let best = best_of(&population).cloned();
        OptimizationResult {
            final_params: best.as_ref().map(|b| b.params.clone()).unwrap_or_default(),
            best_fitness: best.as_ref().map_or(f64::NEG_INFINITY, |b| b.fitness),
            best_return: best.as_ref().map_or(0.0, |b| b.total_return),
            history: run.history,
            iterations: 0,
            converged: false,
            evaluations: run.evaluations,
        }
    }
}

fn spread(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    max - min
}
