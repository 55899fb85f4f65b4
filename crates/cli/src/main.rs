//! Poly-Optimize: backtest and tune prediction-market strategies
//!
//! Usage:
//!   poly-optimize strategies                         List strategies and their spaces
//!   poly-optimize backtest channel_breakout          One backtest with saved/explicit params
//!   poly-optimize optimize rsi --attempts 3          Differential evolution with train/test split
//!   poly-optimize grid ema_cross --top-n 20          Exhaustive grid over the strategy's space
//!   poly-optimize history                            Show the last run history document
//!   poly-optimize runs --limit 10                    Query the SQLite run log

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use engine::optimizer::{evaluate_params, GridSearchResult};
use engine::{
    limit_tokens, load_dataset, resolve_params, run_optimization, split_train_test, BacktestConfig,
    BacktestEngine, BacktestResult, BarSeries, FeeModel, FitnessEvaluator, GenericStrategy,
    GridSearchOptimizer, OptimizationReport, OptimizeProgress, OptimizeRequest, OptimizeStatus,
    PolymarketFeeConfig, StrategyKind, ValidationMode,
};
use persistence::repository::OptimizationRunRepository;
use persistence::{FileParameterStore, ParamMap, ParameterStore, RunHistory};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

const DEFAULT_DATA_PATH: &str = "data/dataset.json";
const DEFAULT_PARAMS_DIR: &str = "data/params";
const DEFAULT_HISTORY_PATH: &str = "data/optimization-history.json";
const DEFAULT_DB_PATH: &str = "data/optimize.db";
const MIN_TOKEN_POINTS: usize = engine::optimizer::driver::MIN_TOKEN_POINTS;

#[derive(Parser)]
#[command(name = "poly-optimize")]
#[command(version = APP_VERSION)]
#[command(about = "Backtest and optimize prediction-market trading strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Dataset and parameter locations shared by the data-driven commands
#[derive(clap::Args, Clone)]
struct DataArgs {
    /// Dataset file: legacy single JSON or a chunk manifest
    #[arg(long, env = "POLY_OPTIMIZE_DATA_PATH", default_value = DEFAULT_DATA_PATH)]
    data: PathBuf,
    /// Directory of `<strategy>.params.json` files
    #[arg(long, env = "POLY_OPTIMIZE_PARAMS_DIR", default_value = DEFAULT_PARAMS_DIR)]
    params_dir: PathBuf,
    /// Explicit parameter override, repeatable (`--param channel_period=12`)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, f64)>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum ValidationArg {
    Holdout,
    Batched,
    Cv,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FeeArg {
    Flat,
    Polymarket,
}

#[derive(Subcommand)]
enum Commands {
    /// List available strategies, their defaults and optimization spaces
    Strategies,
    /// Run a single backtest
    Backtest {
        /// Strategy name (see `strategies`)
        strategy: String,
        #[command(flatten)]
        data: DataArgs,
        /// Starting cash in dollars
        #[arg(long, default_value = "1000")]
        capital: Decimal,
        /// Fee model applied to every fill
        #[arg(long, value_enum, default_value = "flat")]
        fees: FeeArg,
        /// Flat fee rate (0.002 = 0.2%)
        #[arg(long, default_value = "0")]
        fee_rate: Decimal,
        /// Only the first N tokens after a seeded shuffle (0 = all)
        #[arg(long, default_value_t = 0)]
        max_tokens: usize,
        /// Number of trades to print
        #[arg(long, default_value_t = 10)]
        show_trades: usize,
        /// Optional JSON export path for the full result
        #[arg(long)]
        export: Option<String>,
    },
    /// Optimize a strategy with differential evolution and a train/test split
    Optimize {
        /// Strategy name (see `strategies`)
        strategy: String,
        #[command(flatten)]
        data: DataArgs,
        /// Run-history JSON written after the run
        #[arg(long, env = "POLY_OPTIMIZE_HISTORY_PATH", default_value = DEFAULT_HISTORY_PATH)]
        history: PathBuf,
        /// Refinement generations per attempt
        #[arg(long, default_value_t = 30)]
        iterations: usize,
        /// Random samples in the first phase
        #[arg(long, default_value_t = 50)]
        samples: usize,
        /// Independent optimization attempts
        #[arg(long, default_value_t = 5)]
        attempts: u32,
        /// Stop once an attempt's test profit reaches this many dollars
        #[arg(long, default_value_t = 10.0)]
        min_test_return: f64,
        /// Tokens used for optimization (0 = all)
        #[arg(long, default_value_t = 500)]
        max_tokens: usize,
        /// Share of each token's history used for training
        #[arg(long, default_value_t = 0.7)]
        train_ratio: f64,
        /// How held-out data is scored
        #[arg(long, value_enum, default_value = "holdout")]
        validation: ValidationArg,
        /// Tokens per batch for `--validation batched`
        #[arg(long, default_value_t = 50)]
        batch_size: usize,
        /// Folds for `--validation cv`
        #[arg(long, default_value_t = 5)]
        folds: usize,
        /// Flat fee rate used while optimizing
        #[arg(long, default_value = "0.002")]
        fee_rate: Decimal,
        /// RNG seed; omit for a fresh run each time
        #[arg(long)]
        seed: Option<u64>,
        /// Worker threads (defaults to all cores)
        #[arg(long)]
        workers: Option<usize>,
        /// Do not write the params file, run history or run log
        #[arg(long)]
        no_save: bool,
    },
    /// Evaluate every point of a strategy's parameter grid on the train split
    Grid {
        /// Strategy name (see `strategies`)
        strategy: String,
        #[command(flatten)]
        data: DataArgs,
        /// Tokens used (0 = all)
        #[arg(long, default_value_t = 500)]
        max_tokens: usize,
        /// Share of each token's history used for training
        #[arg(long, default_value_t = 0.7)]
        train_ratio: f64,
        /// Refuse grids with more points than this
        #[arg(long, default_value_t = engine::optimizer::grid::DEFAULT_MAX_POINTS)]
        max_points: u64,
        /// Flat fee rate used while evaluating
        #[arg(long, default_value = "0.002")]
        fee_rate: Decimal,
        /// Worker threads (defaults to all cores)
        #[arg(long)]
        workers: Option<usize>,
        /// Number of top points to print
        #[arg(long, default_value_t = 10)]
        top_n: usize,
        /// Optional JSON export path for all evaluated points
        #[arg(long)]
        export: Option<String>,
    },
    /// Show a run-history document
    History {
        #[arg(long, env = "POLY_OPTIMIZE_HISTORY_PATH", default_value = DEFAULT_HISTORY_PATH)]
        path: PathBuf,
    },
    /// List logged optimization runs
    Runs {
        /// Number of runs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Only runs of this strategy
        #[arg(long)]
        strategy: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,poly_optimize=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,poly_optimize=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn parse_param(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{s}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty parameter name in `{s}`"));
    }
    let value = match value.trim() {
        "true" => 1.0,
        "false" => 0.0,
        v => v
            .parse::<f64>()
            .map_err(|e| format!("invalid value for `{name}`: {e}"))?,
    };
    Ok((name.to_string(), value))
}

fn parse_strategy(name: &str) -> anyhow::Result<StrategyKind> {
    name.parse::<StrategyKind>().map_err(|e| {
        let known: Vec<&str> = StrategyKind::ALL.iter().map(|k| k.name()).collect();
        anyhow::anyhow!("{} (known: {})", e, known.join(", "))
    })
}

fn validation_mode(arg: ValidationArg, batch_size: usize, folds: usize) -> ValidationMode {
    match arg {
        ValidationArg::Holdout => ValidationMode::Holdout,
        ValidationArg::Batched => ValidationMode::Batched { batch_size },
        ValidationArg::Cv => ValidationMode::CrossValidated { folds },
    }
}

fn load_data(path: &Path, max_tokens: usize) -> anyhow::Result<engine::Dataset> {
    let dataset = load_dataset(path).map_err(|e| anyhow::anyhow!("Failed to load dataset: {}", e))?;
    info!(
        path = %path.display(),
        tokens = dataset.token_count(),
        points = dataset.point_count(),
        "Dataset loaded"
    );
    Ok(if max_tokens > 0 {
        limit_tokens(&dataset, max_tokens)
    } else {
        dataset
    })
}

/// Defaults, then the saved params file, then `--param` overrides
fn resolve(kind: StrategyKind, data: &DataArgs) -> anyhow::Result<(FileParameterStore, ParamMap)> {
    let store = FileParameterStore::new(&data.params_dir);
    let explicit: ParamMap = data.params.iter().cloned().collect();
    let params = resolve_params(kind, Some(&store as &dyn ParameterStore), &explicit)
        .map_err(|e| anyhow::anyhow!("Parameter resolution failed: {}", e))?;
    Ok((store, params))
}

fn db_path() -> String {
    std::env::var("POLY_OPTIMIZE_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before parsing, so `.env` values feed clap's `env` fallbacks
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Strategies => cmd_strategies(),
        Commands::Backtest {
            strategy,
            data,
            capital,
            fees,
            fee_rate,
            max_tokens,
            show_trades,
            export,
        } => {
            let fee_model = match fees {
                FeeArg::Flat => FeeModel::flat(fee_rate),
                FeeArg::Polymarket => FeeModel::PolymarketTaker(PolymarketFeeConfig::default()),
            };
            let config = BacktestConfig {
                initial_capital: capital,
                fee_model,
            };
            cmd_backtest(&strategy, &data, config, max_tokens, show_trades, export)?;
        }
        Commands::Optimize {
            strategy,
            data,
            history,
            iterations,
            samples,
            attempts,
            min_test_return,
            max_tokens,
            train_ratio,
            validation,
            batch_size,
            folds,
            fee_rate,
            seed,
            workers,
            no_save,
        } => {
            let kind = parse_strategy(&strategy)?;
            let request = OptimizeRequest {
                max_iterations: iterations,
                random_samples: samples,
                attempts,
                min_test_return,
                max_tokens: (max_tokens > 0).then_some(max_tokens),
                train_ratio,
                validation: validation_mode(validation, batch_size, folds),
                fee_rate,
                seed,
                workers,
                ..OptimizeRequest::new(kind)
            };
            cmd_optimize(request, &data, &history, no_save).await?;
        }
        Commands::Grid {
            strategy,
            data,
            max_tokens,
            train_ratio,
            max_points,
            fee_rate,
            workers,
            top_n,
            export,
        } => {
            cmd_grid(
                &strategy,
                &data,
                GridOptions {
                    max_tokens,
                    train_ratio,
                    max_points,
                    fee_rate,
                    workers,
                    top_n,
                },
                export,
            )
            .await?;
        }
        Commands::History { path } => cmd_history(&path)?,
        Commands::Runs { limit, strategy } => cmd_runs(limit, strategy).await?,
    }

    Ok(())
}

// ============================================================================
// strategies / backtest
// ============================================================================

fn cmd_strategies() {
    println!("\n=== Poly-Optimize v{} ===\n", APP_VERSION);
    for kind in StrategyKind::ALL {
        println!("{:<18} {}", kind.name(), kind.description());
        let defaults = kind.default_params();
        let space = kind.param_space();
        println!("  {:<22} {:>10} {:>10} {:>10} {:>8}", "param", "default", "min", "max", "step");
        for (name, value) in &defaults {
            match space.get(name) {
                Some(c) => println!(
                    "  {:<22} {:>10} {:>10} {:>10} {:>8}",
                    name, value, c.min, c.max, c.step_size
                ),
                None => println!("  {:<22} {:>10}", name, value),
            }
        }
        println!();
    }
}

fn cmd_backtest(
    strategy: &str,
    data: &DataArgs,
    config: BacktestConfig,
    max_tokens: usize,
    show_trades: usize,
    export: Option<String>,
) -> anyhow::Result<()> {
    let kind = parse_strategy(strategy)?;
    let (_, params) = resolve(kind, data)?;
    let dataset = load_data(&data.data, max_tokens)?;

    println!("\n=== Poly-Optimize v{} ===", APP_VERSION);
    println!("Strategy: {} | Fees: {} | Capital: ${}", kind, config.fee_model, config.initial_capital);
    println!("Params: {}", format_params(&params));

    let mut strategy = GenericStrategy::new(kind, params)
        .map_err(|e| anyhow::anyhow!("Invalid strategy parameters: {}", e))?;
    let engine = BacktestEngine::new(&dataset, config);
    let result = engine.run(&mut strategy);

    print_backtest(&result, show_trades);

    if let Some(export_path) = export {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&export_path, &json)?;
        println!("\nResult exported to {}", export_path);
    }

    Ok(())
}

fn print_backtest(result: &BacktestResult, show_trades: usize) {
    println!("\nBacktest ({} bars, {} -> {}):", result.bars_processed, result.start_time, result.end_time);
    println!("  {}", "-".repeat(50));
    println!("  {:<18} ${:>12.2}", "Initial capital", result.initial_capital);
    println!("  {:<18} ${:>12.2}", "Final capital", result.final_capital);
    println!("  {:<18} {:>+12.2} ({:+.2}%)", "Return", result.total_return, result.total_return_pct);
    println!(
        "  {:<18} {:>12} ({} won, {} lost, {:.1}% win rate)",
        "Trades", result.total_trades, result.winning_trades, result.losing_trades, result.win_rate
    );
    println!("  {:<18} {:>12.2}%", "Max drawdown", result.max_drawdown);
    println!("  {:<18} {:>12.2}", "Sharpe", result.sharpe_ratio);
    println!("  {:<18} ${:>12.4}", "Fees", result.total_fees);

    if show_trades > 0 && !result.trades.is_empty() {
        println!("\nFirst {} trades:", result.trades.len().min(show_trades));
        println!(
            "  {:>12}  {:<4} {:<24} {:>10} {:>8} {:>10} {:>10}",
            "Time", "Side", "Token", "Size", "Price", "Fee", "Cash"
        );
        println!("  {}", "-".repeat(85));
        for t in result.trades.iter().take(show_trades) {
            println!(
                "  {:>12}  {:<4} {:<24} {:>10.2} {:>8.4} {:>10.4} {:>10.2}",
                t.timestamp,
                t.side.to_string(),
                truncate(&t.token_id, 24),
                t.size,
                t.price,
                t.fee,
                t.capital_after,
            );
        }
    }
}

// ============================================================================
// optimize
// ============================================================================

async fn cmd_optimize(
    request: OptimizeRequest,
    data: &DataArgs,
    history_path: &Path,
    no_save: bool,
) -> anyhow::Result<()> {
    let kind = request.strategy;
    let (store, base_params) = resolve(kind, data)?;
    let dataset = load_data(&data.data, 0)?;

    println!("\n=== Poly-Optimize v{} ===", APP_VERSION);
    println!(
        "Strategy: {} | Tokens: {} | Attempts: {} | Generations: {} | Validation: {}",
        kind,
        dataset.token_count(),
        request.attempts,
        request.max_iterations,
        request.validation
    );
    println!("Space: {}", format_space(&request));
    println!("Press Ctrl+C to stop and keep the best so far\n");

    let progress = Arc::new(OptimizeProgress::new());

    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    // CPU-bound; keep it off the async workers
    let progress_clone = progress.clone();
    let request_clone = request.clone();
    let handle = tokio::task::spawn_blocking(move || {
        run_optimization(&request_clone, &dataset, base_params, progress_clone)
    });

    // Progress display loop
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        match progress.status() {
            OptimizeStatus::Running => {
                let attempt = progress.attempt.load(Ordering::Relaxed);
                let total_attempts = progress.total_attempts.load(Ordering::Relaxed);
                let evaluations = progress.evaluations.load(Ordering::Relaxed);
                let pct = progress.progress_pct();
                let best = progress
                    .best_fitness()
                    .map(|f| format!("{:.4}", f))
                    .unwrap_or_else(|| "-".to_string());

                let bar_len = 30;
                let filled = (pct as usize * bar_len) / 100;
                let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);
                print!(
                    "\r  Attempt {}/{} {:<8} [{}] {:.0}% | {} evals | best fitness {}   ",
                    attempt,
                    total_attempts,
                    progress.phase(),
                    bar,
                    pct,
                    evaluations,
                    best
                );
                std::io::Write::flush(&mut std::io::stdout()).ok();
            }
            OptimizeStatus::Complete => {
                println!("\r  Complete! ({} evaluations)                                                  ",
                    progress.evaluations.load(Ordering::Relaxed));
                break;
            }
            OptimizeStatus::Cancelled => {
                println!("\r  Cancelled, keeping the best so far                                          ");
                break;
            }
            OptimizeStatus::Error => {
                println!(
                    "\r  Error: {}                                      ",
                    progress.error_message().unwrap_or_default()
                );
                break;
            }
            OptimizeStatus::Idle if handle.is_finished() => break,
            OptimizeStatus::Idle => {}
        }
    }

    let report = handle
        .await
        .map_err(|e| anyhow::anyhow!("Optimization task failed: {}", e))?
        .map_err(|e| anyhow::anyhow!("Optimization failed: {}", e))?;

    print_report(&report);

    if no_save {
        return Ok(());
    }

    store
        .save(kind.name(), &report.best_params, &report.metadata())
        .map_err(|e| anyhow::anyhow!("Saving parameters failed: {}", e))?;
    println!("\nParams saved to {}", store.path_for(kind.name()).display());

    report
        .run_history()
        .write(history_path)
        .map_err(|e| anyhow::anyhow!("Writing run history failed: {}", e))?;
    println!("History written to {}", history_path.display());

    // The run log is best-effort; the params file is the primary output
    let db_path = db_path();
    match persistence::Database::new(&db_path).await {
        Ok(db) => {
            let repo = OptimizationRunRepository::new(db.pool());
            let record = report.run_record(Some(data.data.display().to_string()));
            match repo.save(&record).await {
                Ok(true) => info!(db = %db_path, "Run logged"),
                Ok(false) => info!(db = %db_path, "Identical run already logged"),
                Err(e) => warn!(error = %e, "Failed to log run"),
            }
        }
        Err(e) => error!(db = %db_path, error = %e, "Failed to open run log"),
    }

    Ok(())
}

fn print_report(report: &OptimizationReport) {
    let r = &report.result;
    println!(
        "\n{} after {} attempt(s): fitness {:.4}, train return {:+.2}$, {} generations{}",
        report.strategy,
        report.attempts_run,
        r.best_fitness,
        r.best_return,
        r.iterations,
        if r.converged { " (converged)" } else { "" }
    );
    println!("Best params: {}", format_params(&report.best_params));
    println!(
        "Tokens: {} train / {} test | Validation: {}",
        report.train_tokens, report.test_tokens, report.validation
    );

    println!("\n  {:<6} {:>12} {:>10} {:>8} {:>10}", "Split", "Return $", "Sharpe", "Trades", "Std dev");
    println!("  {}", "-".repeat(50));
    for (label, m) in [("train", &report.train), ("test", &report.test), ("full", &report.full)] {
        println!(
            "  {:<6} {:>+12.2} {:>10.2} {:>8} {:>10.2}",
            label, m.total_return, m.sharpe, m.trades, m.std_dev
        );
    }
}

// ============================================================================
// grid
// ============================================================================

struct GridOptions {
    max_tokens: usize,
    train_ratio: f64,
    max_points: u64,
    fee_rate: Decimal,
    workers: Option<usize>,
    top_n: usize,
}

async fn cmd_grid(
    strategy: &str,
    data: &DataArgs,
    options: GridOptions,
    export: Option<String>,
) -> anyhow::Result<()> {
    let kind = parse_strategy(strategy)?;
    let (_, base_params) = resolve(kind, data)?;
    let dataset = load_data(&data.data, options.max_tokens)?;
    let (train, test) = split_train_test(&dataset, options.train_ratio, MIN_TOKEN_POINTS);
    if train.token_count() == 0 {
        anyhow::bail!("No token has at least {} price points", MIN_TOKEN_POINTS);
    }

    let config = BacktestConfig::with_fee_rate(options.fee_rate);
    let mut optimizer = GridSearchOptimizer::new(kind.param_space()).with_max_points(options.max_points);
    if let Some(workers) = options.workers {
        optimizer = optimizer.with_workers(workers);
    }

    println!("\n=== Poly-Optimize v{} ===", APP_VERSION);
    println!(
        "Strategy: {} | Grid points: {} | Train tokens: {}",
        kind,
        optimizer.point_count(),
        train.token_count()
    );

    let progress = Arc::new(OptimizeProgress::new());
    progress.reset(kind.name(), 1);
    let progress_for_ctrlc = progress.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl+C received, requesting cancel...");
        progress_for_ctrlc.cancel();
    });

    let evaluator = FitnessEvaluator::new(kind, base_params.clone(), Arc::new(BarSeries::build(&train)))
        .with_config(config.clone());
    let optimizer = optimizer.with_progress(progress.clone());
    let handle = tokio::task::spawn_blocking(move || optimizer.optimize(&evaluator));

    while !handle.is_finished() {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
        print!(
            "\r  Grid {:.0}% ({}/{})   ",
            progress.progress_pct(),
            progress.step.load(Ordering::Relaxed),
            progress.total_steps.load(Ordering::Relaxed)
        );
        std::io::Write::flush(&mut std::io::stdout()).ok();
    }
    println!();

    let result = handle
        .await
        .map_err(|e| anyhow::anyhow!("Grid search task failed: {}", e))?
        .map_err(|e| anyhow::anyhow!("Grid search failed: {}", e))?;

    print_grid(&result, options.top_n);

    if test.token_count() > 0 {
        let mut resolved = base_params;
        resolved.extend(result.best_params.iter().map(|(k, v)| (k.clone(), *v)));
        let held_out = evaluate_params(kind, &resolved, &test, &config, ValidationMode::Holdout)
            .map_err(|e| anyhow::anyhow!("Test evaluation failed: {}", e))?;
        println!(
            "\nBest point on test split: {:+.2}$ over {} trades (Sharpe {:.2})",
            held_out.total_return, held_out.trades, held_out.sharpe
        );
    }

    if let Some(export_path) = export {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&export_path, &json)?;
        println!("\nGrid exported to {}", export_path);
    }

    Ok(())
}

fn print_grid(result: &GridSearchResult, top_n: usize) {
    println!(
        "\nTop {} of {} points:",
        result.results.len().min(top_n),
        result.total_points
    );
    println!("  {:>3}  {:>9} {:>9}  {}", "#", "Fitness", "Return $", "Params");
    println!("  {}", "-".repeat(75));
    for (i, ind) in result.top(top_n).into_iter().enumerate() {
        println!(
            "  {:>3}  {:>9.4} {:>+9.2}  {}",
            i + 1,
            ind.fitness,
            ind.total_return,
            format_params(&ind.params)
        );
    }
}

// ============================================================================
// history / runs
// ============================================================================

fn cmd_history(path: &Path) -> anyhow::Result<()> {
    let history = RunHistory::read(path).map_err(|e| anyhow::anyhow!("Reading run history failed: {}", e))?;
    let m = &history.final_metrics;

    println!("\nStrategy: {}", history.strategy);
    println!("Best params: {}", format_params(&history.best_params));
    println!(
        "Train {:+.2}$ (std {:.2}) | Test {:+.2}$ (std {:.2}, Sharpe {:.2}, {} trades) | Full {:+.2}$",
        m.train_return, m.train_std_dev, m.test_return, m.test_std_dev, m.test_sharpe, m.test_trades, m.full_return
    );

    println!("\n  {:<8} {:>4} {:>9} {:>9}", "Phase", "Gen", "Fitness", "Return $");
    println!("  {}", "-".repeat(34));
    for point in &history.history {
        println!(
            "  {:<8} {:>4} {:>9.4} {:>+9.2}",
            point.phase, point.generation, point.fitness, point.total_return
        );
    }
    Ok(())
}

async fn cmd_runs(limit: i64, strategy: Option<String>) -> anyhow::Result<()> {
    let db_path = db_path();
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;

    let strategy = strategy.as_deref().map(parse_strategy).transpose()?;
    let repo = OptimizationRunRepository::new(db.pool());
    let stats = repo
        .get_stats()
        .await
        .map_err(|e| anyhow::anyhow!("Stats query failed: {}", e))?;
    let runs = repo
        .list_recent(limit, strategy.map(|k| k.name()))
        .await
        .map_err(|e| anyhow::anyhow!("Run query failed: {}", e))?;

    println!(
        "\nDatabase: {} ({} runs, {} strategies{})",
        db_path,
        stats.total_runs,
        stats.unique_strategies,
        match (&stats.best_strategy, stats.best_test_return) {
            (Some(s), Some(r)) => format!(", best {} at {:+.2}$", s, r),
            _ => String::new(),
        }
    );
    if runs.is_empty() {
        println!("No runs logged.");
        return Ok(());
    }

    println!(
        "  {:>5}  {:<18} {:<12} {:>10} {:>10} {:>7} {:>5}  {}",
        "ID", "Strategy", "Validation", "Test $", "Full $", "Trades", "Conv", "Params"
    );
    println!("  {}", "-".repeat(100));
    for run in runs {
        let params: ParamMap = serde_json::from_str(&run.params_json).unwrap_or_default();
        println!(
            "  {:>5}  {:<18} {:<12} {:>+10.2} {:>+10.2} {:>7} {:>5}  {}",
            run.id.unwrap_or_default(),
            run.strategy,
            run.validation,
            run.test_return,
            run.full_return,
            run.test_trades,
            if run.converged { "yes" } else { "no" },
            format_params(&params)
        );
    }
    Ok(())
}

// ============================================================================
// Formatting helpers
// ============================================================================

fn format_params(params: &ParamMap) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_space(request: &OptimizeRequest) -> String {
    request
        .param_space()
        .iter()
        .map(|(name, c)| format!("{}=[{}..{} /{}]", name, c.min, c.max, c.step_size))
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
