//! Database schema definitions

/// SQL to create all tables. Metrics are plain REAL columns: they are
/// ratios and percentages, not ledger amounts.
pub const CREATE_TABLES: &str = r#"
-- One row per finished optimization (deduplicated by strategy + params)
CREATE TABLE IF NOT EXISTS optimization_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    strategy TEXT NOT NULL,
    params_json TEXT NOT NULL,
    validation TEXT NOT NULL DEFAULT 'holdout',
    attempts INTEGER NOT NULL DEFAULT 1,
    best_fitness REAL NOT NULL DEFAULT 0,
    train_return REAL NOT NULL DEFAULT 0,
    test_return REAL NOT NULL DEFAULT 0,
    test_std_dev REAL NOT NULL DEFAULT 0,
    test_sharpe REAL NOT NULL DEFAULT 0,
    test_trades INTEGER NOT NULL DEFAULT 0,
    full_return REAL NOT NULL DEFAULT 0,
    iterations INTEGER NOT NULL DEFAULT 0,
    converged INTEGER NOT NULL DEFAULT 0,
    dataset TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_runs_strategy ON optimization_runs(strategy);
CREATE INDEX IF NOT EXISTS idx_runs_test_return ON optimization_runs(test_return DESC)
"#;
