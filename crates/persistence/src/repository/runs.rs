//! Optimization run log

use crate::params::ParamMap;
use crate::DbResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};

/// One finished optimization, as stored in `optimization_runs`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OptimizationRunRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub strategy: String,
    pub params_json: String,
    pub validation: String,
    pub attempts: i64,
    pub best_fitness: f64,
    pub train_return: f64,
    pub test_return: f64,
    pub test_std_dev: f64,
    pub test_sharpe: f64,
    pub test_trades: i64,
    pub full_return: f64,
    pub iterations: i64,
    pub converged: bool,
    pub dataset: Option<String>,
    pub created_at: Option<i64>,
}

/// Aggregated stats over the run log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub total_runs: i64,
    pub unique_strategies: i64,
    pub best_strategy: Option<String>,
    pub best_test_return: Option<f64>,
}

/// Stable hash of a strategy + parameter vector (params are key-sorted)
pub fn compute_params_hash(strategy: &str, params: &ParamMap) -> String {
    let json = serde_json::to_string(params).unwrap_or_default();
    let hash = Sha256::digest(format!("{strategy}:{json}").as_bytes());
    format!("{:x}", hash)
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, params_hash, strategy, params_json, validation, attempts,
           best_fitness, train_return, test_return, test_std_dev, test_sharpe,
           test_trades, full_return, iterations, converged, dataset, created_at
    FROM optimization_runs
"#;

/// Repository for optimization runs
pub struct OptimizationRunRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> OptimizationRunRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a run; an identical strategy + params is only stored once.
    /// Returns `false` when the row already existed.
    pub async fn save(&self, record: &OptimizationRunRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO optimization_runs (
                params_hash, strategy, params_json, validation, attempts,
                best_fitness, train_return, test_return, test_std_dev, test_sharpe,
                test_trades, full_return, iterations, converged, dataset
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.strategy)
        .bind(&record.params_json)
        .bind(&record.validation)
        .bind(record.attempts)
        .bind(record.best_fitness)
        .bind(record.train_return)
        .bind(record.test_return)
        .bind(record.test_std_dev)
        .bind(record.test_sharpe)
        .bind(record.test_trades)
        .bind(record.full_return)
        .bind(record.iterations)
        .bind(record.converged)
        .bind(&record.dataset)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_by_hash(&self, hash: &str) -> DbResult<Option<OptimizationRunRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE params_hash = ?");
        let record = sqlx::query_as::<_, OptimizationRunRecord>(&sql)
            .bind(hash)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    /// Most recent runs first, optionally for one strategy
    pub async fn list_recent(
        &self,
        limit: i64,
        strategy: Option<&str>,
    ) -> DbResult<Vec<OptimizationRunRecord>> {
        let records = match strategy {
            Some(name) => {
                let sql = format!("{SELECT_COLUMNS} WHERE strategy = ? ORDER BY id DESC LIMIT ?");
                sqlx::query_as::<_, OptimizationRunRecord>(&sql)
                    .bind(name)
                    .bind(limit)
                    .fetch_all(self.pool)
                    .await?
            }
            None => {
                let sql = format!("{SELECT_COLUMNS} ORDER BY id DESC LIMIT ?");
                sqlx::query_as::<_, OptimizationRunRecord>(&sql)
                    .bind(limit)
                    .fetch_all(self.pool)
                    .await?
            }
        };
        Ok(records)
    }

    /// Highest held-out return recorded for a strategy
    pub async fn best_for_strategy(&self, strategy: &str) -> DbResult<Option<OptimizationRunRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE strategy = ? ORDER BY test_return DESC, id ASC LIMIT 1");
        let record = sqlx::query_as::<_, OptimizationRunRecord>(&sql)
            .bind(strategy)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    pub async fn get_stats(&self) -> DbResult<RunStats> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM optimization_runs")
            .fetch_one(self.pool)
            .await?;

        let unique: (i64,) = sqlx::query_as("SELECT COUNT(DISTINCT strategy) FROM optimization_runs")
            .fetch_one(self.pool)
            .await?;

        let best: Option<(String, f64)> = sqlx::query_as(
            "SELECT strategy, test_return FROM optimization_runs ORDER BY test_return DESC LIMIT 1",
        )
        .fetch_optional(self.pool)
        .await?;

        Ok(RunStats {
            total_runs: total.0,
            unique_strategies: unique.0,
            best_strategy: best.as_ref().map(|(s, _)| s.clone()),
            best_test_return: best.map(|(_, r)| r),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(strategy: &str, fast: f64, test_return: f64) -> OptimizationRunRecord {
        let mut params = ParamMap::new();
        params.insert("fast_period".to_string(), fast);
        OptimizationRunRecord {
            id: None,
            params_hash: compute_params_hash(strategy, &params),
            strategy: strategy.to_string(),
            params_json: serde_json::to_string(&params).unwrap(),
            validation: "holdout".to_string(),
            attempts: 1,
            best_fitness: 0.1,
            train_return: 5.0,
            test_return,
            test_std_dev: 0.0,
            test_sharpe: 1.0,
            test_trades: 12,
            full_return: 4.0,
            iterations: 30,
            converged: false,
            dataset: None,
            created_at: None,
        }
    }

    #[test]
    fn test_hash_depends_on_strategy_and_params() {
        let mut params = ParamMap::new();
        params.insert("a".to_string(), 1.0);
        let h1 = compute_params_hash("rsi", &params);
        assert_eq!(h1, compute_params_hash("rsi", &params));
        assert_ne!(h1, compute_params_hash("bollinger", &params));
        params.insert("a".to_string(), 2.0);
        assert_ne!(h1, compute_params_hash("rsi", &params));
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_hash() {
        let db = Database::in_memory().await.unwrap();
        let repo = OptimizationRunRepository::new(db.pool());

        let run = record("simple_ma", 10.0, 12.5);
        assert!(repo.save(&run).await.unwrap());
        assert!(!repo.save(&run).await.unwrap());

        let stored = repo.get_by_hash(&run.params_hash).await.unwrap().unwrap();
        assert_eq!(stored.strategy, "simple_ma");
        assert_eq!(stored.test_trades, 12);
        assert!(stored.created_at.is_some());
    }

    #[tokio::test]
    async fn test_best_and_stats() {
        let db = Database::in_memory().await.unwrap();
        let repo = OptimizationRunRepository::new(db.pool());

        repo.save(&record("simple_ma", 10.0, 3.0)).await.unwrap();
        repo.save(&record("simple_ma", 15.0, 9.0)).await.unwrap();
        repo.save(&record("rsi", 5.0, 20.0)).await.unwrap();

        let best = repo.best_for_strategy("simple_ma").await.unwrap().unwrap();
        assert_eq!(best.test_return, 9.0);

        let recent = repo.list_recent(10, Some("simple_ma")).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].test_return, 9.0);
        assert_eq!(repo.list_recent(1, None).await.unwrap().len(), 1);

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.unique_strategies, 2);
        assert_eq!(stats.best_strategy.as_deref(), Some("rsi"));
        assert_eq!(stats.best_test_return, Some(20.0));
    }
}
