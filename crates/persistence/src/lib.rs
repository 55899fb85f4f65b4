//! Persistence layer for Poly Optimize
//!
//! - SQLite log of finished optimization runs
//! - Per-strategy saved parameter files (`<strategy>.params.json`)
//! - The JSON run-history document written after each optimization

pub mod history;
pub mod params;
pub mod repository;
pub mod schema;

pub use history::{FinalMetrics, HistoryPoint, RunHistory};
pub use params::{FileParameterStore, MemoryParameterStore, ParamMap, ParamMetadata, ParameterStore};

pub use sqlx::sqlite::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("File error at {path}: {message}")]
    File { path: String, message: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DbError {
    pub(crate) fn file(path: &Path, err: impl std::fmt::Display) -> Self {
        DbError::File {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and bring the schema up to date
    pub async fn new(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::file(parent, e))?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;
        db.configure_pragmas().await?;

        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> DbResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Execute each schema statement individually
    async fn run_migrations(&self) -> DbResult<()> {
        for statement in schema::CREATE_TABLES.split(';') {
            let sql: String = statement
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            let sql = sql.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Migration(format!("{e}: {sql}")))?;
        }

        Ok(())
    }

    async fn configure_pragmas(&self) -> DbResult<()> {
        for pragma in ["PRAGMA journal_mode=WAL", "PRAGMA synchronous=NORMAL"] {
            sqlx::query(pragma)
                .execute(&self.pool)
                .await
                .map_err(|e| DbError::Connection(format!("{pragma} failed: {e}")))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");

        let db = Database::new(&path).await.unwrap();
        assert!(path.exists());

        // Reopening an existing file re-runs the idempotent schema
        drop(db);
        let db = Database::new(&path).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM optimization_runs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
