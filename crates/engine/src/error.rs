//! Engine error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Invalid parameter space: {0}")]
    InvalidParamSpace(String),

    #[error("Invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Missing parameter `{0}`")]
    MissingParameter(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Indicator error: {0}")]
    Indicator(String),

    #[error("Grid has {points} points, limit is {limit}")]
    GridTooLarge { points: u128, limit: u64 },

    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    #[error("Optimization cancelled")]
    Cancelled,

    #[error("Optimization failed: {0}")]
    Optimization(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] persistence::DbError),
}

pub type EngineResult<T> = Result<T, EngineError>;
