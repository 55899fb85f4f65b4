//! Optimization run-history document (`optimization-history.json`)

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::params::ParamMap;
use crate::{DbError, DbResult};

/// Best individual of one optimizer generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub phase: String,
    pub generation: usize,
    pub params: ParamMap,
    pub fitness: f64,
    #[serde(rename = "return")]
    pub total_return: f64,
}

/// Train / test / full-data scores of the chosen parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalMetrics {
    pub train_return: f64,
    pub train_std_dev: f64,
    pub test_return: f64,
    pub test_std_dev: f64,
    pub test_sharpe: f64,
    pub test_trades: u32,
    pub full_return: f64,
    pub full_std_dev: f64,
    pub full_sharpe: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHistory {
    pub strategy: String,
    pub best_params: ParamMap,
    pub history: Vec<HistoryPoint>,
    pub final_metrics: FinalMetrics,
}

impl RunHistory {
    pub fn read(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| DbError::file(path, e))?;
        serde_json::from_str(&content).map_err(|e| DbError::file(path, e))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> DbResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DbError::file(parent, e))?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| DbError::file(path, e))
    }

    /// Best fitness per recorded generation, in order
    pub fn fitness_series(&self) -> Vec<f64> {
        self.history.iter().map(|h| h.fitness).collect()
    }
}
