//! Saved strategy parameters
//!
//! A parameter file is a flat JSON object `name -> number`, plus an optional
//! `metadata` object describing where the numbers came from:
//!
//! ```json
//! { "fast_period": 10, "slow_period": 40, "trailing_stop": 1,
//!   "metadata": { "best_test_return": 14.2, "optimized_at": "2024-05-01T10:00:00Z" } }
//! ```
//!
//! Booleans are accepted as `true`/`false` or `0`/`1` and always read back as
//! `0.0`/`1.0`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{DbError, DbResult};

pub type ParamMap = BTreeMap<String, f64>;

const METADATA_KEY: &str = "metadata";

/// Provenance written next to optimized parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMetadata {
    pub best_test_return: f64,
    pub optimized_at: String,
}

/// Source of per-strategy parameter overrides
pub trait ParameterStore: Send + Sync {
    /// Saved parameters for a strategy, `None` if nothing usable is stored
    fn load(&self, strategy: &str) -> DbResult<Option<ParamMap>>;

    fn save(&self, strategy: &str, params: &ParamMap, metadata: &ParamMetadata) -> DbResult<()>;
}

/// Extract the numeric parameters of a saved document, dropping `metadata`
/// and anything that is neither a number nor a boolean.
pub fn params_from_document(document: &Value) -> Option<ParamMap> {
    let object = document.as_object()?;
    let params = object
        .iter()
        .filter(|(key, _)| key.as_str() != METADATA_KEY)
        .filter_map(|(key, value)| {
            let number = match value {
                Value::Number(n) => n.as_f64()?,
                Value::Bool(b) => {
                    if *b {
                        1.0
                    } else {
                        0.0
                    }
                }
                _ => return None,
            };
            Some((key.clone(), number))
        })
        .collect();
    Some(params)
}

/// Build the document written by [`ParameterStore::save`]
pub fn params_to_document(params: &ParamMap, metadata: &ParamMetadata) -> DbResult<Value> {
    let mut object: Map<String, Value> = params
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(*v)))
        .collect();
    object.insert(METADATA_KEY.to_string(), serde_json::to_value(metadata)?);
    Ok(Value::Object(object))
}

// ============================================================================
// File-backed store
// ============================================================================

/// Stores `<strategy>.params.json` files in one directory
#[derive(Debug, Clone)]
pub struct FileParameterStore {
    dir: PathBuf,
}

impl FileParameterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, strategy: &str) -> PathBuf {
        self.dir.join(format!("{strategy}.params.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl ParameterStore for FileParameterStore {
    fn load(&self, strategy: &str) -> DbResult<Option<ParamMap>> {
        let path = self.path_for(strategy);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| DbError::file(&path, e))?;

        // A damaged file falls back to defaults rather than aborting the run
        let document: Value = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring malformed params file");
                return Ok(None);
            }
        };

        match params_from_document(&document) {
            Some(params) => {
                debug!(path = %path.display(), count = params.len(), "Loaded saved params");
                Ok(Some(params))
            }
            None => {
                warn!(path = %path.display(), "Params file is not a JSON object, ignoring");
                Ok(None)
            }
        }
    }

    fn save(&self, strategy: &str, params: &ParamMap, metadata: &ParamMetadata) -> DbResult<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| DbError::file(&self.dir, e))?;
        let path = self.path_for(strategy);
        let document = params_to_document(params, metadata)?;
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(&path, json).map_err(|e| DbError::file(&path, e))?;
        debug!(path = %path.display(), "Saved params");
        Ok(())
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Store used by tests and by callers that never want disk overrides
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    entries: RwLock<HashMap<String, (ParamMap, Option<ParamMetadata>)>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, strategy: &str, params: ParamMap) -> Self {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(strategy.to_string(), (params, None));
        }
        self
    }

    pub fn metadata(&self, strategy: &str) -> Option<ParamMetadata> {
        let entries = self.entries.read().ok()?;
        entries.get(strategy).and_then(|(_, meta)| meta.clone())
    }
}

impl ParameterStore for MemoryParameterStore {
    fn load(&self, strategy: &str) -> DbResult<Option<ParamMap>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| DbError::Query("parameter store lock poisoned".to_string()))?;
        Ok(entries.get(strategy).map(|(params, _)| params.clone()))
    }

    fn save(&self, strategy: &str, params: &ParamMap, metadata: &ParamMetadata) -> DbResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| DbError::Query("parameter store lock poisoned".to_string()))?;
        entries.insert(strategy.to_string(), (params.clone(), Some(metadata.clone())));
        Ok(())
    }
}
