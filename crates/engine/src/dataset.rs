//! Dataset loading and token partitioning
//!
//! Two on-disk layouts are understood, both JSON:
//! - a single file holding the whole [`Dataset`]
//! - a manifest `{ "metadata": "meta.json", "markets": [..], "priceHistory": [..] }`
//!   whose entries are chunk files resolved relative to the manifest
//!
//! A missing or malformed file is fatal; there is no partial load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::types::{CollectionMetadata, Dataset, Market, PricePoint};

/// Seed of the token shuffle used for limiting and cross-validation
pub const SHUFFLE_SEED: u64 = 42;

#[derive(Debug, Deserialize)]
struct Manifest {
    metadata: String,
    #[serde(default)]
    markets: Vec<String>,
    #[serde(default, rename = "priceHistory", alias = "price_history")]
    price_history: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataChunk {
    #[serde(default, rename = "collectionMetadata", alias = "collection_metadata")]
    collection_metadata: Option<CollectionMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct MarketChunk {
    #[serde(default)]
    markets: Vec<Market>,
}

#[derive(Debug, Default, Deserialize)]
struct PriceChunk {
    #[serde(default, rename = "priceHistory", alias = "price_history")]
    price_history: BTreeMap<String, Vec<PricePoint>>,
}

fn dataset_error(path: &Path, reason: impl std::fmt::Display) -> EngineError {
    EngineError::Dataset(format!("{}: {}", path.display(), reason))
}

fn read_json(path: &Path) -> EngineResult<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| dataset_error(path, e))?;
    serde_json::from_str(&content).map_err(|e| dataset_error(path, e))
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path, value: Value) -> EngineResult<T> {
    serde_json::from_value(value).map_err(|e| dataset_error(path, e))
}

/// Load a dataset from a single file or a chunk manifest
pub fn load_dataset(path: impl AsRef<Path>) -> EngineResult<Dataset> {
    let path = path.as_ref();
    let document = read_json(path)?;

    let is_manifest = document
        .get("metadata")
        .is_some_and(|metadata| metadata.is_string());

    let dataset = if is_manifest {
        let manifest: Manifest = parse(path, document)?;
        load_manifest(path, manifest)?
    } else {
        parse::<Dataset>(path, document)?
    };

    info!(
        path = %path.display(),
        markets = dataset.markets.len(),
        tokens = dataset.token_count(),
        points = dataset.point_count(),
        "Dataset loaded"
    );
    Ok(dataset)
}

fn load_manifest(path: &Path, manifest: Manifest) -> EngineResult<Dataset> {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let resolve = |name: &str| -> PathBuf { dir.join(name) };

    let metadata_path = resolve(&manifest.metadata);
    let metadata: MetadataChunk = parse(&metadata_path, read_json(&metadata_path)?)?;

    let mut markets = Vec::new();
    for chunk in &manifest.markets {
        let chunk_path = resolve(chunk);
        let parsed: MarketChunk = parse(&chunk_path, read_json(&chunk_path)?)?;
        debug!(chunk = %chunk_path.display(), markets = parsed.markets.len(), "Loaded market chunk");
        markets.extend(parsed.markets);
    }

    let mut price_history = BTreeMap::new();
    for chunk in &manifest.price_history {
        let chunk_path = resolve(chunk);
        let parsed: PriceChunk = parse(&chunk_path, read_json(&chunk_path)?)?;
        debug!(chunk = %chunk_path.display(), tokens = parsed.price_history.len(), "Loaded price chunk");
        price_history.extend(parsed.price_history);
    }

    let metadata = metadata.collection_metadata.unwrap_or_else(|| CollectionMetadata {
        total_markets: markets.len(),
        total_tokens: price_history.len(),
        ..Default::default()
    });

    Ok(Dataset {
        markets,
        price_history,
        metadata,
    })
}

// ============================================================================
// Token partitioning
// ============================================================================

/// Deterministic Fisher-Yates shuffle driven by a 31-bit LCG
/// (`seed = (seed * 1103515245 + 12345) & 0x7fffffff`, `j = seed % (i + 1)`)
pub fn seeded_shuffle<T: Clone>(items: &[T], seed: u64) -> Vec<T> {
    let mut result = items.to_vec();
    let mut state = seed;
    for i in (1..result.len()).rev() {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345) & 0x7fff_ffff;
        let j = (state % (i as u64 + 1)) as usize;
        result.swap(i, j);
    }
    result
}

/// Keep at most `max_tokens` tokens, picked by a seeded shuffle
pub fn limit_tokens(dataset: &Dataset, max_tokens: usize) -> Dataset {
    if dataset.token_count() <= max_tokens {
        return dataset.clone();
    }
    let ids: Vec<&str> = dataset.token_ids().collect();
    let kept = seeded_shuffle(&ids, SHUFFLE_SEED);
    info!(tokens = dataset.token_count(), kept = max_tokens, "Limiting tokens (seeded shuffle)");
    dataset.subset(kept.into_iter().take(max_tokens))
}

/// Chronological split of every token's own history: the first
/// `floor(len · train_ratio)` points train, the rest test. Tokens with fewer
/// than `min_points` points are dropped from both sides.
pub fn split_train_test(dataset: &Dataset, train_ratio: f64, min_points: usize) -> (Dataset, Dataset) {
    let mut train = BTreeMap::new();
    let mut test = BTreeMap::new();

    for (token_id, points) in &dataset.price_history {
        if points.len() < min_points {
            continue;
        }
        let mut sorted = points.clone();
        sorted.sort_by_key(|p| p.timestamp);

        let split = ((sorted.len() as f64 * train_ratio).floor() as usize).min(sorted.len());
        let tail = sorted.split_off(split);
        if !sorted.is_empty() {
            train.insert(token_id.clone(), sorted);
        }
        if !tail.is_empty() {
            test.insert(token_id.clone(), tail);
        }
    }

    let with_history = |price_history: BTreeMap<String, Vec<PricePoint>>| {
        let mut part = dataset.subset(price_history.keys().map(String::as_str));
        part.price_history = price_history;
        part
    };
    (with_history(train), with_history(test))
}

/// One cross-validation fold
#[derive(Debug, Clone, PartialEq)]
pub struct TokenFold {
    pub train: Vec<String>,
    pub validation: Vec<String>,
}

/// `k` folds over the shuffled token ids; the last fold takes the remainder
pub fn token_folds(token_ids: &[String], k: usize) -> EngineResult<Vec<TokenFold>> {
    if k < 2 || k > token_ids.len() {
        return Err(EngineError::Dataset(format!(
            "cannot build {k} folds from {} tokens",
            token_ids.len()
        )));
    }

    let shuffled = seeded_shuffle(token_ids, SHUFFLE_SEED);
    let fold_size = shuffled.len() / k;
    Ok((0..k)
        .map(|fold| {
            let start = fold * fold_size;
            let end = if fold == k - 1 {
                shuffled.len()
            } else {
                start + fold_size
            };
            TokenFold {
                validation: shuffled[start..end].to_vec(),
                train: shuffled[..start]
                    .iter()
                    .chain(&shuffled[end..])
                    .cloned()
                    .collect(),
            }
        })
        .collect())
}

/// Consecutive batches of at most `batch_size` ids (in the given order)
pub fn token_batches(token_ids: &[String], batch_size: usize) -> Vec<Vec<String>> {
    token_ids
        .chunks(batch_size.max(1))
        .map(<[String]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i:02}")).collect()
    }

    #[test]
    fn test_seeded_shuffle_is_deterministic_permutation() {
        let items: Vec<u32> = (0..20).collect();
        let a = seeded_shuffle(&items, SHUFFLE_SEED);
        let b = seeded_shuffle(&items, SHUFFLE_SEED);
        assert_eq!(a, b);
        assert_ne!(a, items);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, items);

        assert_ne!(seeded_shuffle(&items, 7), a);
        assert!(seeded_shuffle::<u32>(&[], 1).is_empty());
    }

    #[test]
    fn test_split_is_per_token_chronological() {
        let mut dataset = Dataset::default();
        // Stored out of order on purpose
        let mut long: Vec<PricePoint> = (0..10).map(|i| PricePoint::new(100 + i, dec!(0.5))).collect();
        long.reverse();
        dataset.price_history.insert("long".to_string(), long);
        dataset.price_history.insert(
            "late".to_string(),
            (0..20).map(|i| PricePoint::new(1000 + i, dec!(0.3))).collect(),
        );
        dataset.price_history.insert(
            "short".to_string(),
            (0..9).map(|i| PricePoint::new(i, dec!(0.1))).collect(),
        );

        let (train, test) = split_train_test(&dataset, 0.7, 10);

        assert!(!train.price_history.contains_key("short"));
        assert!(!test.price_history.contains_key("short"));
        assert_eq!(train.price_history["long"].len(), 7);
        assert_eq!(test.price_history["long"].len(), 3);
        assert_eq!(test.price_history["long"][0].timestamp, 107);
        assert_eq!(train.price_history["late"].len(), 14);
        // Each token splits on its own timeline
        assert!(train.price_history["late"][0].timestamp > test.price_history["long"][2].timestamp);
    }

    #[test]
    fn test_limit_tokens() {
        let mut dataset = Dataset::default();
        for id in ids(10) {
            dataset.price_history.insert(id, vec![PricePoint::new(1, dec!(0.5))]);
        }
        let limited = limit_tokens(&dataset, 4);
        assert_eq!(limited.token_count(), 4);
        assert_eq!(
            limited.token_ids().collect::<Vec<_>>(),
            limit_tokens(&dataset, 4).token_ids().collect::<Vec<_>>()
        );
        assert_eq!(limit_tokens(&dataset, 50).token_count(), 10);
    }

    #[test]
    fn test_folds_cover_every_token_once() {
        let tokens = ids(11);
        let folds = token_folds(&tokens, 3).unwrap();
        assert_eq!(folds.len(), 3);
        assert_eq!(folds[0].validation.len(), 3);
        assert_eq!(folds[2].validation.len(), 5);

        let mut seen: Vec<String> = folds.iter().flat_map(|f| f.validation.clone()).collect();
        seen.sort();
        assert_eq!(seen, tokens);
        for fold in &folds {
            assert_eq!(fold.train.len() + fold.validation.len(), 11);
            assert!(fold.train.iter().all(|t| !fold.validation.contains(t)));
        }

        assert!(token_folds(&tokens, 1).is_err());
        assert!(token_folds(&ids(2), 3).is_err());
    }

    #[test]
    fn test_batches() {
        let batches = token_batches(&ids(5), 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2], vec!["t04".to_string()]);
        assert_eq!(token_batches(&ids(3), 0).len(), 3);
    }

    #[test]
    fn test_load_single_file_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        std::fs::write(
            &path,
            r#"{
                "markets": [{"id": "m1", "question": "Will it rain?",
                             "tokens": [{"token_id": "yes", "outcome": "Yes"}]}],
                "priceHistory": {"yes": [{"t": 1, "p": 0.42}, {"t": 2, "p": "0.44"}]}
            }"#,
        )
        .unwrap();

        let dataset = load_dataset(&path).unwrap();
        assert_eq!(dataset.markets.len(), 1);
        assert_eq!(dataset.price_history["yes"][0].price, dec!(0.42));
        assert_eq!(dataset.price_history["yes"][1].price, dec!(0.44));
    }

    #[test]
    fn test_load_manifest_dataset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("chunks")).unwrap();
        std::fs::write(
            dir.path().join("chunks/meta.json"),
            r#"{"collectionMetadata": {"total_markets": 1, "source": "test"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("chunks/markets-0.json"),
            r#"{"markets": [{"id": "m1", "tokens": [{"token_id": "a"}, {"token_id": "b"}]}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("chunks/prices-0.json"),
            r#"{"priceHistory": {"a": [{"t": 1, "p": 0.5}]}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("chunks/prices-1.json"),
            r#"{"priceHistory": {"b": [{"t": 2, "p": 0.5}, {"t": 3, "p": 0.6}]}}"#,
        )
        .unwrap();
        let manifest = dir.path().join("manifest.json");
        std::fs::write(
            &manifest,
            r#"{"metadata": "chunks/meta.json", "markets": ["chunks/markets-0.json"],
                "priceHistory": ["chunks/prices-0.json", "chunks/prices-1.json"]}"#,
        )
        .unwrap();

        let dataset = load_dataset(&manifest).unwrap();
        assert_eq!(dataset.markets[0].tokens.len(), 2);
        assert_eq!(dataset.token_count(), 2);
        assert_eq!(dataset.point_count(), 3);
        assert_eq!(dataset.metadata.source.as_deref(), Some("test"));
    }

    #[test]
    fn test_missing_or_malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_dataset(dir.path().join("absent.json")),
            Err(EngineError::Dataset(_))
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ nope").unwrap();
        assert!(load_dataset(&bad).is_err());

        let missing_chunk = dir.path().join("manifest.json");
        std::fs::write(&missing_chunk, r#"{"metadata": "meta.json", "priceHistory": ["gone.json"]}"#).unwrap();
        std::fs::write(dir.path().join("meta.json"), "{}").unwrap();
        assert!(load_dataset(&missing_chunk).is_err());
    }
}
