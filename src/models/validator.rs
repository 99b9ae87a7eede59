//! Cache validation
//!
//! Decides whether a cache location can be loaded without touching the
//! network. Checks run config → weights → tokenizer against the canonical
//! snapshot and stop at the first failure. Nothing is cached between calls,
//! so a result is always a fresh view of the filesystem.

use super::cache::{Snapshot, canonical_snapshot, model_location};
use crate::error::{CacheProblem, IncompleteShard, ModelError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Single-file weight formats, in order of preference
pub const SINGLE_FILE_WEIGHTS: &[&str] = &["model.safetensors", "pytorch_model.bin"];

/// Suffix of sharded weight index manifests
pub const SHARD_INDEX_SUFFIX: &str = ".index.json";

/// Any one of these counts as a tokenizer artifact
pub const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer.model",
    "tokenizer_config.json",
    "vocab.txt",
    "vocab.json",
    "spiece.model",
    "sentencepiece.bpe.model",
];

/// Marker suffix of a blob whose download never finished
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Outcome of checking a cache location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<CacheProblem>,
    /// Canonical snapshot the verdict applies to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

impl ValidationResult {
    fn valid(snapshot: PathBuf) -> Self {
        Self {
            valid: true,
            reason: None,
            snapshot: Some(snapshot),
        }
    }

    fn invalid(problem: CacheProblem, snapshot: Option<PathBuf>) -> Self {
        Self {
            valid: false,
            reason: Some(problem),
            snapshot,
        }
    }

    /// Human-readable verdict for logs and aggregated errors
    pub fn verdict(&self) -> String {
        match &self.reason {
            None => "valid".to_string(),
            Some(problem) => format!("invalid ({problem})"),
        }
    }

    /// The failing check as a load error for `model`; `None` when valid
    pub fn into_error(self, model: &str) -> Option<ModelError> {
        self.reason.map(|problem| ModelError::CacheCorrupt {
            model: model.to_string(),
            problem,
        })
    }

    /// Whether there was anything on disk to validate
    pub fn location_exists(&self) -> bool {
        !self.reason.as_ref().is_some_and(CacheProblem::is_absent)
    }
}

/// Validate a cache location (`<root>/models--org--name`)
pub fn validate(location: &Path) -> ValidationResult {
    if !location.exists() {
        return ValidationResult::invalid(
            CacheProblem::NotFound {
                path: location.to_path_buf(),
            },
            None,
        );
    }

    let Some(Snapshot { path: snapshot, .. }) = canonical_snapshot(location) else {
        return ValidationResult::invalid(CacheProblem::NoSnapshots, None);
    };

    let checks = check_config(&snapshot)
        .and_then(|_| check_weights(&snapshot))
        .and_then(|_| check_tokenizer(&snapshot));

    let result = match checks {
        Ok(()) => ValidationResult::valid(snapshot),
        Err(problem) => ValidationResult::invalid(problem, Some(snapshot)),
    };

    tracing::debug!(
        location = %location.display(),
        verdict = %result.verdict(),
        "Validated cache location"
    );

    result
}

/// Validate the cache of `model_id` under `root`
pub fn validate_model(root: &Path, model_id: &str) -> ValidationResult {
    validate(&model_location(root, model_id))
}

/// `config.json` must exist, parse, and carry a model-type marker
pub fn check_config(snapshot: &Path) -> Result<(), CacheProblem> {
    let config_path = snapshot.join("config.json");
    if !config_path.exists() {
        return Err(CacheProblem::MissingConfig);
    }

    let content = std::fs::read_to_string(&config_path).map_err(|e| {
        CacheProblem::InvalidConfigJson {
            detail: e.to_string(),
        }
    })?;
    let config: serde_json::Value =
        serde_json::from_str(&content).map_err(|e| CacheProblem::InvalidConfigJson {
            detail: e.to_string(),
        })?;

    let has_marker = config
        .as_object()
        .is_some_and(|obj| obj.contains_key("model_type") || obj.contains_key("architectures"));
    if !has_marker {
        return Err(CacheProblem::MissingRequiredKeys);
    }

    Ok(())
}

/// Weights must resolve as a single file or a fully resolvable shard set
pub fn check_weights(snapshot: &Path) -> Result<(), CacheProblem> {
    if SINGLE_FILE_WEIGHTS
        .iter()
        .any(|name| snapshot.join(name).exists())
    {
        return Ok(());
    }

    let Some(index_name) = shard_indexes(snapshot).into_iter().next() else {
        return Err(CacheProblem::MissingWeights);
    };

    let shards = read_shard_index(&snapshot.join(&index_name)).map_err(|detail| {
        CacheProblem::InvalidShardIndex {
            index: index_name.clone(),
            detail,
        }
    })?;

    let mut incomplete = Vec::new();
    let mut missing = Vec::new();
    for shard in shards {
        match shard_state(snapshot, &shard) {
            ShardState::Present => {}
            ShardState::Incomplete { size_bytes } => incomplete.push(IncompleteShard {
                file: shard,
                size_bytes,
            }),
            ShardState::Missing => missing.push(shard),
        }
    }

    if !incomplete.is_empty() {
        return Err(CacheProblem::IncompleteShard {
            incomplete,
            missing,
        });
    }
    if !missing.is_empty() {
        return Err(CacheProblem::MissingShard { shards: missing });
    }

    Ok(())
}

/// At least one known tokenizer artifact must exist
pub fn check_tokenizer(snapshot: &Path) -> Result<(), CacheProblem> {
    if TOKENIZER_FILES
        .iter()
        .any(|name| snapshot.join(name).exists())
    {
        Ok(())
    } else {
        Err(CacheProblem::MissingTokenizer)
    }
}

/// Names of `*.index.json` manifests in a snapshot, sorted
pub fn shard_indexes(snapshot: &Path) -> Vec<String> {
    let mut indexes: Vec<String> = std::fs::read_dir(snapshot)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|name| name.ends_with(SHARD_INDEX_SUFFIX))
                .collect()
        })
        .unwrap_or_default();
    indexes.sort();
    indexes
}

/// Unique shard file names referenced by an index's `weight_map`
pub fn read_shard_index(index_path: &Path) -> Result<BTreeSet<String>, String> {
    let content = std::fs::read_to_string(index_path).map_err(|e| e.to_string())?;
    let index: serde_json::Value = serde_json::from_str(&content).map_err(|e| e.to_string())?;

    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| "no 'weight_map' object".to_string())?;

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();

    if shards.is_empty() {
        return Err("'weight_map' names no shard files".to_string());
    }
    Ok(shards)
}

/// Resolution state of one shard file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Present,
    Incomplete { size_bytes: u64 },
    Missing,
}

/// Classify a shard entry of a snapshot
///
/// A regular file passes. A symlink passes when its target exists and no
/// `<target>.incomplete` sits next to it. A dangling symlink with such a
/// marker is an interrupted download; anything else is missing.
pub fn shard_state(snapshot: &Path, shard: &str) -> ShardState {
    let path = snapshot.join(shard);
    let Ok(link_meta) = std::fs::symlink_metadata(&path) else {
        return ShardState::Missing;
    };

    if !link_meta.file_type().is_symlink() {
        return if link_meta.is_file() {
            ShardState::Present
        } else {
            ShardState::Missing
        };
    }

    let Ok(target) = std::fs::read_link(&path) else {
        return ShardState::Missing;
    };
    let target = match path.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target,
    };

    if let Ok(marker) = std::fs::metadata(incomplete_marker(&target)) {
        return ShardState::Incomplete {
            size_bytes: marker.len(),
        };
    }

    if std::fs::metadata(&target).is_ok_and(|m| m.is_file()) {
        ShardState::Present
    } else {
        ShardState::Missing
    }
}

/// `<path>.incomplete`
pub fn incomplete_marker(path: &Path) -> PathBuf {
    let mut marker = path.as_os_str().to_os_string();
    marker.push(INCOMPLETE_SUFFIX);
    PathBuf::from(marker)
}

/// Every weight artifact present in a snapshot: single-file weights, or an
/// index manifest plus the shards it names
pub fn weight_artifacts(snapshot: &Path) -> Vec<String> {
    let mut files: Vec<String> = SINGLE_FILE_WEIGHTS
        .iter()
        .filter(|name| snapshot.join(name).exists())
        .map(|name| name.to_string())
        .collect();
    if !files.is_empty() {
        return files;
    }

    for index in shard_indexes(snapshot) {
        if let Ok(shards) = read_shard_index(&snapshot.join(&index)) {
            files.extend(shards);
        }
        files.push(index);
    }
    files
}
