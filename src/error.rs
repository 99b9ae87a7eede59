//! Error types for cache validation, model loading and API responses

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias for model loading operations
pub type ModelResult<T> = Result<T, ModelError>;

/// A sharded weight file whose download never finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncompleteShard {
    pub file: String,
    /// Size of the `.incomplete` blob left behind by the interrupted download
    pub size_bytes: u64,
}

impl fmt::Display for IncompleteShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (incomplete download (size {:.1} MB))",
            self.file,
            self.size_bytes as f64 / (1024.0 * 1024.0)
        )
    }
}

/// Why a cache location is unusable
///
/// Variants are checked in declaration order by the validator; the first
/// failing check wins.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CacheProblem {
    #[error("cache location not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("no valid snapshots")]
    NoSnapshots,

    #[error("config.json missing")]
    MissingConfig,

    #[error("config.json is not valid JSON: {detail}")]
    InvalidConfigJson { detail: String },

    #[error("config.json has neither 'model_type' nor 'architectures'")]
    MissingRequiredKeys,

    #[error("no weights found (model.safetensors, pytorch_model.bin or *.index.json)")]
    MissingWeights,

    #[error("shard index {index} is unreadable: {detail}")]
    InvalidShardIndex { index: String, detail: String },

    #[error("missing/broken shard(s): {}", .shards.join(", "))]
    MissingShard { shards: Vec<String> },

    #[error("{}", describe_incomplete(.incomplete, .missing))]
    IncompleteShard {
        incomplete: Vec<IncompleteShard>,
        missing: Vec<String>,
    },

    #[error("no tokenizer files found")]
    MissingTokenizer,
}

fn describe_incomplete(incomplete: &[IncompleteShard], missing: &[String]) -> String {
    let mut parts: Vec<String> = incomplete.iter().map(|s| s.to_string()).collect();
    parts.extend(missing.iter().map(|s| format!("{s} (missing/broken shard)")));
    format!("incomplete shard download(s): {}", parts.join(", "))
}

impl CacheProblem {
    /// Whether the failure is explained by interrupted shard downloads,
    /// which a cleanup of `.incomplete` blobs may repair.
    pub fn implicates_incomplete_download(&self) -> bool {
        matches!(self, Self::IncompleteShard { .. })
    }

    /// Whether the location holds anything at all on disk
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Which construction path was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOrigin {
    /// From files in a local snapshot directory
    Cache,
    /// From the canonical model identity, allowing network access
    Network,
}

impl fmt::Display for LoadOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cache => write!(f, "local cache"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Errors surfaced by the model pool and recovery controller
///
/// Cloneable so that one in-flight load can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("unknown model '{name}' (known models: {})", .known.join(", "))]
    UnknownModel { name: String, known: Vec<String> },

    #[error("unknown model key '{key}' (configured keys: {})", .known.join(", "))]
    UnknownModelKey { key: String, known: Vec<String> },

    #[error("cache for '{model}' is not loadable: {problem}")]
    CacheCorrupt { model: String, problem: CacheProblem },

    #[error("split cache for '{model}' is incomplete: {detail}")]
    SplitCacheIncomplete { model: String, detail: String },

    #[error(
        "model '{model}' does not exist on the remote registry; locally known models: {}",
        .alternatives.join(", ")
    )]
    RemoteIdentityNotFound {
        model: String,
        alternatives: Vec<String>,
    },

    #[error("failed to construct '{model}' from {origin}: {detail}")]
    ConstructionFailed {
        model: String,
        origin: LoadOrigin,
        detail: String,
    },

    #[error(
        "all load strategies failed for '{model}': cache verdict: {cache_verdict}; \
         cache load: {}; network load: {network_error}",
        .cache_error.as_deref().unwrap_or("not attempted")
    )]
    RecoveryExhausted {
        model: String,
        cache_verdict: String,
        cache_error: Option<String>,
        network_error: String,
    },

    #[error(
        "failed to delete corrupt cache at {}: {detail}. Close any other process using \
         this cache (e.g. another server instance) or delete the directory manually, then retry",
        .path.display()
    )]
    DestroyFailed { path: PathBuf, detail: String },

    #[error("filesystem error at {}: {detail}", .path.display())]
    Io { path: PathBuf, detail: String },

    #[error("load task for key '{key}' did not complete: {detail}")]
    TaskFailed { key: String, detail: String },
}

impl ModelError {
    /// Errors caused by caller input rather than the environment
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::UnknownModel { .. } | Self::UnknownModelKey { .. })
    }
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            timestamp: chrono::Utc::now(),
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::UnknownModel { .. } | ModelError::UnknownModelKey { .. } => {
                ApiError::BadRequest(err.to_string())
            }
            ModelError::RemoteIdentityNotFound { .. } => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(anyhow::Error::new(other)),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_shard_display_reports_megabytes() {
        let shard = IncompleteShard {
            file: "model-00002-of-00002.safetensors".to_string(),
            size_bytes: 500 * 1024 * 1024,
        };
        assert_eq!(
            shard.to_string(),
            "model-00002-of-00002.safetensors (incomplete download (size 500.0 MB))"
        );
    }

    #[test]
    fn test_incomplete_problem_lists_every_shard() {
        let problem = CacheProblem::IncompleteShard {
            incomplete: vec![IncompleteShard {
                file: "b.safetensors".to_string(),
                size_bytes: 1024 * 1024,
            }],
            missing: vec!["c.safetensors".to_string()],
        };
        let text = problem.to_string();
        assert!(text.contains("b.safetensors"));
        assert!(text.contains("1.0 MB"));
        assert!(text.contains("c.safetensors (missing/broken shard)"));
        assert!(problem.implicates_incomplete_download());
        assert!(!CacheProblem::MissingConfig.implicates_incomplete_download());
    }

    #[test]
    fn test_destroy_failed_names_path_and_remedy() {
        let err = ModelError::DestroyFailed {
            path: PathBuf::from("/cache/models--org--name"),
            detail: "permission denied".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("/cache/models--org--name"));
        assert!(text.contains("delete the directory manually"));
    }

    #[test]
    fn test_recovery_exhausted_aggregates_all_attempts() {
        let err = ModelError::RecoveryExhausted {
            model: "org/model".to_string(),
            cache_verdict: "valid".to_string(),
            cache_error: Some("bad weights".to_string()),
            network_error: "connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("valid"));
        assert!(text.contains("bad weights"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_caller_errors() {
        let err = ModelError::UnknownModelKey {
            key: "x".to_string(),
            known: vec![],
        };
        assert!(err.is_caller_error());
        let err = ModelError::TaskFailed {
            key: "x".to_string(),
            detail: "panic".to_string(),
        };
        assert!(!err.is_caller_error());
    }

    #[test]
    fn test_problem_serializes_with_code_tag() {
        let json = serde_json::to_value(CacheProblem::MissingRequiredKeys).unwrap();
        assert_eq!(json["code"], "missing_required_keys");
    }
}
