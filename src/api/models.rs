//! API request and response models

use crate::config::PoolConfig;
use crate::embedder::{Device, ModelSource, Precision};
use crate::error::{CacheProblem, LoadOrigin};
use crate::gpu::Tier;
use crate::models::recovery::RecoveryAction;
use crate::models::split::SplitResolution;
use crate::models::validator::ValidationResult;
use crate::pool::ModelHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Detected hardware tier
#[derive(Debug, Serialize)]
pub struct TierResponse {
    #[serde(flatten)]
    pub tier: Tier,
    pub reranker_model: Option<&'static str>,
}

/// Optional explicit model for a load request
#[derive(Debug, Default, Deserialize)]
pub struct LoadParams {
    #[serde(default)]
    pub model: Option<String>,
}

/// One loaded handle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleInfo {
    pub key: String,
    pub requested_model: String,
    pub model_name: String,
    pub dimension: usize,
    pub device: Device,
    pub precision: Precision,
    pub truncate_dim: Option<usize>,
    pub memory_delta_mb: Option<f64>,
    pub origin: LoadOrigin,
    pub source: String,
    pub local: bool,
    pub cache_verdict: String,
    pub recovery: Vec<String>,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

impl From<&ModelHandle> for HandleInfo {
    fn from(handle: &ModelHandle) -> Self {
        Self {
            key: handle.key.clone(),
            requested_model: handle.requested_model.clone(),
            model_name: handle.model_name.clone(),
            dimension: handle.dimension,
            device: handle.device,
            precision: handle.precision,
            truncate_dim: handle.truncate_dim,
            memory_delta_mb: handle.memory_delta_mb,
            origin: handle.origin,
            source: handle.source.to_string(),
            local: matches!(handle.source, ModelSource::Local(_)),
            cache_verdict: handle.cache_verdict.clone(),
            recovery: handle.recovery.iter().map(RecoveryAction::label).map(String::from).collect(),
            loaded_at: handle.loaded_at,
        }
    }
}

/// Routing table and loaded handles
#[derive(Debug, Serialize, Deserialize)]
pub struct PoolStatus {
    pub multi_model: bool,
    pub default_model: String,
    pub variant: Option<String>,
    pub routes: BTreeMap<String, String>,
    pub handles: Vec<HandleInfo>,
}

impl PoolStatus {
    pub fn new(config: &PoolConfig, handles: Vec<HandleInfo>) -> Self {
        Self {
            multi_model: config.multi_model,
            default_model: config.default_model.clone(),
            variant: config.variant.map(String::from),
            routes: config.routes.clone(),
            handles,
        }
    }
}

/// Validation of one cache location
#[derive(Debug, Serialize)]
pub struct LocationReport {
    pub path: PathBuf,
    pub valid: bool,
    pub reason: Option<String>,
    pub problem: Option<CacheProblem>,
    pub snapshot: Option<PathBuf>,
    pub size_bytes: Option<u64>,
}

impl LocationReport {
    pub fn new(path: PathBuf, result: ValidationResult, size_bytes: Option<u64>) -> Self {
        Self {
            path,
            valid: result.valid,
            reason: result.reason.as_ref().map(|r| r.to_string()),
            problem: result.reason,
            snapshot: result.snapshot,
            size_bytes,
        }
    }
}

/// Cache status of one model across both roots
#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub model: String,
    pub custom: LocationReport,
    pub default: LocationReport,
    /// Split-cache resolution, for models that ship remote code
    pub split: Option<SplitResolution>,
}
