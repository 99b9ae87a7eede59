//! Embedder capability
//!
//! The numeric inference runtime is opaque to this crate. A backend supplies
//! an [`EmbedderFactory`] that turns a [`LoadRequest`] into a device-resident
//! [`Embedder`]; the pool only ever constructs and releases them.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Device a model is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// CUDA when a GPU is detected, CPU otherwise
    #[default]
    Auto,
    Cuda,
    Cpu,
}

impl Device {
    /// Resolve `Auto` against detected hardware
    pub fn resolve(self, has_gpu: bool) -> Self {
        match self {
            Self::Auto if has_gpu => Self::Cuda,
            Self::Auto => Self::Cpu,
            other => other,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cuda => write!(f, "cuda"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Numeric precision of loaded weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Float16,
    Float32,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float16 => write!(f, "float16"),
            Self::Float32 => write!(f, "float32"),
        }
    }
}

/// Where the runtime reads the model from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ModelSource {
    /// A validated local snapshot directory
    Local(PathBuf),
    /// The canonical hub identity; the runtime may download
    Remote(String),
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(id) => write!(f, "{id}"),
        }
    }
}

/// Everything needed to construct one embedder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadRequest {
    /// Hub identity of the model being loaded
    pub model_name: String,
    pub source: ModelSource,
    pub device: Device,
    pub precision: Precision,
    pub truncate_dim: Option<usize>,
    pub trust_remote_code: bool,
    /// Cache root the runtime should download into and read from
    pub cache_dir: PathBuf,
    /// Skip network probing; set only when the local cache was validated
    pub offline: bool,
}

/// A loaded, device-resident model instance
#[async_trait]
pub trait Embedder: Send + Sync + fmt::Debug {
    /// Model identity this instance was built from
    fn model_name(&self) -> &str;

    /// Free device resources. Called exactly once by the pool on eviction.
    async fn release(&self) -> Result<()>;
}

/// Constructs embedders for the pool
#[async_trait]
pub trait EmbedderFactory: Send + Sync {
    async fn create(&self, request: &LoadRequest) -> Result<Arc<dyn Embedder>>;

    /// Return cached device memory to the driver after an eviction
    async fn reclaim_device_memory(&self) {}
}
