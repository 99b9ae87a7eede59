//! embed-pool - Embedding model cache validation, recovery and model pool
//!
//! Decides whether a cached model is safe to load, repairs or discards it
//! when it is not, maps host VRAM to a model configuration, and shares
//! lazily loaded model handles between concurrent callers.

pub mod api;
pub mod config;
pub mod embedder;
pub mod error;
pub mod gpu;
pub mod metrics;
pub mod models;
pub mod pool;

pub use config::{PoolConfig, ServiceConfig, UserSettings};
pub use embedder::{Embedder, EmbedderFactory, LoadRequest};
pub use error::{CacheProblem, ModelError, ModelResult};
pub use gpu::{HardwareTierDetector, Tier};
pub use pool::{ClearReport, ModelHandle, ModelPool};
