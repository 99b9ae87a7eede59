//! Model cache management
//!
//! Provides functionality for:
//! - Resolving HuggingFace cache locations and snapshots
//! - Validating cached snapshots (config, weights, tokenizer)
//! - Resolving caches split between a custom and the default root
//! - Recovering corrupt caches and constructing embedders
//! - Checking and downloading models from HuggingFace Hub
//! - Running text-embeddings-router processes as embedders

pub mod cache;
pub mod loader;
pub mod recovery;
pub mod registry;
pub mod remote;
pub mod split;
pub mod validator;

pub use cache::{get_cache_dir, get_cache_size, is_model_cached, list_cached_models, model_location};
pub use loader::{LoaderConfig, TeiEmbedder, TeiEmbedderFactory};
pub use recovery::{CacheRoots, LoadOutcome, LoadPlan, RecoveryAction, RecoveryController};
pub use registry::{ModelDescriptor, descriptor};
pub use remote::{HubRegistry, RemoteLookup, RemoteRegistry};
pub use split::{SplitResolution, resolve_split, unify};
pub use validator::{ValidationResult, validate, validate_model};
