//! Static registry of known embedding models
//!
//! Holds the facts the pool needs before anything touches disk: output
//! dimension, optional Matryoshka truncation, whether the model ships custom
//! code (and therefore splits its cache, see [`super::split`]), the routing
//! tables behind each pool variant, and the downgrade chain used when the
//! host lacks VRAM for an oversized variant.

use crate::error::{ModelError, ModelResult};
use serde::Serialize;

/// Model used when nothing else selects one
pub const BUILTIN_DEFAULT_MODEL: &str = "google/embeddinggemma-300m";

/// Static facts about a named model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    /// Hub identity, e.g. "BAAI/bge-m3"
    pub name: &'static str,
    /// Native output dimension
    pub dimension: usize,
    /// Default Matryoshka truncation, if the model is used truncated
    pub truncate_dim: Option<usize>,
    /// Model ships remote code; weights land in the default hub cache
    /// regardless of the configured cache directory
    pub trust_remote_code: bool,
    /// Approximate device memory needed at float16, in GB
    pub vram_gb: f64,
}

impl ModelDescriptor {
    /// Dimension of produced vectors given an optional truncation override
    pub fn effective_dimension(&self, truncate_override: Option<usize>) -> usize {
        truncate_override
            .or(self.truncate_dim)
            .map(|d| d.min(self.dimension))
            .unwrap_or(self.dimension)
    }
}

static MODELS: &[ModelDescriptor] = &[
    ModelDescriptor {
        name: "google/embeddinggemma-300m",
        dimension: 768,
        truncate_dim: None,
        trust_remote_code: false,
        vram_gb: 1.2,
    },
    ModelDescriptor {
        name: "BAAI/bge-m3",
        dimension: 1024,
        truncate_dim: None,
        trust_remote_code: false,
        vram_gb: 2.3,
    },
    ModelDescriptor {
        name: "Alibaba-NLP/gte-modernbert-base",
        dimension: 768,
        truncate_dim: None,
        trust_remote_code: false,
        vram_gb: 0.8,
    },
    ModelDescriptor {
        name: "nomic-ai/CodeRankEmbed",
        dimension: 768,
        truncate_dim: None,
        trust_remote_code: true,
        vram_gb: 1.1,
    },
    ModelDescriptor {
        name: "Qwen/Qwen3-Embedding-0.6B",
        dimension: 1024,
        truncate_dim: None,
        trust_remote_code: false,
        vram_gb: 1.8,
    },
    ModelDescriptor {
        name: "Qwen/Qwen3-Embedding-4B",
        dimension: 2560,
        truncate_dim: Some(1024),
        trust_remote_code: false,
        vram_gb: 8.5,
    },
    ModelDescriptor {
        name: "Qwen/Qwen3-Embedding-8B",
        dimension: 4096,
        truncate_dim: Some(1024),
        trust_remote_code: false,
        vram_gb: 16.5,
    },
];

/// Look up a model by its hub identity
pub fn descriptor(name: &str) -> Option<&'static ModelDescriptor> {
    MODELS.iter().find(|m| m.name == name)
}

/// Look up a model, failing with the list of known names
pub fn require_descriptor(name: &str) -> ModelResult<&'static ModelDescriptor> {
    descriptor(name).ok_or_else(|| ModelError::UnknownModel {
        name: name.to_string(),
        known: known_model_names(),
    })
}

/// All registered model identities, sorted
pub fn known_model_names() -> Vec<String> {
    let mut names: Vec<String> = MODELS.iter().map(|m| m.name.to_string()).collect();
    names.sort();
    names
}

// ============================================================================
// Pool variants
// ============================================================================

/// Named routing table: which model serves which routing key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolVariant {
    pub name: &'static str,
    /// Routing key → model identity; the first entry is the primary key
    pub routes: &'static [(&'static str, &'static str)],
}

impl PoolVariant {
    pub fn primary_key(&self) -> &'static str {
        self.routes[0].0
    }

    pub fn model_for(&self, key: &str) -> Option<&'static str> {
        self.routes
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, model)| *model)
    }
}

pub const FULL_POOL: &str = "full";
pub const LIGHTWEIGHT_SPEED_POOL: &str = "lightweight-speed";

static POOL_VARIANTS: &[PoolVariant] = &[
    PoolVariant {
        name: FULL_POOL,
        routes: &[
            ("qwen3", "Qwen/Qwen3-Embedding-0.6B"),
            ("bge_m3", "BAAI/bge-m3"),
            ("coderankembed", "nomic-ai/CodeRankEmbed"),
        ],
    },
    PoolVariant {
        name: LIGHTWEIGHT_SPEED_POOL,
        routes: &[
            ("gte_modernbert", "Alibaba-NLP/gte-modernbert-base"),
            ("bge_m3", "BAAI/bge-m3"),
        ],
    },
];

pub fn pool_variant(name: &str) -> Option<&'static PoolVariant> {
    POOL_VARIANTS.iter().find(|v| v.name == name)
}

pub fn pool_variant_names() -> Vec<&'static str> {
    POOL_VARIANTS.iter().map(|v| v.name).collect()
}

/// Reranker model for a tier's reranker variant
pub fn reranker_model(variant: &str) -> Option<&'static str> {
    match variant {
        "full" => Some("BAAI/bge-reranker-v2-m3"),
        "lightweight" => Some("cross-encoder/ms-marco-MiniLM-L-6-v2"),
        _ => None,
    }
}

// ============================================================================
// Adaptive downgrade
// ============================================================================

/// Substitute `substitute` for `oversized` when detected VRAM is below `min_vram_gb`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DowngradeRule {
    pub oversized: &'static str,
    pub min_vram_gb: f64,
    pub substitute: &'static str,
}

static DOWNGRADE_RULES: &[DowngradeRule] = &[
    DowngradeRule {
        oversized: "Qwen/Qwen3-Embedding-8B",
        min_vram_gb: 18.0,
        substitute: "Qwen/Qwen3-Embedding-4B",
    },
    DowngradeRule {
        oversized: "Qwen/Qwen3-Embedding-4B",
        min_vram_gb: 10.0,
        substitute: "Qwen/Qwen3-Embedding-0.6B",
    },
];

/// Resolve the model actually loaded for `requested` on a host with `vram_gb`
///
/// Rules chain, so an 8B request on a laptop lands on the 0.6B variant.
pub fn apply_downgrade(requested: &str, vram_gb: f64) -> &str {
    apply_downgrade_with(DOWNGRADE_RULES, requested, vram_gb)
}

fn apply_downgrade_with<'a>(rules: &'a [DowngradeRule], requested: &'a str, vram_gb: f64) -> &'a str {
    let mut current = requested;
    // Bounded by the rule count so a cyclic table cannot spin forever
    for _ in 0..=rules.len() {
        match rules
            .iter()
            .find(|r| r.oversized == current && vram_gb < r.min_vram_gb)
        {
            Some(rule) => current = rule.substitute,
            None => break,
        }
    }
    current
}
