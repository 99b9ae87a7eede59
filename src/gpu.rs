//! GPU capability detection and hardware tiers
//!
//! Detects total device memory via nvidia-smi and maps it onto a static tier
//! table. A host without a GPU, or without nvidia-smi, is treated as having
//! 0 GB of VRAM rather than as an error.

use serde::Serialize;
use std::process::Command;
use std::sync::{Arc, OnceLock};

/// A VRAM bracket's recommended configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tier {
    pub name: &'static str,
    /// Inclusive lower bound in GB
    pub min_vram_gb: f64,
    /// Exclusive upper bound in GB, `None` for unbounded
    pub max_vram_gb: Option<f64>,
    pub recommended_model: &'static str,
    pub multi_model_enabled: bool,
    pub reranking_enabled: bool,
    pub pool_variant: Option<&'static str>,
    pub reranker_variant: Option<&'static str>,
    /// VRAM actually detected when this tier was selected
    pub detected_vram_gb: f64,
}

impl Tier {
    fn contains(&self, vram_gb: f64) -> bool {
        vram_gb >= self.min_vram_gb && self.max_vram_gb.is_none_or(|max| vram_gb < max)
    }
}

static TIERS: &[Tier] = &[
    Tier {
        name: "minimal",
        min_vram_gb: 0.0,
        max_vram_gb: Some(6.0),
        recommended_model: "google/embeddinggemma-300m",
        multi_model_enabled: false,
        reranking_enabled: false,
        pool_variant: None,
        reranker_variant: None,
        detected_vram_gb: 0.0,
    },
    Tier {
        name: "laptop",
        min_vram_gb: 6.0,
        max_vram_gb: Some(10.0),
        recommended_model: "google/embeddinggemma-300m",
        multi_model_enabled: true,
        reranking_enabled: true,
        pool_variant: Some("lightweight-speed"),
        reranker_variant: Some("lightweight"),
        detected_vram_gb: 0.0,
    },
    Tier {
        name: "desktop",
        min_vram_gb: 10.0,
        max_vram_gb: Some(18.0),
        recommended_model: "Qwen/Qwen3-Embedding-0.6B",
        multi_model_enabled: true,
        reranking_enabled: true,
        pool_variant: Some("full"),
        reranker_variant: Some("full"),
        detected_vram_gb: 0.0,
    },
    Tier {
        name: "workstation",
        min_vram_gb: 18.0,
        max_vram_gb: None,
        recommended_model: "Qwen/Qwen3-Embedding-4B",
        multi_model_enabled: true,
        reranking_enabled: true,
        pool_variant: Some("full"),
        reranker_variant: Some("full"),
        detected_vram_gb: 0.0,
    },
];

/// The static tier table, lowest first
pub fn tiers() -> &'static [Tier] {
    TIERS
}

/// Map a VRAM amount onto the tier table
///
/// Negative and NaN readings count as 0 GB. Falls back to the lowest tier
/// if no range matches.
pub fn tier_for_vram(vram_gb: f64) -> Tier {
    let vram_gb = if vram_gb.is_finite() && vram_gb > 0.0 {
        vram_gb
    } else {
        0.0
    };
    let tier = TIERS
        .iter()
        .find(|t| t.contains(vram_gb))
        .unwrap_or(&TIERS[0]);
    Tier {
        detected_vram_gb: vram_gb,
        ..tier.clone()
    }
}

// ============================================================================
// Capability query
// ============================================================================

/// Device memory capability query
pub trait VramProbe: Send + Sync {
    /// Total memory of the primary device in GB, `None` when no device or
    /// no query mechanism is available
    fn total_vram_gb(&self) -> Option<f64>;

    /// Memory currently in use on the primary device in MB
    fn used_vram_mb(&self) -> Option<f64>;
}

/// Probe backed by nvidia-smi
#[derive(Debug, Clone, Default)]
pub struct NvidiaSmiProbe;

impl NvidiaSmiProbe {
    /// Query one numeric column for GPU 0, in MiB
    fn query_mib(field: &str) -> Option<f64> {
        let output = Command::new("nvidia-smi")
            .arg(format!("--query-gpu={field}"))
            .arg("--format=csv,noheader,nounits")
            .output();

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                parse_first_mib(&stdout)
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(
                    stderr = %stderr,
                    "nvidia-smi failed, assuming no GPU available"
                );
                None
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    "Failed to run nvidia-smi, assuming no GPU available"
                );
                None
            }
        }
    }
}

impl VramProbe for NvidiaSmiProbe {
    fn total_vram_gb(&self) -> Option<f64> {
        Self::query_mib("memory.total").map(|mib| mib / 1024.0)
    }

    fn used_vram_mb(&self) -> Option<f64> {
        Self::query_mib("memory.used")
    }
}

/// First parseable line of nvidia-smi csv output
fn parse_first_mib(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .find_map(|line| line.trim().parse::<f64>().ok())
}

/// Probe returning a fixed reading, for hosts configured by hand and tests
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub total_gb: Option<f64>,
}

impl VramProbe for StaticProbe {
    fn total_vram_gb(&self) -> Option<f64> {
        self.total_gb
    }

    fn used_vram_mb(&self) -> Option<f64> {
        None
    }
}

// ============================================================================
// Tier detection
// ============================================================================

/// Detects the hardware tier once and memoizes it
pub struct HardwareTierDetector {
    probe: Arc<dyn VramProbe>,
    tier: OnceLock<Tier>,
}

impl HardwareTierDetector {
    pub fn new(probe: Arc<dyn VramProbe>) -> Self {
        Self {
            probe,
            tier: OnceLock::new(),
        }
    }

    /// Detect the tier on first call; later calls return the memoized value
    pub fn detect_tier(&self) -> &Tier {
        self.tier.get_or_init(|| detect_with(self.probe.as_ref()))
    }

    pub fn probe(&self) -> &Arc<dyn VramProbe> {
        &self.probe
    }

    /// Whether the probe sees a device at all
    pub fn has_device(&self) -> bool {
        self.detect_tier().detected_vram_gb > 0.0
    }
}

impl Default for HardwareTierDetector {
    fn default() -> Self {
        Self::new(Arc::new(NvidiaSmiProbe))
    }
}

fn detect_with(probe: &dyn VramProbe) -> Tier {
    let vram_gb = probe.total_vram_gb().unwrap_or(0.0);
    let tier = tier_for_vram(vram_gb);

    tracing::info!(
        tier = tier.name,
        vram_gb = tier.detected_vram_gb,
        multi_model = tier.multi_model_enabled,
        pool_variant = ?tier.pool_variant,
        "Detected hardware tier"
    );

    tier
}
