//! Cache recovery and model construction
//!
//! Drives one model from "whatever is on disk" to a constructed embedder:
//!
//! ```text
//! validate ─ valid ──────────────────────────────────────────────► load (offline)
//!    │                                                               │ fails
//!    ├─ split / default-only cache ─────────────────────────────────►┤
//!    │                                                               ▼
//!    ├─ invalid, *.incomplete + incomplete-shard reason ─► cleanup   load (network) ─ fails ─► RecoveryExhausted
//!    │                                      │ still invalid
//!    ├─ invalid ─────────────────────────► destroy ─► preflight ─► load (network) ─► link split
//!    └─ absent ──────────────────────────────────────┘
//! ```
//!
//! Destroy failures are fatal and never retried; every other stage is
//! attempted at most once per load.

use super::cache::{list_cached_models, model_location};
use super::registry::{ModelDescriptor, known_model_names};
use super::remote::{RemoteLookup, RemoteRegistry};
use super::split::{SplitResolution, resolve_split, unify};
use super::validator::{INCOMPLETE_SUFFIX, ValidationResult, validate};
use crate::embedder::{Device, Embedder, EmbedderFactory, LoadRequest, ModelSource, Precision};
use crate::error::{LoadOrigin, ModelError, ModelResult};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The two cache roots a model may live under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRoots {
    /// Configured cache directory
    pub custom: PathBuf,
    /// Default hub cache, where remote-code models fetch their weights
    pub default: PathBuf,
}

/// What to construct
#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub descriptor: &'static ModelDescriptor,
    pub device: Device,
    pub precision: Precision,
    pub truncate_dim: Option<usize>,
    pub trust_remote_code: bool,
}

/// Recovery steps taken during one load, for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    LinkedSplitCache { linked: usize, copied: usize },
    UsedDefaultCache { warning: String },
    CleanedIncomplete { files: usize, bytes: u64 },
    DestroyedCache { path: PathBuf },
    Downloaded,
    NetworkFallback { cache_error: String },
}

impl RecoveryAction {
    /// Short label used as a metrics dimension
    pub fn label(&self) -> &'static str {
        match self {
            Self::LinkedSplitCache { .. } => "linked_split_cache",
            Self::UsedDefaultCache { .. } => "used_default_cache",
            Self::CleanedIncomplete { .. } => "cleaned_incomplete",
            Self::DestroyedCache { .. } => "destroyed_cache",
            Self::Downloaded => "downloaded",
            Self::NetworkFallback { .. } => "network_fallback",
        }
    }
}

/// A constructed embedder and how it was obtained
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub embedder: Arc<dyn Embedder>,
    pub origin: LoadOrigin,
    pub source: ModelSource,
    pub cache_verdict: String,
    pub actions: Vec<RecoveryAction>,
}

/// Result of inspecting and repairing the local caches
struct LocalVerdict {
    snapshot: Option<PathBuf>,
    verdict: String,
}

/// Drives validation, repair, fallback and construction for one model
pub struct RecoveryController {
    roots: CacheRoots,
    verify_remote: bool,
    remote: Arc<dyn RemoteRegistry>,
    factory: Arc<dyn EmbedderFactory>,
}

impl RecoveryController {
    pub fn new(
        roots: CacheRoots,
        remote: Arc<dyn RemoteRegistry>,
        factory: Arc<dyn EmbedderFactory>,
    ) -> Self {
        Self {
            roots,
            verify_remote: true,
            remote,
            factory,
        }
    }

    /// Enable or disable the remote existence check before downloads
    pub fn with_remote_verification(mut self, verify: bool) -> Self {
        self.verify_remote = verify;
        self
    }

    pub fn roots(&self) -> &CacheRoots {
        &self.roots
    }

    pub fn factory(&self) -> &Arc<dyn EmbedderFactory> {
        &self.factory
    }

    /// Validate, repair and construct `plan`'s model
    ///
    /// The offline hint travels with each construction request. Concurrent
    /// loads of other models never see it.
    pub async fn load(&self, plan: &LoadPlan) -> ModelResult<LoadOutcome> {
        let model = plan.descriptor.name;
        let custom = model_location(&self.roots.custom, model);
        let default = model_location(&self.roots.default, model);
        let mut actions = Vec::new();

        let local = self.prepare_local(plan, &custom, &default, &mut actions).await?;

        if let Some(snapshot) = local.snapshot {
            let source = ModelSource::Local(snapshot);
            let cache_error = match self.construct(plan, &source, LoadOrigin::Cache, true).await {
                Ok(embedder) => {
                    return Ok(LoadOutcome {
                        embedder,
                        origin: LoadOrigin::Cache,
                        source,
                        cache_verdict: local.verdict,
                        actions,
                    });
                }
                Err(e) => e,
            };

            tracing::warn!(
                model,
                error = %cache_error,
                "Construction from local cache failed, retrying from network"
            );
            actions.push(RecoveryAction::NetworkFallback {
                cache_error: cache_error.to_string(),
            });

            let source = ModelSource::Remote(model.to_string());
            return match self.construct(plan, &source, LoadOrigin::Network, false).await {
                Ok(embedder) => Ok(LoadOutcome {
                    embedder,
                    origin: LoadOrigin::Network,
                    source,
                    cache_verdict: local.verdict,
                    actions,
                }),
                Err(network_error) => Err(ModelError::RecoveryExhausted {
                    model: model.to_string(),
                    cache_verdict: local.verdict,
                    cache_error: Some(cache_error.to_string()),
                    network_error: network_error.to_string(),
                }),
            };
        }

        // Fetch path: no usable local cache
        self.preflight(model).await?;

        tracing::info!(model, verdict = %local.verdict, "Loading model from network");
        let source = ModelSource::Remote(model.to_string());
        match self.construct(plan, &source, LoadOrigin::Network, false).await {
            Ok(embedder) => {
                actions.push(RecoveryAction::Downloaded);
                if let Some(action) = self.link_after_download(plan, &custom, &default).await {
                    actions.push(action);
                }
                Ok(LoadOutcome {
                    embedder,
                    origin: LoadOrigin::Network,
                    source,
                    cache_verdict: local.verdict,
                    actions,
                })
            }
            Err(network_error) => Err(ModelError::RecoveryExhausted {
                model: model.to_string(),
                cache_verdict: local.verdict,
                cache_error: None,
                network_error: network_error.to_string(),
            }),
        }
    }

    /// Find a loadable local snapshot, repairing or discarding the custom cache
    async fn prepare_local(
        &self,
        plan: &LoadPlan,
        custom: &Path,
        default: &Path,
        actions: &mut Vec<RecoveryAction>,
    ) -> ModelResult<LocalVerdict> {
        let model = plan.descriptor.name;
        let result = blocking(custom, {
            let custom = custom.to_path_buf();
            move || validate(&custom)
        })
        .await?;

        if result.valid {
            return Ok(LocalVerdict {
                verdict: result.verdict(),
                snapshot: result.snapshot,
            });
        }

        let descriptor = plan.descriptor;
        let resolution = blocking(custom, {
            let (custom, default) = (custom.to_path_buf(), default.to_path_buf());
            move || resolve_split(descriptor, &custom, &default)
        })
        .await?;

        match resolution {
            SplitResolution::Split {
                custom_snapshot,
                default_snapshot,
            } => {
                let linked = blocking(custom, {
                    let (c, d) = (custom_snapshot.clone(), default_snapshot.clone());
                    move || unify(&c, &d)
                })
                .await?;
                match linked {
                    Ok(report) => {
                        actions.push(RecoveryAction::LinkedSplitCache {
                            linked: report.linked.len(),
                            copied: report.copied.len(),
                        });
                        return Ok(LocalVerdict {
                            snapshot: Some(custom_snapshot),
                            verdict: "valid (split cache)".to_string(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(model, error = %e, "Failed to unify split cache");
                    }
                }
            }
            SplitResolution::DefaultOnly { snapshot, warning } => {
                actions.push(RecoveryAction::UsedDefaultCache { warning });
                return Ok(LocalVerdict {
                    snapshot: Some(snapshot),
                    verdict: "valid (default location)".to_string(),
                });
            }
            SplitResolution::Unresolved { detail } => {
                tracing::debug!(model, detail = %detail, "No split or default cache available");
            }
        }

        if !result.location_exists() {
            return Ok(LocalVerdict {
                snapshot: None,
                verdict: result.verdict(),
            });
        }

        self.repair(model, custom, result, actions).await
    }

    /// Diagnose → cleanup → destroy for a cache present on disk but invalid
    async fn repair(
        &self,
        model: &str,
        location: &Path,
        result: ValidationResult,
        actions: &mut Vec<RecoveryAction>,
    ) -> ModelResult<LocalVerdict> {
        let verdict = result.verdict();
        tracing::warn!(model, path = %location.display(), verdict = %verdict, "Cache is invalid");

        let incomplete = blocking(location, {
            let location = location.to_path_buf();
            move || find_incomplete_blobs(&location)
        })
        .await?;

        let implicates = result
            .reason
            .as_ref()
            .is_some_and(|r| r.implicates_incomplete_download());

        if !incomplete.is_empty() && implicates {
            let (files, bytes) = blocking(location, move || remove_files(&incomplete)).await?;
            tracing::info!(
                model,
                files,
                reclaimed_mb = bytes / (1024 * 1024),
                "Removed incomplete downloads"
            );
            actions.push(RecoveryAction::CleanedIncomplete { files, bytes });

            let revalidated = blocking(location, {
                let location = location.to_path_buf();
                move || validate(&location)
            })
            .await?;
            if revalidated.valid {
                return Ok(LocalVerdict {
                    snapshot: revalidated.snapshot,
                    verdict: format!("{verdict}, valid after cleanup"),
                });
            }
        }

        blocking(location, {
            let location = location.to_path_buf();
            move || destroy_cache(&location)
        })
        .await??;
        actions.push(RecoveryAction::DestroyedCache {
            path: location.to_path_buf(),
        });

        Ok(LocalVerdict {
            snapshot: None,
            verdict: format!("{verdict}, cache deleted"),
        })
    }

    /// Optional remote existence check before a full download
    async fn preflight(&self, model: &str) -> ModelResult<()> {
        if !self.verify_remote {
            return Ok(());
        }

        match self.remote.exists(model).await {
            Ok(RemoteLookup::Found { info }) => {
                tracing::debug!(model, info = %info, "Model confirmed on remote registry");
                Ok(())
            }
            Ok(RemoteLookup::NotFound) => Err(ModelError::RemoteIdentityNotFound {
                model: model.to_string(),
                alternatives: self.local_alternatives(),
            }),
            Err(e) => {
                tracing::warn!(model, error = %e, "Remote registry unavailable, skipping check");
                Ok(())
            }
        }
    }

    /// Registered models plus whatever is cached locally
    fn local_alternatives(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = known_model_names().into_iter().collect();
        names.extend(list_cached_models(&self.roots.custom));
        names.extend(list_cached_models(&self.roots.default));
        names.into_iter().collect()
    }

    async fn construct(
        &self,
        plan: &LoadPlan,
        source: &ModelSource,
        origin: LoadOrigin,
        offline: bool,
    ) -> ModelResult<Arc<dyn Embedder>> {
        let request = LoadRequest {
            model_name: plan.descriptor.name.to_string(),
            source: source.clone(),
            device: plan.device,
            precision: plan.precision,
            truncate_dim: plan.truncate_dim,
            trust_remote_code: plan.trust_remote_code,
            cache_dir: self.roots.custom.clone(),
            offline,
        };

        tracing::info!(
            model = %request.model_name,
            source = %request.source,
            device = %request.device,
            precision = %request.precision,
            offline = request.offline,
            "Constructing embedder"
        );

        self.factory
            .create(&request)
            .await
            .map_err(|e| ModelError::ConstructionFailed {
                model: request.model_name.clone(),
                origin,
                detail: format!("{e:#}"),
            })
    }

    /// After a fresh download, link a remote-code model's weights into the
    /// custom snapshot so the next load can run offline
    async fn link_after_download(
        &self,
        plan: &LoadPlan,
        custom: &Path,
        default: &Path,
    ) -> Option<RecoveryAction> {
        if !plan.descriptor.trust_remote_code {
            return None;
        }

        let descriptor = plan.descriptor;
        let linked = blocking(custom, {
            let (custom, default) = (custom.to_path_buf(), default.to_path_buf());
            move || match resolve_split(descriptor, &custom, &default) {
                SplitResolution::Split {
                    custom_snapshot,
                    default_snapshot,
                } => Some(unify(&custom_snapshot, &default_snapshot)),
                _ => None,
            }
        })
        .await;

        match linked {
            Ok(Some(Ok(report))) => Some(RecoveryAction::LinkedSplitCache {
                linked: report.linked.len(),
                copied: report.copied.len(),
            }),
            Ok(Some(Err(e))) | Err(e) => {
                tracing::warn!(model = descriptor.name, error = %e, "Failed to link split cache after download");
                None
            }
            Ok(None) => None,
        }
    }
}

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(path: &Path, f: F) -> ModelResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ModelError::Io {
            path: path.to_path_buf(),
            detail: format!("filesystem task failed: {e}"),
        })
}

/// `*.incomplete` files under `<location>/blobs` with their sizes
pub fn find_incomplete_blobs(location: &Path) -> Vec<(PathBuf, u64)> {
    let Ok(entries) = std::fs::read_dir(location.join("blobs")) else {
        return Vec::new();
    };

    let mut found: Vec<(PathBuf, u64)> = entries
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(INCOMPLETE_SUFFIX))
        .map(|e| {
            let size = e.metadata().map(|m| m.len()).unwrap_or(0);
            (e.path(), size)
        })
        .collect();
    found.sort();
    found
}

/// Delete files, tolerating ones already gone; returns (count, bytes) removed
fn remove_files(files: &[(PathBuf, u64)]) -> (usize, u64) {
    let mut count = 0;
    let mut bytes = 0;
    for (path, size) in files {
        match std::fs::remove_file(path) {
            Ok(()) => {
                count += 1;
                bytes += size;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove incomplete blob");
            }
        }
    }
    (count, bytes)
}

/// Recursively delete a cache location
///
/// A location already gone counts as success. Any other failure is fatal
/// and names the path, since it needs a human to intervene.
pub fn destroy_cache(location: &Path) -> ModelResult<()> {
    tracing::warn!(path = %location.display(), "Deleting corrupt cache");
    match std::fs::remove_dir_all(location) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ModelError::DestroyFailed {
            path: location.to_path_buf(),
            detail: e.to_string(),
        }),
    }
}
