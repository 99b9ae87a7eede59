//! Split cache resolution
//!
//! Models that ship remote code read their config and tokenizer from the
//! configured cache directory, but the hub client fetches their weights into
//! the default hub cache no matter what. The result is one logical model
//! spread over two cache locations. This module detects that shape and links
//! the weights back into the configured snapshot so later loads can run
//! fully offline from a single directory.

use super::cache::canonical_snapshot;
use super::registry::ModelDescriptor;
use super::validator::{check_config, check_tokenizer, check_weights, validate, weight_artifacts};
use crate::error::{ModelError, ModelResult};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Outcome of looking for a usable model across two cache locations
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SplitResolution {
    /// Metadata in the custom location, weights in the default location
    Split {
        custom_snapshot: PathBuf,
        default_snapshot: PathBuf,
    },
    /// No split, but the default location alone holds a complete cache
    DefaultOnly { snapshot: PathBuf, warning: String },
    /// Nothing usable; `detail` says which half is missing
    Unresolved { detail: String },
}

impl SplitResolution {
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Unresolved { .. })
    }

    /// Snapshot a loader should read from
    pub fn load_path(&self) -> Option<&Path> {
        match self {
            Self::Split {
                custom_snapshot, ..
            } => Some(custom_snapshot),
            Self::DefaultOnly { snapshot, .. } => Some(snapshot),
            Self::Unresolved { .. } => None,
        }
    }

    /// Convert an unresolved outcome into the matching error
    pub fn into_error(self, model: &str) -> Option<ModelError> {
        match self {
            Self::Unresolved { detail } => Some(ModelError::SplitCacheIncomplete {
                model: model.to_string(),
                detail,
            }),
            _ => None,
        }
    }
}

/// Canonical snapshot of `location` when it holds config and tokenizer
pub fn has_config(location: &Path) -> Option<PathBuf> {
    let snapshot = canonical_snapshot(location)?.path;
    (check_config(&snapshot).is_ok() && check_tokenizer(&snapshot).is_ok()).then_some(snapshot)
}

/// Canonical snapshot of `location` when its weights resolve
pub fn has_weights(location: &Path) -> Option<PathBuf> {
    let snapshot = canonical_snapshot(location)?.path;
    check_weights(&snapshot).is_ok().then_some(snapshot)
}

fn same_location(a: &Path, b: &Path) -> bool {
    let a = a.canonicalize().unwrap_or_else(|_| a.to_path_buf());
    let b = b.canonicalize().unwrap_or_else(|_| b.to_path_buf());
    a == b
}

/// Look for a usable model across the custom and default cache locations
///
/// A split is only considered for models flagged `trust_remote_code`, and
/// only when both halves are present at the same time in two distinct
/// locations. Independently of that, a fully valid default location is
/// reported as usable with a warning.
pub fn resolve_split(
    descriptor: &ModelDescriptor,
    custom_location: &Path,
    default_location: &Path,
) -> SplitResolution {
    let distinct = !same_location(custom_location, default_location);

    let mut detail = Vec::new();
    if !distinct {
        detail.push("custom and default cache are the same location".to_string());
    } else if descriptor.trust_remote_code {
        let config = has_config(custom_location);
        let weights = has_weights(default_location);
        match (config, weights) {
            (Some(custom_snapshot), Some(default_snapshot)) => {
                tracing::info!(
                    model = descriptor.name,
                    custom = %custom_snapshot.display(),
                    default = %default_snapshot.display(),
                    "Detected split cache"
                );
                return SplitResolution::Split {
                    custom_snapshot,
                    default_snapshot,
                };
            }
            (config, weights) => {
                if config.is_none() {
                    detail.push(format!(
                        "no config+tokenizer at {}",
                        custom_location.display()
                    ));
                }
                if weights.is_none() {
                    detail.push(format!("no weights at {}", default_location.display()));
                }
            }
        }
    } else {
        detail.push("model does not split its cache".to_string());
    }

    if distinct {
        let fallback = validate(default_location);
        if fallback.valid
            && let Some(snapshot) = fallback.snapshot
        {
            let warning = format!(
                "using cache at default location {} instead of {}",
                default_location.display(),
                custom_location.display()
            );
            tracing::warn!(model = descriptor.name, "{warning}");
            return SplitResolution::DefaultOnly { snapshot, warning };
        }
        detail.push(format!(
            "default location {}",
            fallback.verdict()
        ));
    }

    SplitResolution::Unresolved {
        detail: detail.join("; "),
    }
}

/// What `unify` did per weight file
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LinkReport {
    pub linked: Vec<String>,
    pub copied: Vec<String>,
    pub skipped: Vec<String>,
}

#[cfg(unix)]
fn symlink_file(src: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dest)
}

#[cfg(windows)]
fn symlink_file(src: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(src, dest)
}

#[cfg(not(any(unix, windows)))]
fn symlink_file(_src: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks unsupported"))
}

/// Make the custom snapshot self-contained by linking in the weight files of
/// the default snapshot
///
/// Idempotent: destinations that already resolve are skipped. Each file is
/// symlinked, falling back to a full copy when linking fails.
// TODO: try a hardlink before the byte copy; copies duplicate multi-GB weights
pub fn unify(custom_snapshot: &Path, default_snapshot: &Path) -> ModelResult<LinkReport> {
    let mut report = LinkReport::default();

    for name in weight_artifacts(default_snapshot) {
        let dest = custom_snapshot.join(&name);
        if dest.exists() {
            report.skipped.push(name);
            continue;
        }

        let src = default_snapshot.join(&name);
        let src = src.canonicalize().map_err(|e| ModelError::Io {
            path: src.clone(),
            detail: e.to_string(),
        })?;

        // A dangling link from an earlier, since-deleted default cache
        if std::fs::symlink_metadata(&dest).is_ok()
            && let Err(e) = std::fs::remove_file(&dest)
            && e.kind() != io::ErrorKind::NotFound
        {
            return Err(ModelError::Io {
                path: dest,
                detail: e.to_string(),
            });
        }

        match symlink_file(&src, &dest) {
            Ok(()) => {
                tracing::debug!(file = %name, target = %src.display(), "Linked weight file");
                report.linked.push(name);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                report.skipped.push(name);
            }
            Err(e) => {
                tracing::warn!(
                    file = %name,
                    error = %e,
                    "Symlink failed, copying weight file instead"
                );
                match std::fs::copy(&src, &dest) {
                    Ok(bytes) => {
                        tracing::info!(file = %name, bytes, "Copied weight file");
                        report.copied.push(name);
                    }
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        report.skipped.push(name);
                    }
                    Err(e) => {
                        return Err(ModelError::Io {
                            path: dest,
                            detail: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    Ok(report)
}
