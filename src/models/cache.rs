//! HuggingFace cache layout utilities
//!
//! Resolves cache locations and snapshots for a model. The layout is the
//! upstream hub convention and must stay bit-exact to interoperate with
//! caches written by other tools:
//! ```text
//! <root>/
//! ├── models--BAAI--bge-m3/
//! │   ├── blobs/
//! │   │   ├── {sha256}
//! │   │   └── {sha256}.incomplete
//! │   ├── snapshots/
//! │   │   └── {revision}/
//! │   │       ├── config.json        -> ../../blobs/{sha256}
//! │   │       ├── model.safetensors  -> ../../blobs/{sha256}
//! │   │       └── tokenizer.json     -> ../../blobs/{sha256}
//! │   └── refs/
//! │       └── main
//! └── models--nomic-ai--CodeRankEmbed/
//!     └── ...
//! ```

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Get the default HuggingFace hub cache directory
///
/// Checks in order:
/// 1. `$HF_HOME/hub`
/// 2. `$XDG_CACHE_HOME/huggingface/hub`
/// 3. `~/.cache/huggingface/hub`
pub fn get_cache_dir() -> PathBuf {
    if let Ok(hf_home) = std::env::var("HF_HOME") {
        return PathBuf::from(hf_home).join("hub");
    }

    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("huggingface/hub");
    }

    dirs::home_dir()
        .map(|h| h.join(".cache/huggingface/hub"))
        .unwrap_or_else(|| PathBuf::from("/tmp/huggingface/hub"))
}

/// Convert model ID to cache directory name
///
/// HuggingFace uses `models--{org}--{name}` format
/// e.g., "BAAI/bge-m3" -> "models--BAAI--bge-m3"
pub fn model_id_to_cache_name(model_id: &str) -> String {
    format!("models--{}", model_id.replace('/', "--"))
}

/// Convert cache directory name back to model ID
///
/// e.g., "models--BAAI--bge-m3" -> "BAAI/bge-m3"
pub fn cache_name_to_model_id(cache_name: &str) -> Option<String> {
    cache_name
        .strip_prefix("models--")
        .map(|s| s.replacen("--", "/", 1))
}

/// Cache location of `model_id` under `root`
pub fn model_location(root: &Path, model_id: &str) -> PathBuf {
    root.join(model_id_to_cache_name(model_id))
}

/// One versioned set of a model's artifact files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// List non-empty snapshot directories of a cache location
///
/// Empty snapshot directories are left behind by interrupted downloads and
/// never count.
pub fn list_snapshots(location: &Path) -> Vec<Snapshot> {
    let Ok(entries) = std::fs::read_dir(location.join("snapshots")) else {
        return Vec::new();
    };

    let mut snapshots = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || is_empty_dir(&path) {
            continue;
        }
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        snapshots.push(Snapshot { path, modified });
    }
    snapshots
}

/// Select the canonical snapshot: latest modification time, ties broken by
/// the greatest directory name so the choice never depends on listing order
pub fn canonical_snapshot(location: &Path) -> Option<Snapshot> {
    list_snapshots(location)
        .into_iter()
        .max_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)))
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

/// Check if a model has at least one non-empty snapshot under `root`
pub fn is_model_cached(root: &Path, model_id: &str) -> bool {
    !list_snapshots(&model_location(root, model_id)).is_empty()
}

/// Get the total size of a cached model in bytes
pub fn get_cache_size(root: &Path, model_id: &str) -> Option<u64> {
    let model_dir = model_location(root, model_id);

    if !model_dir.exists() {
        return None;
    }

    Some(dir_size(&model_dir))
}

/// Recursively calculate directory size
///
/// Symlinks are not followed; snapshot links point into `blobs/`, which is
/// counted directly.
pub fn dir_size(path: &Path) -> u64 {
    let mut size = 0;

    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                size += dir_size(&path);
            } else if file_type.is_file()
                && let Ok(metadata) = entry.metadata()
            {
                size += metadata.len();
            }
        }
    }

    size
}

/// List all cached models under `root`
///
/// Returns model IDs for every location holding at least one non-empty
/// snapshot.
pub fn list_cached_models(root: &Path) -> Vec<String> {
    let mut models = Vec::new();

    if let Ok(entries) = std::fs::read_dir(root) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();

            if let Some(model_id) = cache_name_to_model_id(&name)
                && is_model_cached(root, &model_id)
            {
                models.push(model_id);
            }
        }
    }

    models.sort();
    models
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};
    use std::time::Duration;

    fn touch_dir(path: &Path, secs: u64) {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        File::open(path)
            .unwrap()
            .set_times(FileTimes::new().set_modified(time))
            .unwrap();
    }

    #[test]
    fn test_model_id_to_cache_name() {
        assert_eq!(model_id_to_cache_name("BAAI/bge-m3"), "models--BAAI--bge-m3");
        assert_eq!(
            model_id_to_cache_name("nomic-ai/CodeRankEmbed"),
            "models--nomic-ai--CodeRankEmbed"
        );
    }

    #[test]
    fn test_cache_name_to_model_id() {
        assert_eq!(
            cache_name_to_model_id("models--BAAI--bge-m3"),
            Some("BAAI/bge-m3".to_string())
        );
        assert_eq!(
            cache_name_to_model_id("models--Qwen--Qwen3-Embedding-0.6B"),
            Some("Qwen/Qwen3-Embedding-0.6B".to_string())
        );
        assert_eq!(cache_name_to_model_id("not-a-model"), None);
    }

    #[test]
    fn test_empty_snapshots_are_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let location = temp_dir.path().join("models--org--m");
        std::fs::create_dir_all(location.join("snapshots/empty")).unwrap();
        assert!(list_snapshots(&location).is_empty());
        assert!(canonical_snapshot(&location).is_none());

        std::fs::create_dir_all(location.join("snapshots/full")).unwrap();
        std::fs::write(location.join("snapshots/full/config.json"), "{}").unwrap();
        let snapshot = canonical_snapshot(&location).unwrap();
        assert!(snapshot.path.ends_with("full"));
    }

    #[test]
    fn test_canonical_snapshot_is_latest_mtime() {
        let temp_dir = tempfile::tempdir().unwrap();
        let location = temp_dir.path().join("models--org--m");
        for name in ["aaa", "zzz"] {
            let dir = location.join("snapshots").join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("config.json"), "{}").unwrap();
        }
        // "aaa" sorts first by name but is newer
        touch_dir(&location.join("snapshots/aaa"), 2_000_000);
        touch_dir(&location.join("snapshots/zzz"), 1_000_000);

        let snapshot = canonical_snapshot(&location).unwrap();
        assert!(snapshot.path.ends_with("aaa"));
    }

    #[test]
    fn test_missing_location_has_no_snapshots() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(list_snapshots(&temp_dir.path().join("models--x--y")).is_empty());
    }

    #[test]
    fn test_list_cached_models() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();

        let snap = model_location(root, "org/b").join("snapshots/rev");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("config.json"), "{}").unwrap();

        let snap = model_location(root, "org/a").join("snapshots/rev");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("config.json"), "{}").unwrap();

        // Only an empty snapshot: not cached
        std::fs::create_dir_all(model_location(root, "org/c").join("snapshots/rev")).unwrap();
        std::fs::create_dir_all(root.join("not-a-model")).unwrap();

        assert_eq!(list_cached_models(root), vec!["org/a", "org/b"]);
        assert!(is_model_cached(root, "org/a"));
        assert!(!is_model_cached(root, "org/c"));
    }

    #[test]
    fn test_dir_size_empty_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert_eq!(dir_size(temp_dir.path()), 0);
    }

    #[test]
    fn test_dir_size_nested_dirs() {
        let temp_dir = tempfile::tempdir().unwrap();

        let subdir = temp_dir.path().join("subdir");
        std::fs::create_dir(&subdir).unwrap();
        std::fs::write(subdir.join("file1.txt"), "abc").unwrap();
        std::fs::write(temp_dir.path().join("file2.txt"), "defgh").unwrap();

        assert_eq!(dir_size(temp_dir.path()), 8);
    }

    #[test]
    fn test_get_cache_size() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(get_cache_size(temp_dir.path(), "org/none").is_none());

        let blobs = model_location(temp_dir.path(), "org/m").join("blobs");
        std::fs::create_dir_all(&blobs).unwrap();
        std::fs::write(blobs.join("abc"), "hello world").unwrap();
        assert_eq!(get_cache_size(temp_dir.path(), "org/m"), Some(11));
    }
}
