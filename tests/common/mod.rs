//! Shared fixtures for integration tests
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use embed_pool::config::{EnvOverrides, UserSettings, resolve_pool_config};
use embed_pool::embedder::{Device, Embedder, EmbedderFactory, LoadRequest, Precision};
use embed_pool::gpu::{HardwareTierDetector, StaticProbe, tier_for_vram};
use embed_pool::models::cache::model_location;
use embed_pool::models::{CacheRoots, RecoveryController, RemoteLookup, RemoteRegistry};
use embed_pool::pool::{ModelPool, PoolOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Cache fixtures
// =============================================================================

/// Create `<root>/models--org--name/snapshots/<rev>` and return it
pub fn snapshot_dir(root: &Path, model: &str, rev: &str) -> PathBuf {
    let snapshot = model_location(root, model).join("snapshots").join(rev);
    std::fs::create_dir_all(&snapshot).unwrap();
    snapshot
}

pub fn write_config(snapshot: &Path, json: &str) {
    std::fs::write(snapshot.join("config.json"), json).unwrap();
}

pub fn write_tokenizer(snapshot: &Path) {
    std::fs::write(snapshot.join("tokenizer.json"), "{}").unwrap();
}

pub fn write_weights(snapshot: &Path) {
    std::fs::write(snapshot.join("model.safetensors"), vec![0u8; 64]).unwrap();
}

/// Complete single-file cache for `model` under `root`
pub fn write_valid_cache(root: &Path, model: &str) -> PathBuf {
    let snapshot = snapshot_dir(root, model, "main");
    write_config(&snapshot, r#"{"model_type":"bert"}"#);
    write_tokenizer(&snapshot);
    write_weights(&snapshot);
    snapshot
}

/// Cache roots inside a temp dir
pub fn roots(temp: &TempDir) -> CacheRoots {
    CacheRoots {
        custom: temp.path().join("custom"),
        default: temp.path().join("default"),
    }
}

// =============================================================================
// Embedder mocks
// =============================================================================

#[derive(Debug)]
pub struct MockEmbedder {
    pub model: String,
    pub releases: Arc<AtomicUsize>,
    pub fail_release: bool,
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            anyhow::bail!("device busy");
        }
        Ok(())
    }
}

/// Files a network construction leaves behind, as a real download would
pub type DownloadHook = Box<dyn Fn(&LoadRequest) + Send + Sync>;

/// Factory recording every request
#[derive(Default)]
pub struct MockFactory {
    pub requests: Mutex<Vec<LoadRequest>>,
    pub releases: Arc<AtomicUsize>,
    pub reclaims: AtomicUsize,
    pub delay: Duration,
    /// Models whose construction always fails
    pub failing: Vec<&'static str>,
    /// Models whose release fails
    pub failing_release: Vec<&'static str>,
    /// Fail every construction from a local path
    pub fail_local: bool,
    /// Runs on every successful construction from a model identity
    pub on_download: Option<DownloadHook>,
}

impl MockFactory {
    pub fn constructions(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LoadRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmbedderFactory for MockFactory {
    async fn create(&self, request: &LoadRequest) -> Result<Arc<dyn Embedder>> {
        self.requests.lock().unwrap().push(request.clone());
        tokio::time::sleep(self.delay).await;

        let local = matches!(request.source, embed_pool::embedder::ModelSource::Local(_));
        if self.failing.contains(&request.model_name.as_str()) || (local && self.fail_local) {
            anyhow::bail!("construction of {} failed", request.model_name);
        }

        if !local && let Some(hook) = &self.on_download {
            hook(request);
        }

        Ok(Arc::new(MockEmbedder {
            model: request.model_name.clone(),
            releases: Arc::clone(&self.releases),
            fail_release: self.failing_release.contains(&request.model_name.as_str()),
        }))
    }

    async fn reclaim_device_memory(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

/// Registry with a fixed answer; `None` simulates an unreachable registry
pub struct StubRegistry(pub Option<RemoteLookup>);

#[async_trait]
impl RemoteRegistry for StubRegistry {
    async fn exists(&self, _model_id: &str) -> Result<RemoteLookup> {
        self.0
            .clone()
            .ok_or_else(|| anyhow::anyhow!("registry unreachable"))
    }
}

/// Registry that answers `Found` after a delay
pub struct SlowRegistry(pub Duration);

#[async_trait]
impl RemoteRegistry for SlowRegistry {
    async fn exists(&self, model_id: &str) -> Result<RemoteLookup> {
        tokio::time::sleep(self.0).await;
        Ok(RemoteLookup::Found {
            info: model_id.to_string(),
        })
    }
}

pub fn recovery(temp: &TempDir, factory: Arc<MockFactory>) -> RecoveryController {
    RecoveryController::new(roots(temp), Arc::new(StubRegistry(None)), factory)
}

/// Pool over temp cache roots on a host with `vram_gb` of device memory
pub fn test_pool(temp: &TempDir, factory: Arc<MockFactory>, vram_gb: f64) -> ModelPool {
    test_pool_with_registry(temp, factory, vram_gb, Arc::new(StubRegistry(None)))
}

pub fn test_pool_with_registry(
    temp: &TempDir,
    factory: Arc<MockFactory>,
    vram_gb: f64,
    registry: Arc<dyn RemoteRegistry>,
) -> ModelPool {
    let detector = Arc::new(HardwareTierDetector::new(Arc::new(StaticProbe {
        total_gb: Some(vram_gb),
    })));
    let routing = resolve_pool_config(
        &UserSettings::default(),
        &EnvOverrides::default(),
        &tier_for_vram(vram_gb),
    );
    ModelPool::with_options(
        routing,
        RecoveryController::new(roots(temp), registry, factory),
        detector,
        PoolOptions {
            device: Device::Cpu,
            precision: Precision::Float16,
        },
    )
}
