//! Keyed pool of lazily loaded model handles
//!
//! Loads are serialized per key and never duplicated: the first caller for
//! a key spawns the load as a task and publishes a shared future in the
//! key's slot; every later caller awaits a clone of it. A caller that is
//! cancelled only stops waiting, the spawned load runs to completion.
//!
//! Each load holds a read guard on the pool gate for its whole duration;
//! [`ModelPool::clear_all`] takes the write side, so it waits for in-flight
//! loads and no load can start while a clear runs.

use crate::config::{DEFAULT_KEY, PoolConfig, Route};
use crate::embedder::{Device, Embedder, ModelSource, Precision};
use crate::error::{LoadOrigin, ModelError, ModelResult};
use crate::gpu::{HardwareTierDetector, VramProbe};
use crate::metrics;
use crate::models::recovery::{LoadPlan, RecoveryAction, RecoveryController};
use crate::models::registry::{ModelDescriptor, apply_downgrade, require_descriptor};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, future};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

type LoadFuture = Shared<BoxFuture<'static, ModelResult<Arc<ModelHandle>>>>;

/// A loaded, device-resident model
#[derive(Debug)]
pub struct ModelHandle {
    pub key: String,
    /// Model the routing table or caller asked for
    pub requested_model: String,
    /// Model actually loaded, after adaptive downgrade
    pub model_name: String,
    pub dimension: usize,
    pub device: Device,
    pub precision: Precision,
    pub truncate_dim: Option<usize>,
    /// Device memory growth observed across construction, in MB
    pub memory_delta_mb: Option<f64>,
    pub origin: LoadOrigin,
    pub source: ModelSource,
    pub cache_verdict: String,
    pub recovery: Vec<RecoveryAction>,
    pub loaded_at: DateTime<Utc>,
    descriptor: &'static ModelDescriptor,
    embedder: Arc<dyn Embedder>,
}

impl ModelHandle {
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn descriptor(&self) -> &'static ModelDescriptor {
        self.descriptor
    }

    pub fn was_downgraded(&self) -> bool {
        self.requested_model != self.model_name
    }
}

enum Slot {
    Loading(LoadFuture),
    Ready(Arc<ModelHandle>),
}

/// Diagnostics from [`ModelPool::clear_all`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClearReport {
    /// Keys whose handle released cleanly
    pub released: Vec<String>,
    pub failures: Vec<ReleaseFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseFailure {
    pub key: String,
    pub model: String,
    pub error: String,
}

/// Placement options applied to every load
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PoolOptions {
    pub device: Device,
    pub precision: Precision,
}

/// Shared registry of model handles keyed by routing key
#[derive(Clone)]
pub struct ModelPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    gate: Arc<RwLock<()>>,
    slots: DashMap<String, Slot>,
    routing: PoolConfig,
    recovery: RecoveryController,
    detector: Arc<HardwareTierDetector>,
    options: PoolOptions,
}

impl ModelPool {
    pub fn new(
        routing: PoolConfig,
        recovery: RecoveryController,
        detector: Arc<HardwareTierDetector>,
    ) -> Self {
        Self::with_options(routing, recovery, detector, PoolOptions::default())
    }

    pub fn with_options(
        routing: PoolConfig,
        recovery: RecoveryController,
        detector: Arc<HardwareTierDetector>,
        options: PoolOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                gate: Arc::new(RwLock::new(())),
                slots: DashMap::new(),
                routing,
                recovery,
                detector,
                options,
            }),
        }
    }

    /// Current routing table
    pub fn pool_config(&self) -> &PoolConfig {
        self.inner.routing()
    }

    pub fn detector(&self) -> &Arc<HardwareTierDetector> {
        &self.inner.detector
    }

    pub fn recovery(&self) -> &RecoveryController {
        &self.inner.recovery
    }

    /// Handle for `key`, loading it on first use
    ///
    /// `model_override` names a model explicitly and bypasses routing. When a
    /// non-default key fails to load and the default handle is already
    /// loaded, the default handle is returned instead; it is not stored
    /// under the failing key.
    pub async fn get(
        &self,
        key: Option<&str>,
        model_override: Option<&str>,
    ) -> ModelResult<Arc<ModelHandle>> {
        let route = self.inner.routing().route(key, model_override)?;

        match self.inner.obtain(&route).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                metrics::record_load_failure(&route.key);
                if route.key != DEFAULT_KEY
                    && let Some(default) = self.ready(DEFAULT_KEY).await
                {
                    tracing::warn!(
                        key = %route.key,
                        model = %route.model,
                        fallback = %default.model_name,
                        error = %e,
                        "Load failed, serving default model"
                    );
                    return Ok(default);
                }
                tracing::error!(key = %route.key, model = %route.model, error = %e, "Model load failed");
                Err(e)
            }
        }
    }

    /// Loaded handle for `key`, without triggering a load
    pub async fn ready(&self, key: &str) -> Option<Arc<ModelHandle>> {
        let _guard = self.inner.gate.read().await;
        self.inner.ready_handle(key)
    }

    /// Every loaded handle, ordered by key
    pub async fn loaded(&self) -> Vec<Arc<ModelHandle>> {
        let _guard = self.inner.gate.read().await;
        let mut handles: Vec<_> = self
            .inner
            .slots
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Ready(handle) => Some(handle.clone()),
                Slot::Loading(_) => None,
            })
            .collect();
        handles.sort_by(|a, b| a.key.cmp(&b.key));
        handles
    }

    /// Number of loaded handles
    pub async fn len(&self) -> usize {
        self.loaded().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Release every handle and reset the pool
    ///
    /// Waits for in-flight loads. Release failures and panics are collected
    /// into the report and never stop the remaining releases.
    pub async fn clear_all(&self) -> ClearReport {
        let _exclusive = self.inner.gate.write().await;

        let mut keys: Vec<String> = self
            .inner
            .slots
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        let drained: Vec<(String, Slot)> = keys
            .iter()
            .filter_map(|key| self.inner.slots.remove(key))
            .collect();

        let mut report = ClearReport::default();
        for (key, slot) in drained {
            let handle = match slot {
                Slot::Ready(handle) => Some(handle),
                // Every load finished before the gate was granted
                Slot::Loading(future) => match future.clone().now_or_never() {
                    Some(Ok(handle)) => Some(handle),
                    _ => None,
                },
            };
            let Some(handle) = handle else { continue };

            let released = AssertUnwindSafe(handle.embedder.release())
                .catch_unwind()
                .await;
            let error = match released {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(_) => Some("release panicked".to_string()),
            };

            match error {
                None => {
                    tracing::debug!(key = %key, model = %handle.model_name, "Released model");
                    report.released.push(key);
                }
                Some(error) => {
                    tracing::warn!(key = %key, model = %handle.model_name, error = %error, "Failed to release model");
                    report.failures.push(ReleaseFailure {
                        key,
                        model: handle.model_name.clone(),
                        error,
                    });
                }
            }
        }

        self.inner
            .recovery
            .factory()
            .reclaim_device_memory()
            .await;

        metrics::record_clear();
        metrics::update_handle_count(0);
        tracing::info!(
            released = report.released.len(),
            failures = report.failures.len(),
            "Model pool cleared"
        );

        report
    }
}

impl PoolInner {
    fn routing(&self) -> &PoolConfig {
        &self.routing
    }

    fn ready_handle(&self, key: &str) -> Option<Arc<ModelHandle>> {
        self.slots.get(key).and_then(|slot| match slot.value() {
            Slot::Ready(handle) => Some(handle.clone()),
            Slot::Loading(_) => None,
        })
    }

    fn ready_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .count()
    }

    async fn obtain(self: &Arc<Self>, route: &Route) -> ModelResult<Arc<ModelHandle>> {
        let guard = self.gate.clone().read_owned().await;

        let future = match self.slots.entry(route.key.clone()) {
            Entry::Occupied(mut entry) => {
                let pending = match entry.get() {
                    Slot::Ready(handle) => return Ok(handle.clone()),
                    Slot::Loading(future) if !matches!(future.peek(), Some(Err(_))) => {
                        Some(future.clone())
                    }
                    // Previous attempt failed: start over
                    Slot::Loading(_) => None,
                };
                match pending {
                    Some(future) => {
                        drop(guard);
                        future
                    }
                    None => {
                        let future = self.start_load(route.clone(), guard);
                        entry.insert(Slot::Loading(future.clone()));
                        future
                    }
                }
            }
            Entry::Vacant(entry) => {
                let future = self.start_load(route.clone(), guard);
                entry.insert(Slot::Loading(future.clone()));
                future
            }
        };

        future.await
    }

    /// Spawn the load for `route`; the task owns the caller's gate guard
    fn start_load(self: &Arc<Self>, route: Route, guard: OwnedRwLockReadGuard<()>) -> LoadFuture {
        let inner = Arc::clone(self);
        let key = route.key.clone();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = inner.load(&route).await.map(Arc::new);

            if let Ok(handle) = &result {
                if let Some(mut slot) = inner.slots.get_mut(&route.key) {
                    *slot = Slot::Ready(handle.clone());
                }
                metrics::update_handle_count(inner.ready_count());
            }
            result
        });

        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(ModelError::TaskFailed {
                    key,
                    detail: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn load(&self, route: &Route) -> ModelResult<ModelHandle> {
        let requested = require_descriptor(&route.model)?;
        let tier = self.detector.detect_tier();
        let descriptor = require_descriptor(apply_downgrade(requested.name, tier.detected_vram_gb))?;

        if descriptor.name != requested.name {
            tracing::info!(
                key = %route.key,
                requested = requested.name,
                model = descriptor.name,
                vram_gb = tier.detected_vram_gb,
                tier = tier.name,
                "Downgrading model to fit available VRAM"
            );
        }

        let (trust_remote_code, truncate_dim) = self.routing().model_options(descriptor.name);
        let plan = LoadPlan {
            descriptor,
            device: self.options.device.resolve(self.detector.has_device()),
            precision: self.options.precision,
            truncate_dim,
            trust_remote_code,
        };

        tracing::info!(key = %route.key, model = descriptor.name, device = %plan.device, "Loading model");

        let probe = Arc::clone(self.detector.probe());
        let before = sample_used_vram(Arc::clone(&probe)).await;
        let outcome = self.recovery.load(&plan).await?;
        let after = sample_used_vram(probe).await;
        let memory_delta_mb = before.zip(after).map(|(before, after)| after - before);

        for action in &outcome.actions {
            metrics::record_recovery(action.label());
        }
        let origin = match outcome.origin {
            LoadOrigin::Cache => "cache",
            LoadOrigin::Network => "network",
        };
        metrics::record_load(&route.key, descriptor.name, origin);

        tracing::info!(
            key = %route.key,
            model = descriptor.name,
            origin,
            memory_delta_mb = ?memory_delta_mb,
            "Model loaded"
        );

        Ok(ModelHandle {
            key: route.key.clone(),
            requested_model: requested.name.to_string(),
            model_name: descriptor.name.to_string(),
            dimension: descriptor.effective_dimension(truncate_dim),
            device: plan.device,
            precision: plan.precision,
            truncate_dim,
            memory_delta_mb,
            origin: outcome.origin,
            source: outcome.source,
            cache_verdict: outcome.cache_verdict,
            recovery: outcome.actions,
            loaded_at: Utc::now(),
            descriptor,
            embedder: outcome.embedder,
        })
    }
}

async fn sample_used_vram(probe: Arc<dyn VramProbe>) -> Option<f64> {
    tokio::task::spawn_blocking(move || probe.used_vram_mb())
        .await
        .ok()
        .flatten()
}

/// Load several keys concurrently, returning per-key results in order
pub async fn warm(pool: &ModelPool, keys: &[&str]) -> Vec<(String, ModelResult<Arc<ModelHandle>>)> {
    let loads = keys.iter().map(|key| async move {
        let result = pool.get(Some(key), None).await;
        (key.to_string(), result)
    });
    future::join_all(loads).await
}
