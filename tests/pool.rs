//! Model pool behaviour against real cache directories

mod common;

use common::*;
use embed_pool::config::DEFAULT_KEY;
use embed_pool::embedder::ModelSource;
use embed_pool::error::{LoadOrigin, ModelError};
use embed_pool::models::RecoveryAction;
use embed_pool::pool::warm;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn scenario_e_oversized_override_is_downgraded_on_laptop() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory::default());
    let pool = test_pool(&temp, factory.clone(), 8.0);

    let handle = pool
        .get(Some("embed"), Some("Qwen/Qwen3-Embedding-8B"))
        .await
        .unwrap();

    assert_eq!(handle.requested_model, "Qwen/Qwen3-Embedding-8B");
    assert_eq!(handle.model_name, "Qwen/Qwen3-Embedding-0.6B");
    assert!(handle.was_downgraded());
    assert_eq!(handle.dimension, 1024);
    assert_eq!(factory.requests()[0].model_name, "Qwen/Qwen3-Embedding-0.6B");
}

#[tokio::test]
async fn workstation_keeps_requested_model() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory::default());
    let pool = test_pool(&temp, factory.clone(), 24.0);

    let handle = pool
        .get(None, Some("Qwen/Qwen3-Embedding-8B"))
        .await
        .unwrap();

    assert!(!handle.was_downgraded());
    assert_eq!(handle.truncate_dim, Some(1024));
    assert_eq!(handle.dimension, 1024);
}

#[tokio::test]
async fn valid_cache_loads_offline_from_snapshot() {
    let temp = TempDir::new().unwrap();
    let snapshot = write_valid_cache(&roots(&temp).custom, "BAAI/bge-m3");
    let factory = Arc::new(MockFactory::default());
    let pool = test_pool(&temp, factory.clone(), 12.0);

    let handle = pool.get(Some("bge_m3"), None).await.unwrap();

    assert_eq!(handle.origin, LoadOrigin::Cache);
    assert_eq!(handle.source, ModelSource::Local(snapshot));
    assert_eq!(handle.cache_verdict, "valid");
    assert!(handle.recovery.is_empty());
    assert!(factory.requests()[0].offline);
}

#[tokio::test]
async fn failed_local_load_falls_back_to_network() {
    let temp = TempDir::new().unwrap();
    write_valid_cache(&roots(&temp).custom, "BAAI/bge-m3");
    let factory = Arc::new(MockFactory {
        fail_local: true,
        ..Default::default()
    });
    let pool = test_pool(&temp, factory.clone(), 12.0);

    let handle = pool.get(Some("bge_m3"), None).await.unwrap();

    assert_eq!(handle.origin, LoadOrigin::Network);
    assert!(matches!(
        handle.recovery.as_slice(),
        [RecoveryAction::NetworkFallback { .. }]
    ));
    let requests = factory.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].offline);
    assert!(!requests[1].offline);
}

#[tokio::test]
async fn single_model_mode_collapses_keys() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory::default());
    let pool = test_pool(&temp, factory.clone(), 4.0);

    let a = pool.get(Some("bge_m3"), None).await.unwrap();
    let b = pool.get(Some("anything"), None).await.unwrap();
    let c = pool.get(None, None).await.unwrap();

    assert_eq!(a.key, DEFAULT_KEY);
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(a.model_name, "google/embeddinggemma-300m");
    assert_eq!(factory.constructions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warm_loads_distinct_keys_concurrently() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory {
        delay: Duration::from_millis(50),
        ..Default::default()
    });
    let pool = test_pool(&temp, factory.clone(), 12.0);

    let results = warm(&pool, &["qwen3", "bge_m3", "coderankembed", "bge_m3"]).await;

    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(factory.constructions(), 3);
    assert_eq!(pool.len().await, 3);

    let keys: Vec<String> = pool.loaded().await.iter().map(|h| h.key.clone()).collect();
    assert_eq!(keys, vec!["bge_m3", "coderankembed", "qwen3"]);
}

#[tokio::test]
async fn clear_collects_release_failures_and_continues() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory {
        failing_release: vec!["BAAI/bge-m3"],
        ..Default::default()
    });
    let pool = test_pool(&temp, factory.clone(), 12.0);
    warm(&pool, &["qwen3", "bge_m3"]).await;

    let report = pool.clear_all().await;

    assert_eq!(report.released, vec!["qwen3".to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, "bge_m3");
    assert_eq!(report.failures[0].model, "BAAI/bge-m3");
    assert!(report.failures[0].error.contains("device busy"));
    assert_eq!(factory.releases.load(Ordering::SeqCst), 2);
    assert_eq!(factory.reclaims.load(Ordering::SeqCst), 1);
    assert!(pool.is_empty().await);

    // The next request constructs a fresh instance
    pool.get(Some("qwen3"), None).await.unwrap();
    assert_eq!(factory.constructions(), 3);
}

#[tokio::test]
async fn failing_key_serves_default_without_storing_it() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory {
        failing: vec!["BAAI/bge-m3"],
        ..Default::default()
    });
    let pool = test_pool(&temp, factory.clone(), 8.0);

    let default = pool.get(Some(DEFAULT_KEY), None).await.unwrap();
    let served = pool.get(Some("bge_m3"), None).await.unwrap();

    assert!(Arc::ptr_eq(&default, &served));
    assert!(pool.ready("bge_m3").await.is_none());
    assert_eq!(pool.len().await, 1);
}

#[tokio::test]
async fn failing_default_key_propagates() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory {
        failing: vec!["google/embeddinggemma-300m"],
        ..Default::default()
    });
    let pool = test_pool(&temp, factory, 4.0);

    let err = pool.get(None, None).await.unwrap_err();
    assert!(matches!(err, ModelError::RecoveryExhausted { .. }));
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn unknown_override_is_rejected_before_loading() {
    let temp = TempDir::new().unwrap();
    let factory = Arc::new(MockFactory::default());
    let pool = test_pool(&temp, factory.clone(), 12.0);

    let err = pool.get(None, Some("acme/not-a-model")).await.unwrap_err();
    assert!(matches!(err, ModelError::UnknownModel { .. }));
    assert!(err.is_caller_error());
    assert_eq!(factory.constructions(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cached_load_does_not_force_download_offline() {
    let temp = TempDir::new().unwrap();
    write_valid_cache(&roots(&temp).custom, "Qwen/Qwen3-Embedding-0.6B");
    let factory = Arc::new(MockFactory {
        delay: Duration::from_millis(300),
        ..Default::default()
    });
    let pool = test_pool_with_registry(
        &temp,
        factory.clone(),
        12.0,
        Arc::new(SlowRegistry(Duration::from_millis(100))),
    );

    // bge_m3 has no cache and waits on the registry while qwen3 loads offline
    let fetching = tokio::spawn({
        let pool = pool.clone();
        async move { pool.get(Some("bge_m3"), None).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cached = pool.get(Some("qwen3"), None).await.unwrap();
    let fetched = fetching.await.unwrap().unwrap();

    assert_eq!(cached.origin, LoadOrigin::Cache);
    assert_eq!(fetched.origin, LoadOrigin::Network);

    let requests = factory.requests();
    let local = requests
        .iter()
        .find(|r| r.model_name == "Qwen/Qwen3-Embedding-0.6B")
        .unwrap();
    let network = requests
        .iter()
        .find(|r| r.model_name == "BAAI/bge-m3")
        .unwrap();
    assert!(local.offline);
    assert!(matches!(network.source, ModelSource::Remote(_)));
    assert!(!network.offline);
}
