//! Remote model registry backed by the HuggingFace Hub
//!
//! Used for two things only: a best-effort existence check before a
//! first-time download, and explicit prefetching of a model into a chosen
//! cache root.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use std::collections::HashSet;
use std::path::PathBuf;

/// Answer of a remote existence check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLookup {
    /// The identity exists; `info` is a short display string
    Found { info: String },
    /// The registry explicitly denies the identity exists
    NotFound,
}

/// Remote registry lookup
///
/// `Err` means the registry could not be asked (offline, rate limited) and
/// callers treat it as non-fatal.
#[async_trait]
pub trait RemoteRegistry: Send + Sync {
    async fn exists(&self, model_id: &str) -> Result<RemoteLookup>;
}

/// Registry over the public HuggingFace Hub
#[derive(Debug, Clone, Default)]
pub struct HubRegistry {
    cache_dir: Option<PathBuf>,
}

impl HubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose downloads land in `cache_dir` instead of the default hub cache
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir: Some(cache_dir),
        }
    }

    fn api(&self) -> Result<Api> {
        let api = match &self.cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.clone()).build(),
            None => Api::new(),
        };
        api.context("Failed to create HF API client")
    }

    /// Download a model's essential files into the cache
    ///
    /// Fetches config, tokenizer, weights (all shards when the model is
    /// sharded) and the optional sentence-transformers metadata. Returns the
    /// snapshot directory.
    pub async fn download(&self, model_id: &str) -> Result<PathBuf> {
        tracing::info!(model = %model_id, cache_dir = ?self.cache_dir, "Starting model download via hf-hub");

        let repo = self.api()?.model(model_id.to_string());

        let config_path = repo
            .get("config.json")
            .await
            .with_context(|| format!("Failed to download config.json for {model_id}"))?;

        let tokenizer_files = ["tokenizer.json", "tokenizer.model", "vocab.txt"];
        let mut tokenizer_found = false;
        for file in &tokenizer_files {
            if repo.get(file).await.is_ok() {
                tracing::debug!(model = %model_id, file = %file, "Downloaded tokenizer file");
                tokenizer_found = true;
                break;
            }
        }
        if !tokenizer_found {
            anyhow::bail!("No tokenizer file found for {model_id}");
        }

        // Safetensors preferred, fall back to pytorch, then sharded
        let weight_files = [
            "model.safetensors",
            "pytorch_model.bin",
            "model.safetensors.index.json",
            "pytorch_model.bin.index.json",
        ];

        let mut downloaded_weights = false;
        for file in &weight_files {
            if repo.get(file).await.is_ok() {
                tracing::debug!(model = %model_id, file = %file, "Downloaded weight file");
                downloaded_weights = true;

                if file.ends_with(".index.json") {
                    download_sharded_weights(&repo, file, model_id).await?;
                }
                break;
            }
        }

        if !downloaded_weights {
            anyhow::bail!("No standard weight files found for {model_id}");
        }

        let optional_files = [
            "tokenizer_config.json",
            "special_tokens_map.json",
            "sentence_bert_config.json",
            "modules.json",
            "1_Pooling/config.json",
        ];

        for file in &optional_files {
            if repo.get(file).await.is_ok() {
                tracing::debug!(model = %model_id, file = %file, "Downloaded optional file");
            }
        }

        config_path
            .parent()
            .map(|p| p.to_path_buf())
            .with_context(|| format!("Model downloaded but snapshot path not found for {model_id}"))
    }
}

#[async_trait]
impl RemoteRegistry for HubRegistry {
    async fn exists(&self, model_id: &str) -> Result<RemoteLookup> {
        let repo = self.api()?.model(model_id.to_string());
        match repo.info().await {
            Ok(info) => Ok(RemoteLookup::Found {
                info: format!("{model_id}@{} ({} files)", info.sha, info.siblings.len()),
            }),
            Err(e) => {
                let message = e.to_string();
                if is_not_found(&message) {
                    Ok(RemoteLookup::NotFound)
                } else {
                    Err(anyhow::anyhow!("Registry lookup failed for {model_id}: {message}"))
                }
            }
        }
    }
}

/// Whether a hub error message reports a missing repository
fn is_not_found(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("404") || lower.contains("not found") || lower.contains("repository not found")
}

/// Download sharded weight files referenced in an index file
async fn download_sharded_weights(repo: &ApiRepo, index_file: &str, model_id: &str) -> Result<()> {
    let index_path = repo
        .get(index_file)
        .await
        .with_context(|| format!("Failed to get index file {index_file}"))?;

    let index_content = tokio::fs::read_to_string(&index_path)
        .await
        .context("Failed to read index file")?;

    let index: serde_json::Value =
        serde_json::from_str(&index_content).context("Failed to parse index file")?;

    if let Some(weight_map) = index.get("weight_map").and_then(|v| v.as_object()) {
        let shards: HashSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();

        tracing::info!(
            model = %model_id,
            shard_count = shards.len(),
            "Downloading sharded weights"
        );

        for shard in shards {
            tracing::debug!(model = %model_id, shard = %shard, "Downloading shard");
            repo.get(shard)
                .await
                .with_context(|| format!("Failed to download shard {shard}"))?;
        }
    }

    Ok(())
}
