//! Embedder backend running text-embeddings-router processes
//!
//! Each constructed embedder is one TEI child process serving a single
//! model on its own port. Construction waits until the router reports that
//! its HTTP server started; release stops the process with SIGTERM and
//! falls back to SIGKILL.

use crate::embedder::{Device, Embedder, EmbedderFactory, LoadRequest, ModelSource, Precision};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Configuration for the TEI-backed loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Path to the TEI binary
    pub tei_binary_path: String,
    /// First port handed to a spawned router
    pub base_port: u16,
    /// Timeout for model loading in seconds
    pub load_timeout_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on release
    pub stop_timeout_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            tei_binary_path: "text-embeddings-router".to_string(),
            base_port: 18080,
            load_timeout_secs: 300, // 5 minutes for large models
            stop_timeout_secs: 30,
        }
    }
}

/// Factory spawning one TEI router per embedder
pub struct TeiEmbedderFactory {
    config: LoaderConfig,
    next_port: AtomicU16,
}

impl TeiEmbedderFactory {
    pub fn new() -> Self {
        Self::with_config(LoaderConfig::default())
    }

    pub fn with_config(config: LoaderConfig) -> Self {
        Self {
            next_port: AtomicU16::new(config.base_port),
            config,
        }
    }

    pub fn from_tei_binary(tei_binary_path: String) -> Self {
        Self::with_config(LoaderConfig {
            tei_binary_path,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn allocate_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::SeqCst)
    }

    /// Build the router invocation for one request
    fn build_command(&self, request: &LoadRequest, port: u16) -> Command {
        let mut cmd = Command::new(&self.config.tei_binary_path);

        let model_id = match &request.source {
            ModelSource::Local(path) => path.display().to_string(),
            ModelSource::Remote(id) => id.clone(),
        };

        cmd.arg("--model-id")
            .arg(model_id)
            .arg("--port")
            .arg(port.to_string())
            .arg("--dtype")
            .arg(match request.precision {
                Precision::Float16 => "float16",
                Precision::Float32 => "float32",
            })
            .env("HUGGINGFACE_HUB_CACHE", &request.cache_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match request.device {
            Device::Cpu => {
                cmd.env("CUDA_VISIBLE_DEVICES", "");
            }
            Device::Cuda => {
                cmd.env("CUDA_VISIBLE_DEVICES", "0");
            }
            Device::Auto => {}
        }

        if request.offline {
            cmd.env("HF_HUB_OFFLINE", "1");
        } else {
            cmd.env_remove("HF_HUB_OFFLINE");
        }

        cmd
    }
}

impl Default for TeiEmbedderFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbedderFactory for TeiEmbedderFactory {
    async fn create(&self, request: &LoadRequest) -> Result<Arc<dyn Embedder>> {
        let port = self.allocate_port();
        let mut cmd = self.build_command(request, port);

        tracing::debug!(
            binary = %self.config.tei_binary_path,
            model = %request.model_name,
            source = %request.source,
            port,
            offline = request.offline,
            trust_remote_code = request.trust_remote_code,
            "Spawning TEI process"
        );

        let mut child = cmd.spawn().context("Failed to spawn TEI process")?;
        let pid = child.id();

        let stderr = child
            .stderr
            .take()
            .context("Failed to capture TEI stderr")?;
        let mut reader = BufReader::new(stderr).lines();

        let ready = timeout(
            Duration::from_secs(self.config.load_timeout_secs),
            monitor_output(&mut reader, &request.model_name),
        )
        .await;

        let failure = match ready {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(format!(
                "Timeout after {}s waiting for model to load",
                self.config.load_timeout_secs
            )),
        };

        if let Some(failure) = failure {
            tracing::error!(model = %request.model_name, error = %failure, "TEI failed to start");
            let _ = child.kill().await;
            anyhow::bail!(failure);
        }

        // Keep draining stderr so the router never blocks on a full pipe
        let model = request.model_name.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::trace!(model = %model, line = %line, "TEI output");
            }
        });

        tracing::info!(model = %request.model_name, port, pid = ?pid, "TEI process ready");

        Ok(Arc::new(TeiEmbedder {
            model_name: request.model_name.clone(),
            port,
            truncate_dim: request.truncate_dim,
            stop_timeout: Duration::from_secs(self.config.stop_timeout_secs),
            child: Mutex::new(Some(child)),
        }))
    }
}

/// One running TEI router
#[derive(Debug)]
pub struct TeiEmbedder {
    model_name: String,
    port: u16,
    truncate_dim: Option<usize>,
    stop_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl TeiEmbedder {
    /// Base URL of the router's HTTP API
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Output dimension requested by the caller, applied client side
    pub fn truncate_dim(&self) -> Option<usize> {
        self.truncate_dim
    }
}

#[async_trait]
impl Embedder for TeiEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn release(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        if let Some(pid) = child.id() {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;

                let pid = Pid::from_raw(pid as i32);
                let _ = kill(pid, Signal::SIGTERM);

                tokio::select! {
                    _ = child.wait() => {
                        tracing::info!(model = %self.model_name, "TEI process stopped gracefully");
                    }
                    _ = tokio::time::sleep(self.stop_timeout) => {
                        tracing::warn!(model = %self.model_name, "Graceful shutdown timeout, sending SIGKILL");
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = child.wait().await;
                    }
                }
            }

            #[cfg(not(unix))]
            {
                let _ = pid;
                child.kill().await.context("Failed to kill TEI process")?;
            }
        }

        Ok(())
    }
}

/// Watch router output for a ready line or a known failure
async fn monitor_output<R>(reader: &mut Lines<R>, model: &str) -> Result<(), String>
where
    R: AsyncBufRead + Unpin,
{
    while let Ok(Some(line)) = reader.next_line().await {
        tracing::trace!(model = %model, line = %line, "TEI output");

        if line.contains("Started HTTP server") || line.contains("Starting HTTP server") {
            return Ok(());
        }

        if line.contains("Starting gRPC server") {
            return Ok(());
        }

        if line.contains("out of memory") || line.contains("CUDA_OUT_OF_MEMORY") {
            return Err(format!("Out of GPU memory: {line}"));
        }

        if line.contains("404") && line.contains("not found") {
            return Err(format!("Model not found on HuggingFace: {model}"));
        }

        if line.contains("not a valid") || line.contains("Unsupported model") {
            return Err(format!("Invalid or unsupported model type: {line}"));
        }

        if line.contains("Error") || line.contains("error:") || line.contains("CUDA error") {
            let mut error_lines = vec![line];
            // A few more lines of context
            for _ in 0..5 {
                match reader.next_line().await {
                    Ok(Some(next)) => error_lines.push(next),
                    _ => break,
                }
            }
            return Err(error_lines.join("\n"));
        }
    }

    Err("TEI process exited unexpectedly without starting".to_string())
}
