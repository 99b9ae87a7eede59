//! embed-pool - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use embed_pool::{
    api,
    config::{EnvOverrides, ServiceConfig, resolve_pool_config},
    gpu::HardwareTierDetector,
    metrics,
    models::{
        HubRegistry, LoaderConfig, RecoveryController, TeiEmbedderFactory, get_cache_size,
        list_cached_models, model_location, registry::descriptor, split::resolve_split, validate,
    },
    pool::{ModelPool, PoolOptions, warm},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "embed-pool")]
#[command(about = "Embedding model cache validation, recovery and model pool", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the diagnostics API until SIGINT/SIGTERM
    Serve {
        /// Override API port
        #[arg(long)]
        port: Option<u16>,

        /// Routing keys to load before serving
        #[arg(long, value_delimiter = ',')]
        preload: Vec<String>,
    },
    /// Print the detected hardware tier
    Tier,
    /// Validate a model's cache in both cache roots
    Validate { model: String },
    /// Download a model into the configured cache
    Fetch { model: String },
    /// List cached models in both cache roots
    Cached,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    let env = EnvOverrides::from_env()?;
    let config = ServiceConfig::load(cli.config, &env)?;

    match cli.command {
        Command::Serve { port, preload } => serve(config, env, port, preload).await,
        Command::Tier => {
            let tier = HardwareTierDetector::default().detect_tier().clone();
            println!("{}", serde_json::to_string_pretty(&tier)?);
            Ok(())
        }
        Command::Validate { model } => validate_model(&config, &model),
        Command::Fetch { model } => fetch(&config, &model).await,
        Command::Cached => {
            let roots = config.cache_roots();
            for (label, root) in [("custom", &roots.custom), ("default", &roots.default)] {
                println!("{label} ({})", root.display());
                for model in list_cached_models(root) {
                    let size = get_cache_size(root, &model).unwrap_or(0);
                    println!("  {model}  {:.1} MB", size as f64 / (1024.0 * 1024.0));
                }
            }
            Ok(())
        }
    }
}

async fn serve(
    mut config: ServiceConfig,
    env: EnvOverrides,
    port: Option<u16>,
    preload: Vec<String>,
) -> Result<()> {
    tracing::info!("Starting embed-pool");

    // CLI overrides
    if let Some(port) = port {
        config.api_port = port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        cache_dir = ?config.cache_dir,
        device = %config.device,
        precision = %config.precision,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let detector = Arc::new(HardwareTierDetector::default());
    let routing = resolve_pool_config(&config.models, &env, detector.detect_tier());
    tracing::info!(
        multi_model = routing.multi_model,
        default_model = %routing.default_model,
        variant = ?routing.variant,
        "Routing resolved"
    );

    let factory = Arc::new(TeiEmbedderFactory::with_config(LoaderConfig {
        tei_binary_path: config.tei_binary_path.clone(),
        base_port: config.base_port,
        load_timeout_secs: config.load_timeout_secs,
        ..Default::default()
    }));
    let recovery = RecoveryController::new(config.cache_roots(), Arc::new(HubRegistry::new()), factory)
        .with_remote_verification(config.verify_remote);

    let pool = ModelPool::with_options(
        routing,
        recovery,
        detector,
        PoolOptions {
            device: config.device,
            precision: config.precision,
        },
    );

    if !preload.is_empty() {
        let keys: Vec<&str> = preload.iter().map(String::as_str).collect();
        for (key, result) in warm(&pool, &keys).await {
            if let Err(e) = result {
                tracing::error!(key = %key, error = %e, "Failed to preload model");
            }
        }
    }

    // Setup API
    let config = Arc::new(config);
    let app_state = api::AppState {
        pool: pool.clone(),
        config: config.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    let report = pool.clear_all().await;
    for failure in &report.failures {
        tracing::error!(
            key = %failure.key,
            model = %failure.model,
            error = %failure.error,
            "Failed to release model during shutdown"
        );
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

fn validate_model(config: &ServiceConfig, model: &str) -> Result<()> {
    let roots = config.cache_roots();
    let custom = model_location(&roots.custom, model);
    let default = model_location(&roots.default, model);

    let mut results = Vec::new();
    for (label, location) in [("custom", &custom), ("default", &default)] {
        let result = validate(location);
        println!("{label:8} {}  {}", location.display(), result.verdict());
        if let Some(snapshot) = &result.snapshot {
            println!("{:8} snapshot {}", "", snapshot.display());
        }
        results.push(result);
    }

    let mut loadable = results.iter().any(|r| r.valid);
    if let Some(desc) = descriptor(model).filter(|d| d.trust_remote_code) {
        let resolution = resolve_split(desc, &custom, &default);
        match resolution.load_path() {
            Some(path) => {
                println!("split    loadable from {}", path.display());
                loadable = true;
            }
            None => {
                if let Some(err) = resolution.into_error(model) {
                    println!("split    {err}");
                }
            }
        }
    }

    if loadable {
        return Ok(());
    }
    match results.swap_remove(0).into_error(model) {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn fetch(config: &ServiceConfig, model: &str) -> Result<()> {
    let registry = HubRegistry::with_cache_dir(config.cache_dir.clone());
    let snapshot = registry
        .download(model)
        .await
        .with_context(|| format!("Failed to fetch {model}"))?;

    let result = validate(&model_location(&config.cache_dir, model));
    println!("{}  {}", snapshot.display(), result.verdict());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
