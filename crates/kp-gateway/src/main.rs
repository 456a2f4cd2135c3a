//! kubeplex Gateway Daemon
//!
//! Serves the multiplexer WebSocket and relays Kubernetes streams from the
//! clusters found in the configured kubeconfig files.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kp_core::config::{self, GatewayConfig};
use kp_core::kubeconfig::{
    load_and_store_kubeconfigs, ContextSource, ContextStore, KubeconfigWatcher,
    PERSISTED_KUBECONFIG,
};
use kp_gateway::server::GatewayServer;
use kp_gateway::GatewayState;

#[derive(Parser)]
#[command(name = "kp-gateway")]
#[command(about = "kubeplex gateway daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Kubeconfig file(s) holding persistent clusters (overrides config)
    #[arg(short, long)]
    kubeconfig: Vec<PathBuf>,

    /// Ignore kubeconfigs supplied by clients
    #[arg(long)]
    disable_dynamic_clusters: bool,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("kubeplex gateway starting...");

    // Load configuration
    let mut config: GatewayConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                GatewayConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            GatewayConfig::default()
        }
    };

    if !args.kubeconfig.is_empty() {
        config.kubeconfig = args.kubeconfig.clone();
    }
    if args.disable_dynamic_clusters {
        config.enable_dynamic_clusters = false;
    }
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    // Load persistent clusters
    let contexts = ContextStore::new();
    let paths = config.kubeconfig_paths();
    match load_and_store_kubeconfigs(&contexts, &paths, ContextSource::KubeConfig) {
        Ok(count) => tracing::info!("Loaded {} context(s) from {:?}", count, paths),
        Err(e) => tracing::warn!("Failed to load kubeconfig {:?}: {}", paths, e),
    }

    // Clusters added at runtime on a previous run
    if config.enable_dynamic_clusters {
        let persisted = config.dynamic_kubeconfig_dir().join(PERSISTED_KUBECONFIG);
        if persisted.exists() {
            match load_and_store_kubeconfigs(
                &contexts,
                std::slice::from_ref(&persisted),
                ContextSource::DynamicCluster,
            ) {
                Ok(count) => tracing::info!("Loaded {} dynamic cluster(s) from {:?}", count, persisted),
                Err(e) => tracing::warn!("Failed to load dynamic clusters {:?}: {}", persisted, e),
            }
        }
    } else {
        tracing::info!("Dynamic clusters disabled");
    }

    let state = Arc::new(GatewayState::new(config.clone(), contexts));
    let cancel = state.shutdown.clone();

    let sweeper = state
        .contexts
        .spawn_sweeper(config.cache_sweep_interval, cancel.clone());

    let watcher = config.watch_kubeconfig.then(|| {
        KubeconfigWatcher::new(
            state.contexts.clone(),
            paths.clone(),
            ContextSource::KubeConfig,
            config.kubeconfig_watch_interval,
        )
        .spawn(cancel.clone())
    });

    // Setup signal handlers
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let server = GatewayServer::new(Arc::clone(&state));
    tracing::info!("Starting gateway on {}", bind_addr);
    let result = server.run(&bind_addr).await;

    cancel.cancel();
    let _ = sweeper.await;
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }

    result?;
    tracing::info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }

    cancel.cancel();
}
