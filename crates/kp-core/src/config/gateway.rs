//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use super::default_config_dir;
use crate::cache::DEFAULT_SWEEP_INTERVAL;
use crate::kubeconfig::DEFAULT_WATCH_INTERVAL;
use kp_protocol::DEFAULT_MAX_FRAME_SIZE;

/// Configuration for the gateway daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind the HTTP/WebSocket server to
    pub bind_address: String,

    /// Kubeconfig files holding the persistent clusters
    pub kubeconfig: Vec<PathBuf>,

    /// Accept client-supplied ("stateless") kubeconfigs and serve the
    /// `/cluster` add/remove routes
    pub enable_dynamic_clusters: bool,

    /// Directory holding the kubeconfig of clusters added through `/cluster`
    pub dynamic_kubeconfig_dir: Option<PathBuf>,

    /// Reload the kubeconfig files when they change on disk
    pub watch_kubeconfig: bool,

    /// Interval between kubeconfig change checks
    #[serde(with = "duration_secs")]
    pub kubeconfig_watch_interval: Duration,

    /// Lifetime of a freshly registered stateless context
    #[serde(with = "duration_secs")]
    pub stateless_context_ttl: Duration,

    /// Lifetime granted each time a stateless context is reused
    #[serde(with = "duration_secs")]
    pub stateless_context_refresh_ttl: Duration,

    /// Interval between upstream pings
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Upper bound on an upstream WebSocket handshake
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Interval between context cache sweeps
    #[serde(with = "duration_secs")]
    pub cache_sweep_interval: Duration,

    /// Largest client frame accepted, in bytes
    pub max_frame_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4466".to_string(),
            kubeconfig: Vec::new(),
            enable_dynamic_clusters: true,
            dynamic_kubeconfig_dir: None,
            watch_kubeconfig: true,
            kubeconfig_watch_interval: DEFAULT_WATCH_INTERVAL,
            stateless_context_ttl: Duration::from_secs(20 * 60),
            stateless_context_refresh_ttl: Duration::from_secs(20 * 60),
            heartbeat_interval: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(45),
            cache_sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl GatewayConfig {
    /// Kubeconfig paths from the config file, or `$KUBECONFIG`, or `~/.kube/config`
    pub fn kubeconfig_paths(&self) -> Vec<PathBuf> {
        if !self.kubeconfig.is_empty() {
            return self.kubeconfig.clone();
        }

        if let Some(env) = std::env::var_os("KUBECONFIG") {
            let paths: Vec<PathBuf> = std::env::split_paths(&env)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !paths.is_empty() {
                return paths;
            }
        }

        dirs::home_dir()
            .map(|home| vec![home.join(".kube").join("config")])
            .unwrap_or_default()
    }

    /// Where clusters added at runtime are persisted
    pub fn dynamic_kubeconfig_dir(&self) -> PathBuf {
        self.dynamic_kubeconfig_dir
            .clone()
            .unwrap_or_else(|| default_config_dir().join("kubeconfigs"))
    }
}
