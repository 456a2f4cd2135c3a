//! Kubeconfig hot reload
//!
//! Polls the persistent kubeconfig files and re-syncs the context store
//! whenever one of them changes, appears or disappears.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{sync_contexts, ContextSource, ContextStore};

/// Interval between kubeconfig checks
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// Modification time and length per watched file, `None` when missing
type Fingerprint = Vec<Option<(SystemTime, u64)>>;

/// Keeps a context store in step with a set of kubeconfig files
pub struct KubeconfigWatcher {
    store: ContextStore,
    paths: Vec<PathBuf>,
    source: ContextSource,
    interval: Duration,
}

impl KubeconfigWatcher {
    /// Create a watcher over `paths`, storing contexts with `source`
    pub fn new(
        store: ContextStore,
        paths: Vec<PathBuf>,
        source: ContextSource,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            paths,
            source,
            interval,
        }
    }

    /// Start watching until `cancel` fires
    ///
    /// The files' current state is taken as the baseline, so contexts should
    /// already be loaded when the watcher starts.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = fingerprint(&self.paths);

        tracing::info!(
            "Watching {} kubeconfig file(s) every {:?}",
            self.paths.len(),
            self.interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    tracing::debug!("Kubeconfig watcher shutting down");
                    break;
                }
            }

            let current = fingerprint(&self.paths);
            if current == last {
                continue;
            }
            last = current;

            tracing::info!("Kubeconfig files changed, reloading contexts");
            match sync_contexts(&self.store, &self.paths, self.source) {
                Ok(count) => tracing::info!("Reloaded {} context(s)", count),
                Err(e) => tracing::warn!("Error synchronizing contexts: {}", e),
            }
        }
    }
}

fn fingerprint(paths: &[PathBuf]) -> Fingerprint {
    paths
        .iter()
        .map(|path| {
            let meta = std::fs::metadata(path).ok()?;
            Some((meta.modified().ok()?, meta.len()))
        })
        .collect()
}
