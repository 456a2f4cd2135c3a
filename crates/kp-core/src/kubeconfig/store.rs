//! Keyed store of resolved contexts
//!
//! Persistent contexts are stored without expiry under their display name.
//! Client-supplied contexts go in under a caller-chosen key with a TTL and
//! disappear once it lapses.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{load_contexts_from_multiple_files, Context, ContextLoadError, ContextSource};
use crate::cache::ExpiringCache;
use crate::error::{ContextStoreError, KubeconfigError};

/// Thread-safe context store backed by an [`ExpiringCache`]
#[derive(Clone, Default)]
pub struct ContextStore {
    cache: Arc<ExpiringCache<Arc<Context>>>,
}

impl ContextStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a context under its display name, replacing any previous entry
    pub fn add_context(&self, context: Context) {
        let name = context.display_name().to_string();
        self.cache.set(name, Arc::new(context));
    }

    /// All unexpired contexts, ordered by key
    pub fn get_contexts(&self) -> Vec<Arc<Context>> {
        let mut entries: Vec<_> = self.cache.get_all(None).into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, ctx)| ctx).collect()
    }

    /// Look up a context by key
    pub fn get_context(&self, key: &str) -> Result<Arc<Context>, ContextStoreError> {
        self.cache
            .get(key)
            .map_err(|_| ContextStoreError::NotFound(key.to_string()))
    }

    /// Remove a context; absent keys are ignored
    pub fn remove_context(&self, key: &str) {
        self.cache.delete(key);
    }

    /// Add a context under an explicit key with a TTL (zero = never expires)
    pub fn add_context_with_key_and_ttl(&self, context: Context, key: &str, ttl: Duration) {
        self.cache.set_with_ttl(key, Arc::new(context), ttl);
    }

    /// Extend the lifetime of a live context
    pub fn update_ttl(&self, key: &str, ttl: Duration) -> Result<(), ContextStoreError> {
        self.cache
            .update_ttl(key, ttl)
            .map_err(|_| ContextStoreError::NotFound(key.to_string()))
    }

    /// Start reclaiming expired contexts in the background
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        self.cache.spawn_sweeper(interval, cancel)
    }
}

/// Load every context from the given kubeconfig files into the store
///
/// Broken contexts are logged and skipped. Returns how many were stored.
pub fn load_and_store_kubeconfigs(
    store: &ContextStore,
    paths: &[PathBuf],
    source: ContextSource,
) -> Result<usize, KubeconfigError> {
    let (contexts, errors) = load_contexts_from_multiple_files(paths, source)?;
    Ok(store_contexts(store, contexts, &errors))
}

/// Make the store's contexts of `source` match the given kubeconfig files
///
/// Contexts of that source which are no longer in any file are removed,
/// then every context in the files is (re)stored. Contexts from other
/// sources and internal ones are left alone. Missing files count as empty;
/// a file that exists but cannot be parsed fails the sync before anything
/// is removed.
pub fn sync_contexts(
    store: &ContextStore,
    paths: &[PathBuf],
    source: ContextSource,
) -> Result<usize, KubeconfigError> {
    let present: Vec<PathBuf> = paths.iter().filter(|p| p.exists()).cloned().collect();
    let (contexts, errors) = load_contexts_from_multiple_files(&present, source)?;

    let fresh: HashSet<&str> = contexts.iter().map(Context::display_name).collect();
    for existing in store.get_contexts() {
        if existing.source != source || existing.internal {
            continue;
        }
        let name = existing.display_name();
        if !fresh.contains(name) {
            tracing::info!("Removing context {} no longer in kubeconfig", name);
            store.remove_context(name);
        }
    }

    Ok(store_contexts(store, contexts, &errors))
}

fn store_contexts(store: &ContextStore, contexts: Vec<Context>, errors: &[ContextLoadError]) -> usize {
    for error in errors {
        tracing::warn!("Skipping kubeconfig context: {}", error);
    }

    let count = contexts.len();
    for context in contexts {
        tracing::debug!(
            "Loaded context {} ({})",
            context.display_name(),
            context.cluster.server
        );
        store.add_context(context);
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kubeconfig::{AuthInfo, ClusterInfo};

    fn context(name: &str) -> Context {
        Context {
            name: name.to_string(),
            cluster_name: name.to_string(),
            user_name: String::new(),
            custom_name: None,
            cluster: ClusterInfo {
                server: format!("https://{}:6443", name),
                ..Default::default()
            },
            auth: AuthInfo::default(),
            source: ContextSource::KubeConfig,
            internal: false,
        }
    }

    #[test]
    fn test_add_and_get() {
        let store = ContextStore::new();
        store.add_context(context("kind"));

        let ctx = store.get_context("kind").unwrap();
        assert_eq!(ctx.cluster.server, "https://kind:6443");

        let err = store.get_context("nope").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_add_uses_custom_name() {
        let store = ContextStore::new();
        let mut ctx = context("long-generated-name");
        ctx.custom_name = Some("prod".to_string());
        store.add_context(ctx);

        assert!(store.get_context("prod").is_ok());
        assert!(store.get_context("long-generated-name").is_err());
    }

    #[test]
    fn test_get_contexts_sorted() {
        let store = ContextStore::new();
        store.add_context(context("b"));
        store.add_context(context("a"));

        let names: Vec<_> = store.get_contexts().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_remove_context() {
        let store = ContextStore::new();
        store.add_context(context("a"));
        store.remove_context("a");
        store.remove_context("a");
        assert!(store.get_contexts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_context_expires_and_refreshes() {
        let store = ContextStore::new();
        store.add_context_with_key_and_ttl(context("c"), "cu1", Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(8)).await;
        store.update_ttl("cu1", Duration::from_secs(10)).unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.get_context("cu1").is_ok());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.get_context("cu1").is_err());
        assert!(store.update_ttl("cu1", Duration::from_secs(10)).is_err());
    }

    #[test]
    fn test_load_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            r#"
clusters:
- name: c
  cluster:
    server: https://c:6443
contexts:
- name: one
  context:
    cluster: c
- name: two
  context:
    cluster: c
- name: broken
  context:
    cluster: missing
"#,
        )
        .unwrap();

        let store = ContextStore::new();
        let count = load_and_store_kubeconfigs(&store, &[path], ContextSource::KubeConfig).unwrap();
        assert_eq!(count, 2);
        assert_eq!(store.get_contexts().len(), 2);
    }

    #[test]
    fn test_sync_removes_vanished_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let write = |names: &[&str]| {
            let mut yaml = String::from("clusters:\n- name: c\n  cluster:\n    server: https://c:6443\ncontexts:\n");
            for name in names {
                yaml.push_str(&format!("- name: {}\n  context:\n    cluster: c\n", name));
            }
            std::fs::write(&path, yaml).unwrap();
        };

        let store = ContextStore::new();
        let mut dynamic = context("added-at-runtime");
        dynamic.source = ContextSource::DynamicCluster;
        store.add_context(dynamic);
        let mut stateless = context("stateless");
        stateless.internal = true;
        store.add_context_with_key_and_ttl(stateless, "statelessu1", Duration::ZERO);

        write(&["one", "two"]);
        assert_eq!(
            sync_contexts(&store, &[path.clone()], ContextSource::KubeConfig).unwrap(),
            2
        );
        assert!(store.get_context("two").is_ok());

        write(&["one", "three"]);
        sync_contexts(&store, &[path.clone()], ContextSource::KubeConfig).unwrap();
        assert!(store.get_context("one").is_ok());
        assert!(store.get_context("two").is_err());
        assert!(store.get_context("three").is_ok());
        assert!(store.get_context("added-at-runtime").is_ok());
        assert!(store.get_context("statelessu1").is_ok());

        // A broken file removes nothing
        std::fs::write(&path, "contexts: [").unwrap();
        assert!(sync_contexts(&store, &[path.clone()], ContextSource::KubeConfig).is_err());
        assert!(store.get_context("one").is_ok());

        // A deleted file takes its contexts with it
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            sync_contexts(&store, &[path], ContextSource::KubeConfig).unwrap(),
            0
        );
        assert!(store.get_context("one").is_err());
        assert!(store.get_context("added-at-runtime").is_ok());
    }
}
