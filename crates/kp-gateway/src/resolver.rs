//! Per-request context resolution
//!
//! Maps a cluster name to the key of a stored [`Context`]. Persistent
//! clusters are stored under their own name. A client may instead ship its
//! own kubeconfig (base64, in the `KUBECONFIG` header); the matching context
//! is then stored as an internal entry under `cluster + user` with a sliding
//! TTL, so one user can never reach another user's ephemeral cluster by name.
//!
//! Browsers cannot set headers on a WebSocket upgrade, so for upgrades the
//! user fragment travels as a sub-protocol entry
//! (`base64url.kubeplex.authorization.k8s.io.<fragment>`). It is stripped from
//! the protocol list before anything is forwarded upstream.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use kp_core::config::GatewayConfig;
use kp_core::error::ContextStoreError;
use kp_core::kubeconfig::{load_contexts_from_base64, Context, ContextSource, ContextStore};

use crate::error::ResolveError;

/// Header carrying a base64 client-supplied kubeconfig
pub const KUBECONFIG_HEADER: &str = "KUBECONFIG";

/// Header carrying the caller's user id
pub const USER_ID_HEADER: &str = "X-KUBEPLEX-USER-ID";

/// Sub-protocol prefix carrying the user fragment on WebSocket upgrades
pub const STATELESS_PROTOCOL_PREFIX: &str = "base64url.kubeplex.authorization.k8s.io.";

/// Outcome of resolving an HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    /// Key of the context in the store
    pub context_key: String,
    /// `Sec-WebSocket-Protocol` value with the kubeplex entry removed
    pub protocols: Option<String>,
}

/// Resolves requests to stored contexts
pub struct ContextResolver {
    store: ContextStore,
    enable_dynamic_clusters: bool,
    stateless_ttl: Duration,
    stateless_refresh_ttl: Duration,
}

impl ContextResolver {
    /// Create a resolver over a context store
    pub fn new(store: ContextStore, config: &GatewayConfig) -> Self {
        Self {
            store,
            enable_dynamic_clusters: config.enable_dynamic_clusters,
            stateless_ttl: config.stateless_context_ttl,
            stateless_refresh_ttl: config.stateless_context_refresh_ttl,
        }
    }

    /// The underlying store
    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Whether client-supplied kubeconfigs are honoured
    pub fn dynamic_clusters_enabled(&self) -> bool {
        self.enable_dynamic_clusters
    }

    /// Look up a context by exact key
    pub fn get_context(&self, key: &str) -> Result<Arc<Context>, ContextStoreError> {
        self.store.get_context(key)
    }

    /// Look up by bare cluster name, then by the `cluster + user` key
    pub fn get_context_with_fallback(
        &self,
        cluster: &str,
        user_id: &str,
    ) -> Result<Arc<Context>, ContextStoreError> {
        match self.store.get_context(cluster) {
            Ok(ctx) => Ok(ctx),
            Err(_) => self.store.get_context(&stateless_key(cluster, user_id)),
        }
    }

    /// Resolve the context key for a request
    ///
    /// Without a kubeconfig (or with dynamic clusters disabled) the key is the
    /// cluster name. Otherwise the supplied context is registered, or has its
    /// TTL refreshed if already present, under `cluster + user`.
    pub fn resolve_for_request(
        &self,
        cluster: &str,
        user_id: &str,
        kubeconfig: Option<&str>,
    ) -> Result<String, ResolveError> {
        let kubeconfig = match kubeconfig.filter(|k| !k.is_empty()) {
            Some(k) if self.enable_dynamic_clusters => k,
            _ => return Ok(cluster.to_string()),
        };

        let key = stateless_key(cluster, user_id);

        if self
            .store
            .update_ttl(&key, self.stateless_refresh_ttl)
            .is_ok()
        {
            tracing::debug!("Refreshed stateless context {}", key);
            return Ok(key);
        }

        let (contexts, errors) =
            load_contexts_from_base64(kubeconfig, ContextSource::DynamicCluster)?;

        for error in &errors {
            tracing::warn!("Client kubeconfig: {}", error);
        }

        let found = contexts
            .into_iter()
            .find(|ctx| ctx.name == cluster || ctx.display_name() == cluster);

        let Some(mut context) = found else {
            if let Some(failed) = errors.into_iter().find(|e| e.context_name == cluster) {
                return Err(failed.error.into());
            }
            return Err(ResolveError::ContextNotFound(cluster.to_string()));
        };

        context.internal = true;
        self.store
            .add_context_with_key_and_ttl(context, &key, self.stateless_ttl);
        tracing::info!("Registered stateless context {}", key);

        Ok(key)
    }

    /// Resolve an HTTP request's context key from its headers
    pub fn resolve_headers(
        &self,
        headers: &HeaderMap,
        cluster: &str,
    ) -> Result<ResolvedRequest, ResolveError> {
        let kubeconfig = header_str(headers, KUBECONFIG_HEADER);
        let user_id = header_str(headers, USER_ID_HEADER).unwrap_or_default();

        let context_key = self.resolve_for_request(cluster, user_id, kubeconfig)?;

        if is_websocket_upgrade(headers) {
            let protocols = header_str(headers, http::header::SEC_WEBSOCKET_PROTOCOL.as_str());
            let (context_key, protocols) = websocket_context_key(cluster, protocols);
            return Ok(ResolvedRequest {
                context_key,
                protocols,
            });
        }

        Ok(ResolvedRequest {
            context_key,
            protocols: None,
        })
    }
}

/// Key of an ephemeral context for a user
pub fn stateless_key(cluster: &str, user_id: &str) -> String {
    format!("{}{}", cluster, user_id)
}

/// Context key for a WebSocket upgrade, plus the protocol list to forward
///
/// The key is `cluster + fragment` when a kubeplex sub-protocol is present
/// and the bare cluster name otherwise. The returned list has the kubeplex
/// entry removed (`None` when nothing is left).
pub fn websocket_context_key(cluster: &str, protocols: Option<&str>) -> (String, Option<String>) {
    let entries: Vec<&str> = protocols
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();

    let fragment = entries.iter().copied().find_map(|p| {
        let rest = p.strip_prefix(STATELESS_PROTOCOL_PREFIX)?;
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(rest.len());
        Some(&rest[..end]).filter(|f| !f.is_empty())
    });

    let key = match fragment {
        Some(fragment) => stateless_key(cluster, fragment),
        None => cluster.to_string(),
    };

    let remaining: Vec<&str> = entries
        .into_iter()
        .filter(|p| !p.starts_with(STATELESS_PROTOCOL_PREFIX))
        .collect();
    let remaining = (!remaining.is_empty()).then(|| remaining.join(", "));

    (key, remaining)
}

/// Whether the headers ask for a WebSocket upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
