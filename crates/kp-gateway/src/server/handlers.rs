//! Route handlers

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{future, SinkExt, StreamExt};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use kp_core::error::KubeconfigError;
use kp_core::kubeconfig::{
    kubeconfig_for_cluster, load_contexts_from_base64, load_contexts_from_bytes,
    remove_context_from_file, write_to_file, Context, ContextSource, PERSISTED_KUBECONFIG,
};

use crate::multiplexer::ClientHandle;
use crate::state::GatewayState;

/// One cluster as shown to the console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub name: String,
    pub server: String,
    pub source: ContextSource,
}

impl From<&Context> for ClusterSummary {
    fn from(context: &Context) -> Self {
        Self {
            name: context.display_name().to_string(),
            server: context.cluster.server.clone(),
            source: context.source,
        }
    }
}

/// Body of `GET /config` and `POST /parseKubeconfig`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub clusters: Vec<ClusterSummary>,
    pub is_dynamic_cluster_enabled: bool,
}

/// Body of `POST /parseKubeconfig`
#[derive(Debug, Clone, Deserialize)]
pub struct KubeconfigRequest {
    /// Base64-encoded kubeconfig documents
    #[serde(default)]
    pub kubeconfigs: Vec<String>,
}

/// Body of `POST /cluster`
///
/// Either `kubeconfig` (base64) or `name` plus `server` describe the cluster.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterRequest {
    pub name: Option<String>,
    pub server: Option<String>,
    #[serde(default, rename = "insecure-skip-tls-verify", alias = "insecureTLSVerify")]
    pub insecure_skip_tls_verify: bool,
    #[serde(rename = "certificate-authority-data", alias = "certificateAuthorityData")]
    pub certificate_authority_data: Option<String>,
    pub kubeconfig: Option<String>,
}

/// Body of `GET /clusters/:cluster/context`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextKeyResponse {
    pub context_key: String,
    pub server: String,
}

/// Plain-text error response
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub async fn healthz() -> &'static str {
    "ok"
}

/// Persistent clusters, internal ones hidden
pub async fn get_config(State(state): State<Arc<GatewayState>>) -> Json<ClientConfig> {
    Json(client_config(&state))
}

fn client_config(state: &GatewayState) -> ClientConfig {
    let clusters = state
        .contexts
        .get_contexts()
        .iter()
        .filter(|ctx| !ctx.internal)
        .map(|ctx| ClusterSummary::from(ctx.as_ref()))
        .collect();

    ClientConfig {
        clusters,
        is_dynamic_cluster_enabled: state.config.enable_dynamic_clusters,
    }
}

/// Add a cluster at runtime and persist it to the dynamic kubeconfig
pub async fn add_cluster(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<ClusterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ClientConfig>), ApiError> {
    let Json(request) = body.map_err(|e| {
        tracing::warn!("Invalid cluster body: {}", e);
        ApiError::bad_request("Invalid JSON request body")
    })?;

    let data = match (&request.kubeconfig, &request.name, &request.server) {
        (Some(encoded), _, _) => STANDARD
            .decode(encoded.trim())
            .map_err(|e| ApiError::bad_request(format!("decoding kubeconfig: {}", e)))?,
        (None, Some(name), Some(server)) if !name.is_empty() && !server.is_empty() => {
            kubeconfig_for_cluster(
                name,
                server,
                request.insecure_skip_tls_verify,
                request.certificate_authority_data.as_deref(),
            )
            .map_err(|e| ApiError::internal(e.to_string()))?
            .into_bytes()
        }
        _ => {
            return Err(ApiError::bad_request(
                "either kubeconfig or name and server are required",
            ))
        }
    };

    let (contexts, errors) = load_contexts_from_bytes(&data, ContextSource::DynamicCluster, None)
        .map_err(|e| {
            tracing::warn!("Adding cluster: {}", e);
            ApiError::bad_request(e.to_string())
        })?;
    if let Some(error) = errors.first() {
        tracing::warn!("Adding cluster: {}", error);
        return Err(ApiError::bad_request(error.to_string()));
    }
    if contexts.is_empty() {
        return Err(ApiError::bad_request(KubeconfigError::NoContexts.to_string()));
    }
    if let Some(taken) = contexts
        .iter()
        .find(|ctx| state.contexts.get_context(ctx.display_name()).is_ok())
    {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("cluster {} already exists", taken.display_name()),
        ));
    }

    let dir = state.config.dynamic_kubeconfig_dir();
    let path = write_to_file(&data, &dir).map_err(|e| {
        tracing::error!("Persisting cluster to {:?}: {}", dir, e);
        ApiError::internal("writing kubeconfig")
    })?;

    for context in contexts {
        tracing::info!(
            "Added cluster {} ({}) to {:?}",
            context.display_name(),
            context.cluster.server,
            path
        );
        state.contexts.add_context(context);
    }

    Ok((StatusCode::CREATED, Json(client_config(&state))))
}

/// Remove a cluster, and drop it from the dynamic kubeconfig if it came from there
pub async fn delete_cluster(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Result<Json<ClientConfig>, ApiError> {
    let context = state
        .contexts
        .get_context(&name)
        .ok()
        .filter(|ctx| !ctx.internal)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("cluster {} not found", name)))?;

    state.contexts.remove_context(context.display_name());

    if context.source == ContextSource::DynamicCluster {
        let path = state.config.dynamic_kubeconfig_dir().join(PERSISTED_KUBECONFIG);
        match remove_context_from_file(&context.name, &path) {
            Ok(()) => {}
            Err(KubeconfigError::Context { reason, .. }) => {
                tracing::debug!("Cluster {} not in {:?}: {}", name, path, reason);
            }
            Err(e) => {
                tracing::error!("Removing cluster {} from {:?}: {}", name, path, e);
                return Err(ApiError::internal("writing kubeconfig"));
            }
        }
    }

    tracing::info!("Removed cluster {}", name);
    Ok(Json(client_config(&state)))
}

/// Parse client kubeconfigs without storing them
pub async fn parse_kubeconfig(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<KubeconfigRequest>, JsonRejection>,
) -> Result<Json<ClientConfig>, ApiError> {
    let Json(request) = body.map_err(|e| {
        tracing::warn!("Invalid parseKubeconfig body: {}", e);
        ApiError::bad_request("Invalid JSON request body")
    })?;

    let mut clusters = Vec::new();
    let mut failures = Vec::new();

    for encoded in &request.kubeconfigs {
        match load_contexts_from_base64(encoded, ContextSource::DynamicCluster) {
            Ok((contexts, errors)) => {
                clusters.extend(contexts.iter().map(ClusterSummary::from));
                failures.extend(errors.iter().map(|e| e.to_string()));
            }
            Err(e) => failures.push(e.to_string()),
        }
    }

    if !failures.is_empty() {
        tracing::warn!("Setting up contexts from kubeconfig: {}", failures.join("; "));
        return Err(ApiError::bad_request("setting up contexts from kubeconfig"));
    }

    Ok(Json(ClientConfig {
        clusters,
        is_dynamic_cluster_enabled: state.config.enable_dynamic_clusters,
    }))
}

/// Resolve (and for client kubeconfigs, register) the context for a cluster
pub async fn resolve_context(
    State(state): State<Arc<GatewayState>>,
    Path(cluster): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ContextKeyResponse>, ApiError> {
    let resolved = state
        .resolver
        .resolve_headers(&headers, &cluster)
        .map_err(|e| {
            tracing::warn!("Resolving context for {}: {}", cluster, e);
            ApiError::bad_request(e.to_string())
        })?;

    let context = state
        .resolver
        .get_context(&resolved.context_key)
        .map_err(|e| ApiError::new(StatusCode::NOT_FOUND, e.to_string()))?;

    Ok(Json(ContextKeyResponse {
        context_key: resolved.context_key,
        server: context.cluster.server.clone(),
    }))
}

/// Upgrade to the multiplexer WebSocket
pub async fn ws_multiplexer(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    ws.max_message_size(state.config.max_frame_size)
        .on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (sink, stream) = socket.split();

    let sink = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(WsMessage::Text(text))));
    let client = Arc::new(ClientHandle::from_sink(sink));

    let incoming = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(WsMessage::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::debug!("Dropping non UTF-8 binary frame");
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    tokio::select! {
        _ = state.multiplexer.accept_client(client, incoming) => {}
        _ = state.shutdown.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use kp_core::config::GatewayConfig;
    use kp_core::kubeconfig::{AuthInfo, ClusterInfo, ContextStore};
    use std::time::Duration;
    use tower::ServiceExt;

    const KUBECONFIG: &str = r#"
clusters:
- name: eph
  cluster:
    server: https://eph.example:6443
users:
- name: u
  user:
    token: t0k3n
contexts:
- name: eph
  context:
    cluster: eph
    user: u
"#;

    fn context(name: &str, internal: bool) -> Context {
        Context {
            name: name.to_string(),
            cluster_name: name.to_string(),
            user_name: "admin".to_string(),
            custom_name: None,
            cluster: ClusterInfo {
                server: format!("https://{}.example:6443", name),
                ..Default::default()
            },
            auth: AuthInfo::default(),
            source: ContextSource::KubeConfig,
            internal,
        }
    }

    fn state() -> Arc<GatewayState> {
        let store = ContextStore::new();
        store.add_context(context("minikube", false));
        store.add_context_with_key_and_ttl(
            context("hidden", true),
            "hiddenu1",
            Duration::from_secs(60),
        );
        Arc::new(GatewayState::new(GatewayConfig::default(), store))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let response = router(state())
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_config_hides_internal_clusters() {
        let response = router(state())
            .oneshot(Request::get("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let config: ClientConfig = body_json(response).await;
        assert!(config.is_dynamic_cluster_enabled);
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].name, "minikube");
        assert_eq!(config.clusters[0].server, "https://minikube.example:6443");
    }

    #[tokio::test]
    async fn test_parse_kubeconfig() {
        let body = serde_json::json!({ "kubeconfigs": [STANDARD.encode(KUBECONFIG)] });
        let request = Request::post("/parseKubeconfig")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let state = state();
        let response = router(Arc::clone(&state)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let config: ClientConfig = body_json(response).await;
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].name, "eph");
        assert_eq!(config.clusters[0].source, ContextSource::DynamicCluster);

        // Nothing is stored
        assert!(state.contexts.get_context("eph").is_err());
    }

    #[tokio::test]
    async fn test_parse_kubeconfig_rejects_bad_input() {
        let body = serde_json::json!({ "kubeconfigs": ["%%% not base64"] });
        let request = Request::post("/parseKubeconfig")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::post("/parseKubeconfig")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_resolve_persistent_cluster() {
        let response = router(state())
            .oneshot(
                Request::get("/clusters/minikube/context")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let resolved: ContextKeyResponse = body_json(response).await;
        assert_eq!(resolved.context_key, "minikube");
    }

    #[tokio::test]
    async fn test_resolve_registers_stateless_cluster() {
        let state = state();
        let request = || {
            Request::get("/clusters/eph/context")
                .header("KUBECONFIG", STANDARD.encode(KUBECONFIG))
                .header("X-KUBEPLEX-USER-ID", "u9")
                .body(Body::empty())
                .unwrap()
        };

        let response = router(Arc::clone(&state)).oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let resolved: ContextKeyResponse = body_json(response).await;
        assert_eq!(resolved.context_key, "ephu9");
        assert_eq!(resolved.server, "https://eph.example:6443");

        // Reuse refreshes instead of duplicating
        let response = router(Arc::clone(&state)).oneshot(request()).await.unwrap();
        let again: ContextKeyResponse = body_json(response).await;
        assert_eq!(again.context_key, "ephu9");

        let stored = state.contexts.get_context("ephu9").unwrap();
        assert!(stored.internal);

        // Never listed
        let response = router(state)
            .oneshot(Request::get("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let config: ClientConfig = body_json(response).await;
        assert!(config.clusters.iter().all(|c| c.name != "eph"));
    }

    fn dynamic_state(dir: &tempfile::TempDir, enabled: bool) -> Arc<GatewayState> {
        let config = GatewayConfig {
            enable_dynamic_clusters: enabled,
            dynamic_kubeconfig_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let store = ContextStore::new();
        store.add_context(context("minikube", false));
        Arc::new(GatewayState::new(config, store))
    }

    fn post_cluster(body: serde_json::Value) -> Request<Body> {
        Request::post("/cluster")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn delete_cluster(name: &str) -> Request<Body> {
        Request::delete(format!("/cluster/{}", name))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_cluster_from_server() {
        let dir = tempfile::tempdir().unwrap();
        let state = dynamic_state(&dir, true);

        let body = serde_json::json!({
            "name": "kind",
            "server": "https://127.0.0.1:6443",
            "insecure-skip-tls-verify": true,
        });
        let response = router(Arc::clone(&state))
            .oneshot(post_cluster(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let config: ClientConfig = body_json(response).await;
        let added = config.clusters.iter().find(|c| c.name == "kind").unwrap();
        assert_eq!(added.server, "https://127.0.0.1:6443");
        assert_eq!(added.source, ContextSource::DynamicCluster);

        let stored = state.contexts.get_context("kind").unwrap();
        assert!(stored.cluster.insecure_skip_tls_verify);
        assert!(dir.path().join(PERSISTED_KUBECONFIG).exists());
    }

    #[tokio::test]
    async fn test_add_cluster_from_kubeconfig_persists() {
        let dir = tempfile::tempdir().unwrap();
        let state = dynamic_state(&dir, true);

        let body = serde_json::json!({ "kubeconfig": STANDARD.encode(KUBECONFIG) });
        let response = router(Arc::clone(&state))
            .oneshot(post_cluster(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!state.contexts.get_context("eph").unwrap().internal);

        let (persisted, _) = kp_core::kubeconfig::load_contexts_from_file(
            &dir.path().join(PERSISTED_KUBECONFIG),
            ContextSource::DynamicCluster,
        )
        .unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].auth.token.as_deref(), Some("t0k3n"));

        // Adding it again conflicts
        let body = serde_json::json!({ "kubeconfig": STANDARD.encode(KUBECONFIG) });
        let response = router(state).oneshot(post_cluster(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_add_cluster_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let state = dynamic_state(&dir, true);

        for body in [
            serde_json::json!({ "kubeconfig": "%%% not base64" }),
            serde_json::json!({ "kubeconfig": STANDARD.encode("clusters: [") }),
            serde_json::json!({ "name": "only-a-name" }),
            serde_json::json!({}),
        ] {
            let response = router(Arc::clone(&state))
                .oneshot(post_cluster(body.clone()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", body);
        }

        assert!(!dir.path().join(PERSISTED_KUBECONFIG).exists());
    }

    #[tokio::test]
    async fn test_delete_cluster_removes_from_store_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = dynamic_state(&dir, true);

        for name in ["one", "two"] {
            let body = serde_json::json!({ "name": name, "server": format!("https://{}:6443", name) });
            let response = router(Arc::clone(&state))
                .oneshot(post_cluster(body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = router(Arc::clone(&state))
            .oneshot(delete_cluster("one"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let config: ClientConfig = body_json(response).await;
        assert!(config.clusters.iter().all(|c| c.name != "one"));
        assert!(state.contexts.get_context("one").is_err());

        let (persisted, _) = kp_core::kubeconfig::load_contexts_from_file(
            &dir.path().join(PERSISTED_KUBECONFIG),
            ContextSource::DynamicCluster,
        )
        .unwrap();
        let names: Vec<_> = persisted.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["two"]);

        // Persistent clusters leave the file untouched
        let response = router(Arc::clone(&state))
            .oneshot(delete_cluster("minikube"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.contexts.get_context("minikube").is_err());
    }

    #[tokio::test]
    async fn test_delete_unknown_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(dynamic_state(&dir, true))
            .oneshot(delete_cluster("nowhere"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cluster_routes_need_dynamic_clusters() {
        let dir = tempfile::tempdir().unwrap();
        let state = dynamic_state(&dir, false);

        let body = serde_json::json!({ "name": "kind", "server": "https://127.0.0.1:6443" });
        let response = router(Arc::clone(&state))
            .oneshot(post_cluster(body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router(Arc::clone(&state))
            .oneshot(delete_cluster("minikube"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(state.contexts.get_context("minikube").is_ok());
        assert!(state.contexts.get_context("kind").is_err());
    }

    #[tokio::test]
    async fn test_resolve_unknown_cluster() {
        let response = router(state())
            .oneshot(
                Request::get("/clusters/nowhere/context")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
