//! Kubeconfig parsing
//!
//! Turns kubeconfig YAML documents into resolved [`Context`]s: each context
//! entry is joined with its cluster and user entries, `*-data` fields are
//! base64-decoded and file references (CA bundle, client cert/key, token
//! file) are read eagerly, so a `Context` carries everything needed to dial
//! the API server.
//!
//! A single broken context does not fail the document. It is reported as a
//! [`ContextLoadError`] and skipped, while the remaining contexts load.

mod file;
mod store;
mod watcher;

pub use file::{kubeconfig_for_cluster, remove_context_from_file, write_to_file, PERSISTED_KUBECONFIG};
pub use store::{load_and_store_kubeconfigs, sync_contexts, ContextStore};
pub use watcher::{KubeconfigWatcher, DEFAULT_WATCH_INTERVAL};

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::KubeconfigError;

/// Name of the context extension carrying kubeplex metadata
pub const KUBEPLEX_EXTENSION: &str = "kubeplex_info";

/// Where a context came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Server-side kubeconfig file
    #[serde(rename = "kubeconfig")]
    KubeConfig,
    /// Supplied by a client at request time
    DynamicCluster,
}

impl ContextSource {
    /// Wire name of the source
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::KubeConfig => "kubeconfig",
            ContextSource::DynamicCluster => "dynamic_cluster",
        }
    }
}

impl std::fmt::Display for ContextSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API server connection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    /// API server URL
    pub server: String,
    /// PEM bundle of trusted CAs
    pub certificate_authority: Option<Vec<u8>>,
    /// Skip server certificate verification
    pub insecure_skip_tls_verify: bool,
}

/// Credentials presented to the API server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthInfo {
    /// Bearer token
    pub token: Option<String>,
    /// PEM client certificate
    pub client_certificate: Option<Vec<u8>>,
    /// PEM client key
    pub client_key: Option<Vec<u8>>,
}

/// A fully resolved kubeconfig context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    /// DNS-friendly context name
    pub name: String,
    /// Cluster entry the context points at
    pub cluster_name: String,
    /// User entry the context points at
    pub user_name: String,
    /// Display name from the `kubeplex_info` extension
    pub custom_name: Option<String>,
    pub cluster: ClusterInfo,
    pub auth: AuthInfo,
    pub source: ContextSource,
    /// Hidden from cluster listings; only reachable by its exact key
    pub internal: bool,
}

impl Context {
    /// Name the context is stored and listed under
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.name)
    }
}

/// A context that failed to load
#[derive(Debug)]
pub struct ContextLoadError {
    /// Name of the broken context (empty when the name itself was unreadable)
    pub context_name: String,
    pub error: KubeconfigError,
}

impl std::fmt::Display for ContextLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error in context {}: {}", self.context_name, self.error)
    }
}

/// Contexts that loaded and the ones that did not
pub type LoadResult = (Vec<Context>, Vec<ContextLoadError>);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawKubeconfig {
    #[serde(default)]
    clusters: Vec<Value>,
    #[serde(default)]
    users: Vec<Value>,
    #[serde(default)]
    contexts: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    #[serde(default)]
    user: String,
    #[serde(default)]
    extensions: Vec<NamedExtension>,
}

#[derive(Debug, Deserialize)]
struct NamedExtension {
    name: String,
    #[serde(default)]
    extension: Value,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    cluster: ClusterEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    #[serde(default)]
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
}

/// Load contexts from one kubeconfig file
pub fn load_contexts_from_file(
    path: &Path,
    source: ContextSource,
) -> Result<LoadResult, KubeconfigError> {
    let data = std::fs::read(path).map_err(|source| KubeconfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_contexts_from_bytes(&data, source, path.parent())
}

/// Load contexts from several kubeconfig files
///
/// Any unreadable or unparseable file fails the whole load.
pub fn load_contexts_from_multiple_files(
    paths: &[PathBuf],
    source: ContextSource,
) -> Result<LoadResult, KubeconfigError> {
    let mut contexts = Vec::new();
    let mut errors = Vec::new();

    for path in paths {
        let (mut loaded, mut failed) = load_contexts_from_file(path, source)?;
        contexts.append(&mut loaded);
        errors.append(&mut failed);
    }

    Ok((contexts, errors))
}

/// Split a `KUBECONFIG`-style list on the platform path separator
pub fn split_kubeconfig_path(list: &str) -> Vec<PathBuf> {
    std::env::split_paths(list)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

/// Load contexts from a base64-encoded kubeconfig document
pub fn load_contexts_from_base64(
    encoded: &str,
    source: ContextSource,
) -> Result<LoadResult, KubeconfigError> {
    let data = STANDARD.decode(encoded.trim())?;
    load_contexts_from_bytes(&data, source, None)
}

/// Load contexts from raw kubeconfig YAML
///
/// Relative file references resolve against `base_dir` when given.
pub fn load_contexts_from_bytes(
    data: &[u8],
    source: ContextSource,
    base_dir: Option<&Path>,
) -> Result<LoadResult, KubeconfigError> {
    let doc: RawKubeconfig = serde_yaml::from_slice(data)?;

    let raw_contexts = doc.contexts.as_deref().ok_or_else(|| KubeconfigError::Data {
        field: "contexts".to_string(),
        reason: "invalid or missing contexts in kubeconfig".to_string(),
    })?;

    let mut contexts = Vec::new();
    let mut errors = Vec::new();

    for raw in raw_contexts {
        match process_context(raw, &doc, source, base_dir) {
            Ok(context) => contexts.push(context),
            Err(error) => {
                let context_name = raw
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                errors.push(ContextLoadError {
                    context_name,
                    error,
                });
            }
        }
    }

    Ok((contexts, errors))
}

fn process_context(
    raw: &Value,
    doc: &RawKubeconfig,
    source: ContextSource,
    base_dir: Option<&Path>,
) -> Result<Context, KubeconfigError> {
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| KubeconfigError::Data {
            field: "context.name".to_string(),
            reason: "missing or invalid context name".to_string(),
        })?;

    let named: NamedContext =
        serde_yaml::from_value(raw.clone()).map_err(|e| KubeconfigError::Context {
            context: name.to_string(),
            reason: format!("invalid context data: {}", e),
        })?;
    let entry = named.context;

    let cluster_raw =
        find_named(&doc.clusters, &entry.cluster).ok_or_else(|| KubeconfigError::Cluster {
            cluster: entry.cluster.clone(),
            reason: "cluster not found in kubeconfig".to_string(),
        })?;
    let cluster: NamedCluster =
        serde_yaml::from_value(cluster_raw.clone()).map_err(|e| KubeconfigError::Cluster {
            cluster: entry.cluster.clone(),
            reason: format!("invalid cluster data: {}", e),
        })?;
    let cluster = cluster.cluster;

    let user = if entry.user.is_empty() {
        UserEntry::default()
    } else {
        let user_raw =
            find_named(&doc.users, &entry.user).ok_or_else(|| KubeconfigError::User {
                user: entry.user.clone(),
                reason: "user not found in kubeconfig".to_string(),
            })?;
        let user: NamedUser =
            serde_yaml::from_value(user_raw.clone()).map_err(|e| KubeconfigError::User {
                user: entry.user.clone(),
                reason: format!("invalid user data: {}", e),
            })?;
        user.user
    };

    check_base64_fields(name, &entry.cluster, &cluster, &entry.user, &user)?;

    if cluster.server.is_empty() {
        return Err(KubeconfigError::Cluster {
            cluster: entry.cluster,
            reason: "No server URL specified. Please check the cluster configuration.".to_string(),
        });
    }

    let cluster_info = ClusterInfo {
        certificate_authority: inline_or_file(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
        )
        .map_err(|_| KubeconfigError::Cluster {
            cluster: entry.cluster.clone(),
            reason: "Unable to read certificate authority. Please ensure the CA file exists and is readable."
                .to_string(),
        })?,
        server: cluster.server,
        insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
    };

    let auth = resolve_auth(&entry.user, user, base_dir)?;

    let custom_name = entry
        .extensions
        .iter()
        .find(|ext| ext.name == KUBEPLEX_EXTENSION)
        .and_then(|ext| ext.extension.get("customName"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    Ok(Context {
        name: make_dns_friendly(name),
        cluster_name: entry.cluster,
        user_name: entry.user,
        custom_name,
        cluster: cluster_info,
        auth,
        source,
        internal: false,
    })
}

fn resolve_auth(
    user_name: &str,
    user: UserEntry,
    base_dir: Option<&Path>,
) -> Result<AuthInfo, KubeconfigError> {
    let user_error = |reason: &str| KubeconfigError::User {
        user: user_name.to_string(),
        reason: reason.to_string(),
    };

    let token = match (user.token.filter(|t| !t.is_empty()), user.token_file) {
        (Some(token), _) => Some(token),
        (None, Some(path)) => {
            let token = std::fs::read_to_string(resolve_path(&path, base_dir)).map_err(|_| {
                user_error(
                    "Unable to read token. Please ensure the token file exists and is readable.",
                )
            })?;
            Some(token.trim().to_string())
        }
        (None, None) => None,
    };

    let client_certificate = inline_or_file(
        user.client_certificate_data.as_deref(),
        user.client_certificate.as_deref(),
        base_dir,
    )
    .map_err(|_| {
        user_error("Unable to read client certificate. Please ensure the certificate file exists and is readable.")
    })?;

    let client_key = inline_or_file(
        user.client_key_data.as_deref(),
        user.client_key.as_deref(),
        base_dir,
    )
    .map_err(|_| {
        user_error("Unable to read client key. Please ensure the key file exists and is readable.")
    })?;

    Ok(AuthInfo {
        token,
        client_certificate,
        client_key,
    })
}

/// Collect every malformed `*-data` field of a context's cluster and user
fn check_base64_fields(
    context: &str,
    cluster_name: &str,
    cluster: &ClusterEntry,
    user_name: &str,
    user: &UserEntry,
) -> Result<(), KubeconfigError> {
    let mut errors = Vec::new();

    let user_fields = [
        ("client-certificate-data", &user.client_certificate_data),
        ("client-key-data", &user.client_key_data),
    ];
    for (field, value) in user_fields {
        if let Some(value) = value {
            if STANDARD.decode(value.trim()).is_err() {
                errors.push(format!(
                    "user '{}': Invalid base64 encoding in {}. Please ensure it's correctly encoded.",
                    user_name, field
                ));
            }
        }
    }

    if let Some(value) = &cluster.certificate_authority_data {
        if STANDARD.decode(value.trim()).is_err() {
            errors.push(format!(
                "cluster '{}': Invalid base64 encoding in certificate-authority-data. Please ensure it's correctly encoded.",
                cluster_name
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(KubeconfigError::Base64 {
            context: context.to_string(),
            errors,
        })
    }
}

/// Prefer inline base64 data, fall back to reading a file
fn inline_or_file(
    data: Option<&str>,
    path: Option<&Path>,
    base_dir: Option<&Path>,
) -> Result<Option<Vec<u8>>, std::io::Error> {
    if let Some(data) = data {
        // Already validated by check_base64_fields
        return Ok(STANDARD.decode(data.trim()).ok());
    }
    match path {
        Some(path) => std::fs::read(resolve_path(path, base_dir)).map(Some),
        None => Ok(None),
    }
}

fn resolve_path(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn find_named<'a>(entries: &'a [Value], name: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|e| e.get("name").and_then(Value::as_str) == Some(name))
}

/// Make a context name usable as a URL path segment
pub fn make_dns_friendly(name: &str) -> String {
    name.replace('/', "--").replace(' ', "__")
}
