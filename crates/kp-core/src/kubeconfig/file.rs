//! Persisted kubeconfig for dynamically added clusters
//!
//! Clusters added at runtime are kept in a single kubeconfig file named
//! [`PERSISTED_KUBECONFIG`] inside a directory of their own. Documents are
//! handled as plain YAML values so fields this crate does not model survive
//! a round trip.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use super::make_dns_friendly;
use crate::error::KubeconfigError;

/// File name of the persisted kubeconfig inside its directory
pub const PERSISTED_KUBECONFIG: &str = "config";

const SECTIONS: [&str; 3] = ["clusters", "users", "contexts"];

/// Merge a kubeconfig document into `<dir>/config`, creating it if needed
///
/// Entries already present in the file win over incoming ones with the same
/// name. Returns the path written.
pub fn write_to_file(data: &[u8], dir: &Path) -> Result<PathBuf, KubeconfigError> {
    let incoming: Value = serde_yaml::from_slice(data)?;
    let path = dir.join(PERSISTED_KUBECONFIG);

    let document = match read_document(&path)? {
        Some(mut existing) if existing.is_mapping() => {
            merge_documents(&mut existing, &incoming);
            existing
        }
        _ => incoming,
    };

    std::fs::create_dir_all(dir).map_err(|source| KubeconfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    write_document(&path, &document)?;
    Ok(path)
}

/// Remove a context from a kubeconfig file
///
/// The context's cluster and user entries go too unless another context
/// still refers to them. `context` may be the raw or the DNS-friendly name.
pub fn remove_context_from_file(context: &str, path: &Path) -> Result<(), KubeconfigError> {
    let not_found = || KubeconfigError::Context {
        context: context.to_string(),
        reason: "context not found in kubeconfig".to_string(),
    };

    let mut document = read_document(path)?.ok_or_else(not_found)?;
    let contexts = section_mut(&mut document, "contexts").ok_or_else(not_found)?;

    let index = contexts
        .iter()
        .position(|entry| {
            entry_name(entry).is_some_and(|name| name == context || make_dns_friendly(name) == context)
        })
        .ok_or_else(not_found)?;
    let removed = contexts.remove(index);

    let referenced = |field: &str| {
        removed
            .get("context")
            .and_then(|c| c.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let cluster = referenced("cluster");
    let user = referenced("user");

    let still_used = |contexts: &[Value], field: &str, name: &str| {
        contexts.iter().any(|entry| {
            entry
                .get("context")
                .and_then(|c| c.get(field))
                .and_then(Value::as_str)
                == Some(name)
        })
    };
    let remaining = contexts.clone();

    if let Some(cluster) = cluster.filter(|c| !still_used(&remaining, "cluster", c)) {
        if let Some(clusters) = section_mut(&mut document, "clusters") {
            clusters.retain(|entry| entry_name(entry) != Some(cluster.as_str()));
        }
    }
    if let Some(user) = user.filter(|u| !u.is_empty() && !still_used(&remaining, "user", u)) {
        if let Some(users) = section_mut(&mut document, "users") {
            users.retain(|entry| entry_name(entry) != Some(user.as_str()));
        }
    }

    write_document(path, &document)
}

/// Build a one-context kubeconfig document for a bare API server
///
/// The cluster, context and context name are all `name`, and no user is
/// attached.
pub fn kubeconfig_for_cluster(
    name: &str,
    server: &str,
    insecure_skip_tls_verify: bool,
    certificate_authority_data: Option<&str>,
) -> Result<String, KubeconfigError> {
    let mut cluster = Mapping::new();
    cluster.insert("server".into(), server.into());
    if insecure_skip_tls_verify {
        cluster.insert("insecure-skip-tls-verify".into(), true.into());
    }
    if let Some(data) = certificate_authority_data.filter(|d| !d.is_empty()) {
        cluster.insert("certificate-authority-data".into(), data.into());
    }

    let mut context = Mapping::new();
    context.insert("cluster".into(), name.into());

    let mut document = Mapping::new();
    document.insert("apiVersion".into(), "v1".into());
    document.insert("kind".into(), "Config".into());
    document.insert(
        "clusters".into(),
        Value::Sequence(vec![named(name, "cluster", Value::Mapping(cluster))]),
    );
    document.insert(
        "contexts".into(),
        Value::Sequence(vec![named(name, "context", Value::Mapping(context))]),
    );
    document.insert("current-context".into(), name.into());

    Ok(serde_yaml::to_string(&Value::Mapping(document))?)
}

fn named(name: &str, key: &str, body: Value) -> Value {
    let mut entry = Mapping::new();
    entry.insert("name".into(), name.into());
    entry.insert(key.into(), body);
    Value::Mapping(entry)
}

fn read_document(path: &Path) -> Result<Option<Value>, KubeconfigError> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_yaml::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(KubeconfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_document(path: &Path, document: &Value) -> Result<(), KubeconfigError> {
    let text = serde_yaml::to_string(document)?;
    std::fs::write(path, text).map_err(|source| KubeconfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn merge_documents(existing: &mut Value, incoming: &Value) {
    for section in SECTIONS {
        let Some(entries) = incoming.get(section).and_then(Value::as_sequence) else {
            continue;
        };
        let Some(target) = section_mut(existing, section) else {
            continue;
        };
        for entry in entries {
            let name = entry_name(entry);
            if !target.iter().any(|e| entry_name(e) == name) {
                target.push(entry.clone());
            }
        }
    }

    let has_current = existing
        .get("current-context")
        .and_then(Value::as_str)
        .is_some_and(|c| !c.is_empty());
    if !has_current {
        if let (Some(map), Some(current)) = (existing.as_mapping_mut(), incoming.get("current-context")) {
            map.insert("current-context".into(), current.clone());
        }
    }
}

/// The named list under `section`, created empty if absent
fn section_mut<'a>(document: &'a mut Value, section: &str) -> Option<&'a mut Vec<Value>> {
    let map = document.as_mapping_mut()?;
    let is_list = map.get(section).is_some_and(Value::is_sequence);
    if !is_list {
        map.insert(section.into(), Value::Sequence(Vec::new()));
    }
    map.get_mut(section).and_then(Value::as_sequence_mut)
}

fn entry_name(entry: &Value) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}
