//! Core error types for kubeplex

use kp_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the kubeplex ecosystem
#[derive(Error, Debug)]
pub enum KpError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Context store error
    #[error("Context error: {0}")]
    Context(#[from] ContextStoreError),

    /// Kubeconfig error
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Expiring cache errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Key absent or already expired
    #[error("key not found")]
    NotFound,
}

/// Context store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextStoreError {
    /// No unexpired context under this key
    #[error("context not found: {0}")]
    NotFound(String),
}

impl ContextStoreError {
    /// Whether this error means the key is simply absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContextStoreError::NotFound(_))
    }
}

/// Kubeconfig loading errors
#[derive(Error, Debug)]
pub enum KubeconfigError {
    /// Problem in a context entry
    #[error("Error in context '{context}': {reason}")]
    Context { context: String, reason: String },

    /// Problem in a cluster entry
    #[error("Error in cluster '{cluster}': {reason}")]
    Cluster { cluster: String, reason: String },

    /// Problem in a user entry
    #[error("Error in user '{user}': {reason}")]
    User { user: String, reason: String },

    /// Document-level problem
    #[error("Error in field '{field}': {reason}")]
    Data { field: String, reason: String },

    /// One or more `*-data` fields are not valid base64
    #[error("Base64 decoding errors in context '{context}': {}", .errors.join("; "))]
    Base64 {
        context: String,
        errors: Vec<String>,
    },

    /// The supplied kubeconfig itself is not valid base64
    #[error("Error decoding base64 kubeconfig: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// YAML parse error
    #[error("Error unmarshaling YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Referenced file could not be read
    #[error("Error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No usable context was found
    #[error("No contexts found in kubeconfig")]
    NoContexts,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
