//! Gateway error types

use std::time::Duration;

use kp_core::error::{ContextStoreError, KubeconfigError};
use kp_protocol::ProtocolError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures mapping a request to a stored context
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The client-supplied kubeconfig could not be loaded
    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    /// The kubeconfig loaded but has no context for the requested cluster
    #[error("context {0} not found in supplied kubeconfig")]
    ContextNotFound(String),

    /// Nothing stored under the key
    #[error(transparent)]
    Store(#[from] ContextStoreError),
}

/// Failures dialing or talking to an API server
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Server address or request path does not form a valid URL
    #[error("invalid upstream URL: {0}")]
    Url(String),

    /// TLS material could not be turned into a client configuration
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// Handshake did not finish in time
    #[error("upstream handshake timed out after {0:?}")]
    Timeout(Duration),

    /// WebSocket handshake or transport error
    #[error("upstream WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// The session has no live upstream socket
    #[error("upstream connection is not open")]
    NotConnected,
}

impl From<rustls::Error> for UpstreamError {
    fn from(e: rustls::Error) -> Self {
        UpstreamError::Tls(e.to_string())
    }
}

/// Failures establishing or driving a multiplexed session
#[derive(Error, Debug)]
pub enum SessionError {
    /// No context for the cluster under either key
    #[error("getting cluster config: {0}")]
    Context(#[from] ContextStoreError),

    /// Upstream dial or write failure
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Malformed client frame
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session was closed while the operation ran
    #[error("session closed")]
    Closed,
}
