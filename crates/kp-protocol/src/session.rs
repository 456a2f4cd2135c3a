//! Session identity and lifecycle state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one upstream stream: (cluster, resource path, user)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    /// Cluster the stream targets
    pub cluster_id: String,
    /// API path on the cluster (e.g. `/api/v1/pods`)
    pub path: String,
    /// User the stream is opened for
    pub user_id: String,
}

impl SessionKey {
    /// Create a new session key
    pub fn new(
        cluster_id: impl Into<String>,
        path: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            path: path.into(),
            user_id: user_id.into(),
        }
    }

    /// Key under which an ephemeral context for this user is stored
    pub fn stateless_context_key(&self) -> String {
        format!("{}{}", self.cluster_id, self.user_id)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.cluster_id, self.path, self.user_id)
    }
}

/// Health state of a session
///
/// `Closed` is terminal. `Error` and `Connected` alternate while the
/// supervisor reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Upstream dial in progress
    Connecting,
    /// Upstream stream is open
    Connected,
    /// Upstream failed; awaiting reconnect
    Error,
    /// Session torn down
    Closed,
}

impl SessionState {
    /// Whether the state is terminal
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Error => write!(f, "error"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new("minikube", "/api/v1/pods", "u1");
        assert_eq!(format!("{}", key), "minikube:/api/v1/pods:u1");
    }

    #[test]
    fn test_session_key_equality() {
        let a = SessionKey::new("c", "/p", "u");
        let b = SessionKey::new("c", "/p", "u");
        let c = SessionKey::new("c", "/p", "other");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_stateless_context_key() {
        let key = SessionKey::new("dev", "/api/v1/pods", "abc");
        assert_eq!(key.stateless_context_key(), "devabc");
    }

    #[test]
    fn test_session_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&SessionState::Connected).unwrap(),
            r#""connected""#
        );
        assert_eq!(format!("{}", SessionState::Error), "error");
        assert!(SessionState::Closed.is_closed());
        assert!(!SessionState::Error.is_closed());
    }
}
