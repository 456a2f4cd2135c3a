//! Message types for the kubeplex client protocol
//!
//! One JSON object is exchanged per WebSocket frame. The console sends
//! `REQUEST` to open (or reuse) a session, `DATA` to write to it, and `CLOSE`
//! to tear it down. The gateway answers with `DATA` for every upstream frame,
//! `COMPLETE` when a new resource version starts, and `STATUS` on every
//! session state change.
//!
//! # Example
//!
//! ```text
//! {"type":"REQUEST","clusterId":"minikube","path":"/api/v1/pods",
//!  "query":"watch=true","userId":"u1"}
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::session::{SessionKey, SessionState};

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Open or reuse the session for the frame's key
    Request,
    /// Payload to or from the upstream stream
    Data,
    /// Session state change
    Status,
    /// A fresh resource version follows
    Complete,
    /// Tear down the session for the frame's key
    Close,
}

/// One frame on the client-facing connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Cluster identifier
    #[serde(default)]
    pub cluster_id: String,
    /// API path on the cluster
    #[serde(default)]
    pub path: String,
    /// Raw query string (without the leading `?`)
    #[serde(default)]
    pub query: String,
    /// User identifier
    #[serde(default)]
    pub user_id: String,
    /// Payload; base64 when `binary` is set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    /// Whether `data` carries base64-encoded binary
    #[serde(default)]
    pub binary: bool,
    /// Message kind
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Optional bearer token for the upstream dial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Message {
    /// Build an empty message of the given kind for a session
    pub fn for_session(kind: MessageType, key: &SessionKey, query: &str) -> Self {
        Self {
            cluster_id: key.cluster_id.clone(),
            path: key.path.clone(),
            query: query.to_string(),
            user_id: key.user_id.clone(),
            data: String::new(),
            binary: false,
            kind,
            token: None,
        }
    }

    /// Wrap an upstream payload in a `DATA` envelope
    ///
    /// Binary payloads are base64-encoded; text passes through unchanged.
    pub fn data(key: &SessionKey, query: &str, payload: &[u8], binary: bool) -> Self {
        let mut msg = Self::for_session(MessageType::Data, key, query);
        msg.binary = binary;
        msg.data = if binary {
            STANDARD.encode(payload)
        } else {
            String::from_utf8_lossy(payload).into_owned()
        };
        msg
    }

    /// Build a `COMPLETE` marker for a session
    pub fn complete(key: &SessionKey, query: &str) -> Self {
        Self::for_session(MessageType::Complete, key, query)
    }

    /// Build a `STATUS` frame for a session
    pub fn status(key: &SessionKey, query: &str, state: SessionState, error: Option<&str>) -> Self {
        let payload = StatusPayload {
            state,
            error: error.unwrap_or_default().to_string(),
        };
        let mut msg = Self::for_session(MessageType::Status, key, query);
        // StatusPayload only holds plain strings, serialization cannot fail
        msg.data = serde_json::to_string(&payload).unwrap_or_default();
        msg
    }

    /// Session identity carried by this frame
    pub fn session_key(&self) -> Result<SessionKey, ProtocolError> {
        if self.cluster_id.is_empty() {
            return Err(ProtocolError::MissingIdentity("clusterId"));
        }
        if self.path.is_empty() {
            return Err(ProtocolError::MissingIdentity("path"));
        }
        Ok(SessionKey::new(
            self.cluster_id.clone(),
            self.path.clone(),
            self.user_id.clone(),
        ))
    }

    /// Raw payload bytes, decoding base64 for binary frames
    pub fn payload_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.binary {
            Ok(STANDARD.decode(self.data.as_bytes())?)
        } else {
            Ok(self.data.as_bytes().to_vec())
        }
    }

    /// Non-empty bearer token, if any
    pub fn bearer_token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Body of a `STATUS` frame's `data` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    /// New session state
    pub state: SessionState,
    /// Last error text, empty when healthy
    #[serde(default)]
    pub error: String,
}

/// Written back to the client when a session cannot be established
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    /// Cluster the failed request targeted
    pub cluster_id: String,
    /// Human-readable reason
    pub error: String,
}

impl ErrorEnvelope {
    /// Create a new error envelope
    pub fn new(cluster_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            error: error.into(),
        }
    }
}
