//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding or validating client frames
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame is not a valid JSON message
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),

    /// Frame is missing the fields needed to identify a session
    #[error("Frame is missing session identity: {0}")]
    MissingIdentity(&'static str),

    /// Frame exceeds the maximum accepted size
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Binary payload is not valid base64
    #[error("Invalid base64 payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
}
