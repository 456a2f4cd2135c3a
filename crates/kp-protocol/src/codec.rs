//! JSON frame codec for the client-facing WebSocket
//!
//! The WebSocket layer already delimits frames, so the codec only has to
//! enforce a size limit and map between text and [`Message`].

use crate::error::ProtocolError;
use crate::message::Message;

/// Default maximum accepted frame size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec for encoding/decoding client frames
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    /// Largest frame accepted by `decode`
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec with the default size limit
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one inbound frame
    pub fn decode(&self, text: &str) -> Result<Message, ProtocolError> {
        if text.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: self.max_frame_size,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode one outbound frame
    pub fn encode<T: serde::Serialize>(&self, msg: &T) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(msg)?)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
