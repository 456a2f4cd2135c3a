//! kp-protocol: Client-facing wire protocol for kubeplex
//!
//! This crate defines the JSON frames exchanged between the web console and
//! the gateway over a single multiplexed WebSocket connection. Every frame
//! names the (cluster, path, user) session it belongs to.

pub mod codec;
pub mod error;
pub mod message;
pub mod session;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
pub use error::ProtocolError;
pub use message::{ErrorEnvelope, Message, MessageType, StatusPayload};
pub use session::{SessionKey, SessionState};
