//! Client-facing connection handle
//!
//! Every session relaying to the same browser connection writes through one
//! [`ClientHandle`]. Its write lock serializes whole frames, so frames from
//! concurrent sessions never interleave.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use kp_protocol::{FrameCodec, ProtocolError};

/// Boxed error produced by a client sink
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outbound half of a client connection, one JSON text frame per item
pub type ClientSink = Pin<Box<dyn Sink<String, Error = BoxError> + Send>>;

/// Identifier of one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared writer for one client connection
pub struct ClientHandle {
    id: ClientId,
    writer: Mutex<ClientSink>,
    codec: FrameCodec,
    closed: AtomicBool,
}

impl ClientHandle {
    /// Wrap any sink of text frames
    pub fn from_sink<S>(sink: S) -> Self
    where
        S: Sink<String> + Send + 'static,
        S::Error: Into<BoxError>,
    {
        Self {
            id: ClientId::new(),
            writer: Mutex::new(Box::pin(sink.sink_map_err(|e| -> BoxError { e.into() }))),
            codec: FrameCodec::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Connection id
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether a write has failed or the handle was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Encode and send one frame
    ///
    /// A dead connection is not an error: the frame is dropped and the
    /// failure logged once.
    pub async fn send<T: Serialize>(&self, frame: &T) -> Result<(), ProtocolError> {
        let text = self.codec.encode(frame)?;
        self.send_text(text).await;
        Ok(())
    }

    /// Send one pre-encoded frame
    pub async fn send_text(&self, text: String) {
        if self.is_closed() {
            return;
        }

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(text).await {
            if !self.closed.swap(true, Ordering::AcqRel) {
                tracing::info!("Client {} connection gone, dropping frames: {}", self.id, e);
            }
        }
    }

    /// Stop writing and close the sink
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
