//! Upstream to client relay
//!
//! One task per session reads the current upstream stream in order and
//! writes each frame to the client as a `DATA` envelope. When a reconnect
//! attaches a new stream the task switches to it. A `COMPLETE` envelope
//! precedes the first frame of every new resource version.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use kp_protocol::{Message, SessionState};

use super::session::Session;
use super::upstream::UpstreamStream;

/// Tracks the last `metadata.resourceVersion` seen on a stream
#[derive(Debug, Default)]
pub struct ResourceVersionTracker {
    last: Option<String>,
}

impl ResourceVersionTracker {
    /// Record a payload, returning whether it starts a new resource version
    ///
    /// Both plain objects and watch events (`{"type":..,"object":{..}}`) are
    /// recognised. Anything that is not JSON or carries no version is
    /// ignored.
    pub fn observe(&mut self, payload: &[u8]) -> bool {
        let Some(version) = resource_version(payload) else {
            return false;
        };
        if self.last.as_deref() == Some(version.as_str()) {
            return false;
        }
        self.last = Some(version);
        true
    }

    /// Forget the last version, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.last = None;
    }
}

fn resource_version(payload: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    let version = value
        .pointer("/metadata/resourceVersion")
        .or_else(|| value.pointer("/object/metadata/resourceVersion"))?;
    version.as_str().map(str::to_string)
}

enum RelayEvent {
    Done,
    Attached(Option<UpstreamStream>),
    Frame(Option<Result<WsMessage, WsError>>),
}

/// Relay frames from upstream to the client until the session closes
pub async fn run_relay(session: Arc<Session>, mut streams: mpsc::UnboundedReceiver<UpstreamStream>) {
    let mut current: Option<UpstreamStream> = None;
    let mut tracker = ResourceVersionTracker::default();

    loop {
        let event = match current.as_mut() {
            Some(stream) => tokio::select! {
                biased;
                _ = session.done().cancelled() => RelayEvent::Done,
                next = streams.recv() => RelayEvent::Attached(next),
                frame = stream.next() => RelayEvent::Frame(frame),
            },
            None => tokio::select! {
                biased;
                _ = session.done().cancelled() => RelayEvent::Done,
                next = streams.recv() => RelayEvent::Attached(next),
            },
        };

        match event {
            RelayEvent::Done | RelayEvent::Attached(None) => break,
            RelayEvent::Attached(Some(stream)) => {
                tracing::debug!("Relay for {} switched to new upstream", session.key());
                current = Some(stream);
                tracker.reset();
            }
            RelayEvent::Frame(Some(Ok(frame))) => {
                relay_frame(&session, &mut tracker, frame).await;
            }
            RelayEvent::Frame(Some(Err(e))) => {
                current = None;
                if session.is_closed() {
                    break;
                }
                tracing::warn!("Error reading from upstream {}: {}", session.key(), e);
                session
                    .set_state(SessionState::Error, Some(e.to_string()))
                    .await;
            }
            RelayEvent::Frame(None) => {
                current = None;
                if session.is_closed() {
                    break;
                }
                tracing::info!("Upstream {} closed the stream", session.key());
                session
                    .set_state(
                        SessionState::Error,
                        Some("upstream connection closed".to_string()),
                    )
                    .await;
            }
        }
    }

    tracing::debug!("Relay for {} stopped", session.key());
}

async fn relay_frame(session: &Session, tracker: &mut ResourceVersionTracker, frame: WsMessage) {
    let (payload, binary) = match frame {
        WsMessage::Text(text) => (text.into_bytes(), false),
        WsMessage::Binary(data) => (data, true),
        WsMessage::Ping(_) | WsMessage::Pong(_) => {
            session.touch();
            return;
        }
        WsMessage::Close(frame) => {
            tracing::debug!("Upstream {} sent close: {:?}", session.key(), frame);
            return;
        }
        WsMessage::Frame(_) => return,
    };

    session.touch();

    let key = session.key();
    let client = session.client();

    if tracker.observe(&payload) {
        if let Err(e) = client.send(&Message::complete(key, session.query())).await {
            tracing::warn!("Failed to encode COMPLETE for {}: {}", key, e);
        }
    }

    let envelope = Message::data(key, session.query(), &payload, binary);
    if let Err(e) = client.send(&envelope).await {
        tracing::warn!("Failed to encode DATA for {}: {}", key, e);
    }
}
