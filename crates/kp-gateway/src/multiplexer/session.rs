//! One supervised upstream stream
//!
//! A [`Session`] owns the write half of its upstream socket and the status
//! reported to the client. Three locks are involved and never nested:
//! the table lock (in [`SessionTable`](super::SessionTable)), the status lock
//! here, and the client write lock inside [`ClientHandle`]. Status changes
//! release the status lock before writing the STATUS frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use kp_core::time::current_time_millis;
use kp_protocol::{Message, SessionKey, SessionState};

use super::client::{ClientHandle, ClientId};
use super::upstream::{UpstreamConnection, UpstreamSink, UpstreamStream};
use crate::error::UpstreamError;

/// Snapshot of a session's health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Last error text
    pub error: Option<String>,
    /// Unix millis of the last upstream frame or state change
    pub last_msg: u64,
}

struct Health {
    status: SessionStatus,
    last_activity: Instant,
}

/// A multiplexed upstream stream owned by the session table
pub struct Session {
    key: SessionKey,
    query: String,
    client: Arc<ClientHandle>,
    token: Mutex<Option<String>>,
    health: Mutex<Health>,
    upstream: tokio::sync::Mutex<Option<UpstreamSink>>,
    streams: mpsc::UnboundedSender<UpstreamStream>,
    done: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Create a session in the `connecting` state
    ///
    /// The receiver yields every upstream read half attached to the session,
    /// and is consumed by the relay task.
    pub fn new(
        key: SessionKey,
        query: impl Into<String>,
        client: Arc<ClientHandle>,
        token: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamStream>) {
        let (streams, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            key,
            query: query.into(),
            client,
            token: Mutex::new(token),
            health: Mutex::new(Health {
                status: SessionStatus {
                    state: SessionState::Connecting,
                    error: None,
                    last_msg: current_time_millis(),
                },
                last_activity: Instant::now(),
            }),
            upstream: tokio::sync::Mutex::new(None),
            streams,
            done: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (session, rx)
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Session identity
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Query string of the upstream request
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Client connection the session relays to
    pub fn client(&self) -> &Arc<ClientHandle> {
        &self.client
    }

    /// Owning client connection
    pub fn owner(&self) -> ClientId {
        self.client.id()
    }

    /// Bearer token used for dialing
    pub fn token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the bearer token, returning whether it changed
    pub fn set_token(&self, token: Option<String>) -> bool {
        let mut current = self.token.lock().unwrap_or_else(|e| e.into_inner());
        if *current == token {
            return false;
        }
        *current = token;
        true
    }

    /// Current health snapshot
    pub fn status(&self) -> SessionStatus {
        self.health().status.clone()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.health().status.state
    }

    /// Whether the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Token fired when the session closes
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Record upstream activity
    pub fn touch(&self) {
        let mut health = self.health();
        health.last_activity = Instant::now();
        health.status.last_msg = current_time_millis();
    }

    /// Time since the last upstream frame or pong
    pub fn idle_for(&self) -> std::time::Duration {
        self.health().last_activity.elapsed()
    }

    /// Move to a new state and tell the client
    ///
    /// A closed session stays closed. Repeating the current state with the
    /// same error sends nothing.
    pub async fn set_state(&self, state: SessionState, error: Option<String>) {
        {
            let mut health = self.health();
            let status = &mut health.status;
            if status.state.is_closed() && !state.is_closed() {
                return;
            }
            if status.state == state && status.error == error {
                return;
            }
            status.state = state;
            status.error = error.clone();
            status.last_msg = current_time_millis();
        }

        let frame = Message::status(&self.key, &self.query, state, error.as_deref());
        if let Err(e) = self.client.send(&frame).await {
            tracing::warn!("Failed to encode status for {}: {}", self.key, e);
        }
    }

    /// Attach a freshly dialed upstream, replacing any previous one
    pub async fn attach(&self, connection: UpstreamConnection) -> Result<(), UpstreamError> {
        let UpstreamConnection { sink, stream } = connection;
        let previous = {
            let mut upstream = self.upstream.lock().await;
            if self.is_closed() {
                drop(upstream);
                let mut sink = sink;
                let _ = sink.close().await;
                return Err(UpstreamError::NotConnected);
            }
            upstream.replace(sink)
        };

        if let Some(mut old) = previous {
            let _ = old.close().await;
        }

        self.streams
            .send(stream)
            .map_err(|_| UpstreamError::NotConnected)?;
        self.touch();
        Ok(())
    }

    /// Write one frame to the upstream socket
    pub async fn write_upstream(&self, frame: WsMessage) -> Result<(), UpstreamError> {
        let mut upstream = self.upstream.lock().await;
        match upstream.as_mut() {
            Some(sink) => Ok(sink.send(frame).await?),
            None => Err(UpstreamError::NotConnected),
        }
    }

    /// Tear the session down
    ///
    /// Returns `false` when the session was already closed.
    pub async fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.done.cancel();
        self.set_state(SessionState::Closed, None).await;

        let sink = self.upstream.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                tracing::debug!("Error closing upstream for {}: {}", self.key, e);
            }
        }
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("owner", &self.owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use kp_protocol::{MessageType, StatusPayload};
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn client() -> (Arc<ClientHandle>, fmpsc::UnboundedReceiver<String>) {
        let (tx, rx) = fmpsc::unbounded();
        (Arc::new(ClientHandle::from_sink(tx)), rx)
    }

    fn next_status(rx: &mut fmpsc::UnboundedReceiver<String>) -> StatusPayload {
        let text = rx.try_next().unwrap().unwrap();
        let msg: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(msg.kind, MessageType::Status);
        serde_json::from_str(&msg.data).unwrap()
    }

    #[tokio::test]
    async fn test_state_change_sends_status() {
        let (client, mut rx) = client();
        let (session, _streams) = Session::new(SessionKey::new("c", "/p", "u"), "", client, None);
        assert_eq!(session.state(), SessionState::Connecting);

        session.set_state(SessionState::Connected, None).await;
        assert_eq!(next_status(&mut rx).state, SessionState::Connected);

        // Same state, no frame
        session.set_state(SessionState::Connected, None).await;
        assert!(rx.try_next().is_err());

        session
            .set_state(SessionState::Error, Some("boom".into()))
            .await;
        let status = next_status(&mut rx);
        assert_eq!(status.state, SessionState::Error);
        assert_eq!(status.error, "boom");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, mut rx) = client();
        let (session, _streams) = Session::new(SessionKey::new("c", "/p", "u"), "", client, None);

        assert!(session.close().await);
        assert!(session.done().is_cancelled());
        assert_eq!(next_status(&mut rx).state, SessionState::Closed);

        assert!(!session.close().await);
        assert!(rx.try_next().is_err());

        // Closed is terminal
        session.set_state(SessionState::Connected, None).await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_write_without_upstream() {
        let (client, _rx) = client();
        let (session, _streams) = Session::new(SessionKey::new("c", "/p", "u"), "", client, None);
        let result = session.write_upstream(WsMessage::Text("x".into())).await;
        assert!(matches!(result, Err(UpstreamError::NotConnected)));
    }

    #[tokio::test]
    async fn test_attach_routes_writes_and_streams() {
        let (client, _rx) = client();
        let (session, mut streams) =
            Session::new(SessionKey::new("c", "/p", "u"), "", client, None);

        let (up_tx, mut up_rx) = fmpsc::unbounded::<WsMessage>();
        let (_down_tx, down_rx) = fmpsc::unbounded::<Result<WsMessage, WsError>>();
        session
            .attach(UpstreamConnection {
                sink: Box::pin(up_tx.sink_map_err(|_| WsError::ConnectionClosed)),
                stream: Box::pin(down_rx),
            })
            .await
            .unwrap();

        assert!(streams.try_recv().is_ok());

        session
            .write_upstream(WsMessage::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(up_rx.next().await, Some(WsMessage::Text("hello".into())));

        session.close().await;
        assert_eq!(up_rx.next().await, None);
    }

    #[test]
    fn test_set_token() {
        let (tx, _rx) = fmpsc::unbounded::<String>();
        let client = Arc::new(ClientHandle::from_sink(tx));
        let (session, _streams) =
            Session::new(SessionKey::new("c", "/p", "u"), "", client, Some("a".into()));

        assert!(!session.set_token(Some("a".into())));
        assert!(session.set_token(Some("b".into())));
        assert_eq!(session.token().as_deref(), Some("b"));
    }
}
