//! WebSocket stream multiplexer
//!
//! One client connection carries many upstream Kubernetes streams. Each
//! stream is a [`Session`] keyed by `(cluster, path, user)`, living in a
//! shared [`SessionTable`]. A session is dialed once, relayed by its own
//! task, and supervised by a heartbeat monitor that reconnects it in place.
//! When the client connection ends, every session it owns is closed.
//!
//! Establishing a session can take as long as a full upstream handshake, so
//! a client's `REQUEST` frames run as tasks beside its read loop. `DATA` and
//! `CLOSE` frames are handled in arrival order on the loop itself.

mod client;
mod relay;
mod session;
mod supervisor;
mod table;
mod upstream;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{BoxError, ClientHandle, ClientId, ClientSink};
pub use relay::{run_relay, ResourceVersionTracker};
pub use session::{Session, SessionStatus};
pub use supervisor::{HealthMonitor, SessionConnector, DEFAULT_HEARTBEAT_INTERVAL};
pub use table::{CreationGuard, SessionTable};
pub use upstream::{
    bearer_protocols, tls_config, upstream_url, UpstreamConnection, UpstreamDialer,
    UpstreamSink, UpstreamStream, WsDialer, BEARER_PROTOCOL_PREFIX, BINARY_PROTOCOL,
    DEFAULT_HANDSHAKE_TIMEOUT,
};

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::task::{AbortHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use kp_core::config::GatewayConfig;
use kp_protocol::{
    ErrorEnvelope, FrameCodec, Message, MessageType, SessionKey, SessionState,
    DEFAULT_MAX_FRAME_SIZE,
};

use crate::error::SessionError;
use crate::resolver::ContextResolver;

/// Tunables for a [`Multiplexer`]
#[derive(Debug, Clone, Copy)]
pub struct MultiplexerSettings {
    /// Interval between upstream pings
    pub heartbeat_interval: Duration,
    /// Largest client frame accepted
    pub max_frame_size: usize,
}

impl MultiplexerSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Routes client frames to sessions and owns session lifecycles
pub struct Multiplexer {
    table: Arc<SessionTable>,
    connector: Arc<SessionConnector>,
    monitor: HealthMonitor,
    codec: FrameCodec,
}

impl Multiplexer {
    /// Create a multiplexer over a session table
    pub fn new(
        table: Arc<SessionTable>,
        resolver: Arc<ContextResolver>,
        dialer: Arc<dyn UpstreamDialer>,
        settings: MultiplexerSettings,
    ) -> Self {
        let connector = Arc::new(SessionConnector::new(resolver, dialer));
        Self {
            table,
            monitor: HealthMonitor::new(settings.heartbeat_interval, Arc::clone(&connector)),
            connector,
            codec: FrameCodec::with_max_frame_size(settings.max_frame_size),
        }
    }

    /// The shared session table
    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// Serve one client connection until its inbound stream ends
    ///
    /// `REQUEST` frames are spawned so a slow dial never holds up traffic
    /// for the client's other sessions. A `CLOSE` aborts any establishment
    /// still running for its key. Read errors end the connection like a
    /// normal close, and either way pending establishments are cancelled
    /// and every session the client owns is torn down before returning.
    pub async fn accept_client<R, E>(self: &Arc<Self>, client: Arc<ClientHandle>, incoming: R)
    where
        R: Stream<Item = Result<String, E>>,
        E: Display,
    {
        tracing::info!("Client {} connected", client.id());
        let mut incoming = std::pin::pin!(incoming);
        let mut pending = PendingRequests::default();

        loop {
            let frame = tokio::select! {
                _ = pending.reap(), if !pending.is_empty() => continue,
                frame = incoming.next() => frame,
            };

            let text = match frame {
                Some(Ok(text)) => text,
                Some(Err(e)) => {
                    tracing::debug!("Client {} read error: {}", client.id(), e);
                    break;
                }
                None => break,
            };

            let Some((msg, key)) = self.decode_frame(&client, &text) else {
                continue;
            };

            match msg.kind {
                MessageType::Request => {
                    let mux = Arc::clone(self);
                    let client = Arc::clone(&client);
                    pending.spawn(key.clone(), async move {
                        mux.handle_request(&client, &key, &msg).await;
                        key
                    });
                }
                MessageType::Close => {
                    if pending.cancel(&key) > 0 {
                        tracing::debug!("Cancelled pending request for {}", key);
                    }
                    self.dispatch(&client, &key, &msg).await;
                }
                _ => self.dispatch(&client, &key, &msg).await,
            }
        }

        pending.cancel_all().await;
        client.close().await;
        let closed = self.close_client_sessions(&client).await;
        tracing::info!(
            "Client {} disconnected, closed {} session(s)",
            client.id(),
            closed
        );
    }

    /// Handle one inbound text frame to completion
    ///
    /// Malformed frames are logged and dropped without affecting the
    /// connection.
    pub async fn handle_frame(&self, client: &Arc<ClientHandle>, text: &str) {
        if let Some((msg, key)) = self.decode_frame(client, text) {
            self.dispatch(client, &key, &msg).await;
        }
    }

    fn decode_frame(&self, client: &ClientHandle, text: &str) -> Option<(Message, SessionKey)> {
        let msg = match self.codec.decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("Dropping malformed frame from client {}: {}", client.id(), e);
                return None;
            }
        };

        match msg.session_key() {
            Ok(key) => Some((msg, key)),
            Err(e) => {
                tracing::warn!("Dropping {:?} frame from client {}: {}", msg.kind, client.id(), e);
                None
            }
        }
    }

    async fn dispatch(&self, client: &Arc<ClientHandle>, key: &SessionKey, msg: &Message) {
        match msg.kind {
            MessageType::Request => self.handle_request(client, key, msg).await,
            MessageType::Data => match self.table.get(key) {
                Some(session) if session.owner() == client.id() => {
                    self.relay_client_to_upstream(&session, msg).await;
                }
                _ => tracing::debug!("DATA for unknown session {}", key),
            },
            MessageType::Close => match self.table.get(key) {
                Some(session) if session.owner() == client.id() => {
                    if self.table.remove_if_same(&session) && session.close().await {
                        tracing::info!("Session {} closed", key);
                    }
                }
                Some(session) => tracing::debug!(
                    "Ignoring CLOSE for {} from client {}, owned by {}",
                    key,
                    client.id(),
                    session.owner()
                ),
                None => tracing::info!("Session {} already closed", key),
            },
            MessageType::Status | MessageType::Complete => {
                tracing::debug!("Ignoring {:?} frame from client {}", msg.kind, client.id());
            }
        }
    }

    /// Establish or reuse the session for a `REQUEST`, reporting failures
    /// to the client as an error envelope
    async fn handle_request(&self, client: &Arc<ClientHandle>, key: &SessionKey, msg: &Message) {
        if let Err(e) = self.ensure_session(client, key, msg).await {
            tracing::warn!("Failed to establish session {}: {}", key, e);
            let envelope = ErrorEnvelope::new(&key.cluster_id, e.to_string());
            if let Err(e) = client.send(&envelope).await {
                tracing::warn!("Failed to encode error for {}: {}", key, e);
            }
        }
    }

    /// Get or create the session for a `REQUEST`
    ///
    /// Creation for one key is serialized, so concurrent requests share a
    /// single upstream dial. A session owned by another client is replaced.
    /// A changed bearer token reconnects the existing session in place.
    async fn ensure_session(
        &self,
        client: &Arc<ClientHandle>,
        key: &SessionKey,
        msg: &Message,
    ) -> Result<Arc<Session>, SessionError> {
        let _guard = self.table.creation_lock(key).await;

        if let Some(existing) = self.table.get(key) {
            if existing.owner() == client.id() && !existing.is_closed() {
                if let Some(token) = msg.bearer_token() {
                    if existing.set_token(Some(token.to_string())) {
                        tracing::info!("Token changed for {}, reconnecting", key);
                        self.reconnect(&existing).await;
                    }
                }
                return Ok(existing);
            }

            tracing::info!("Session {} moving to client {}", key, client.id());
            if self.table.remove_if_same(&existing) {
                existing.close().await;
            }
        }

        self.establish_session(
            key.clone(),
            &msg.query,
            Arc::clone(client),
            msg.bearer_token().map(str::to_string),
        )
        .await
    }

    /// Dial a new session and register it
    ///
    /// A failed dial is retried once. On failure the session is marked
    /// `error` (the client sees a STATUS frame) and is never registered.
    pub async fn establish_session(
        &self,
        key: SessionKey,
        query: &str,
        client: Arc<ClientHandle>,
        token: Option<String>,
    ) -> Result<Arc<Session>, SessionError> {
        let (session, streams) = Session::new(key, query, client, token);

        let mut result = self.connector.connect(&session).await;
        if let Err(SessionError::Upstream(e)) = &result {
            tracing::warn!("Dial for {} failed, retrying once: {}", session.key(), e);
            session
                .set_state(SessionState::Error, Some(e.to_string()))
                .await;
            result = self.connector.connect(&session).await;
        }

        if let Err(e) = result {
            session
                .set_state(SessionState::Error, Some(e.to_string()))
                .await;
            return Err(e);
        }

        // No await between registering and spawning the relay and monitor
        let previous = self.table.insert(Arc::clone(&session));
        tokio::spawn(run_relay(Arc::clone(&session), streams));
        self.monitor.spawn_monitor(Arc::clone(&session));

        tracing::info!("Session {} established for client {}", session.key(), session.owner());
        if let Some(previous) = previous {
            previous.close().await;
        }
        Ok(session)
    }

    async fn reconnect(&self, session: &Session) {
        if let Err(e) = self.connector.connect(session).await {
            tracing::warn!("Reconnect of {} failed: {}", session.key(), e);
            session
                .set_state(SessionState::Error, Some(e.to_string()))
                .await;
        }
    }

    /// Write a client `DATA` frame to the session's upstream
    pub async fn relay_client_to_upstream(&self, session: &Session, msg: &Message) {
        let frame = if msg.binary {
            match msg.payload_bytes() {
                Ok(bytes) => WsMessage::Binary(bytes),
                Err(e) => {
                    tracing::warn!("Dropping DATA for {}: {}", session.key(), e);
                    return;
                }
            }
        } else {
            WsMessage::Text(msg.data.clone())
        };

        if let Err(e) = session.write_upstream(frame).await {
            tracing::warn!("Failed to write upstream for {}: {}", session.key(), e);
            session
                .set_state(SessionState::Error, Some(e.to_string()))
                .await;
        }
    }

    /// Close and unregister a session
    ///
    /// Returns `false` if no open session had the key.
    pub async fn close_session(&self, key: &SessionKey) -> bool {
        let Some(session) = self.table.remove(key) else {
            tracing::info!("Session {} already closed", key);
            return false;
        };

        let closed = session.close().await;
        if closed {
            tracing::info!("Session {} closed", key);
        }
        closed
    }

    /// Close every session owned by a client, returning how many
    pub async fn close_client_sessions(&self, client: &ClientHandle) -> usize {
        let sessions = self.table.list_for_client(client.id());
        let mut closed = 0;
        for session in sessions {
            self.table.remove_if_same(&session);
            if session.close().await {
                closed += 1;
            }
        }
        closed
    }

    /// Close every session
    pub async fn shutdown(&self) {
        for session in self.table.list() {
            self.table.remove_if_same(&session);
            session.close().await;
        }
    }
}

/// Session establishments still running for one client connection
#[derive(Default)]
struct PendingRequests {
    tasks: JoinSet<SessionKey>,
    by_key: HashMap<SessionKey, Vec<AbortHandle>>,
}

impl PendingRequests {
    fn spawn<F>(&mut self, key: SessionKey, task: F)
    where
        F: Future<Output = SessionKey> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.by_key.entry(key).or_default().push(handle);
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort the establishments running for a key, returning how many
    fn cancel(&mut self, key: &SessionKey) -> usize {
        let Some(handles) = self.by_key.remove(key) else {
            return 0;
        };
        let mut aborted = 0;
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        aborted
    }

    /// Wait for one establishment to finish and forget it
    async fn reap(&mut self) {
        match self.tasks.join_next().await {
            Some(Ok(key)) => {
                if let Some(handles) = self.by_key.get_mut(&key) {
                    handles.retain(|handle| !handle.is_finished());
                    if handles.is_empty() {
                        self.by_key.remove(&key);
                    }
                }
            }
            Some(Err(e)) if e.is_panic() => {
                tracing::error!("Session establishment panicked: {}", e);
            }
            _ => {}
        }
    }

    /// Abort everything and wait for the tasks to unwind
    async fn cancel_all(&mut self) {
        self.by_key.clear();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}
