//! Session health supervision
//!
//! Each session gets a monitor task that pings upstream on every heartbeat
//! and reconnects in place when the ping fails, the session is in the error
//! state, or upstream has been silent for two heartbeats.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use kp_core::time::elapsed_duration;
use kp_protocol::SessionState;

use super::session::Session;
use super::upstream::UpstreamDialer;
use crate::error::SessionError;
use crate::resolver::ContextResolver;

/// Default heartbeat interval
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Resolves a session's context and dials its upstream
pub struct SessionConnector {
    resolver: Arc<ContextResolver>,
    dialer: Arc<dyn UpstreamDialer>,
}

impl SessionConnector {
    pub fn new(resolver: Arc<ContextResolver>, dialer: Arc<dyn UpstreamDialer>) -> Self {
        Self { resolver, dialer }
    }

    pub fn resolver(&self) -> &Arc<ContextResolver> {
        &self.resolver
    }

    /// Dial a fresh upstream for the session and mark it connected
    ///
    /// The caller decides what a failure means for the session's state.
    pub async fn connect(&self, session: &Session) -> Result<(), SessionError> {
        let key = session.key();
        let context = self
            .resolver
            .get_context_with_fallback(&key.cluster_id, &key.user_id)?;

        let token = session.token();
        let connection = self
            .dialer
            .dial(&context, &key.path, session.query(), token.as_deref())
            .await?;

        session.attach(connection).await?;
        session.set_state(SessionState::Connected, None).await;
        Ok(())
    }
}

/// Spawns heartbeat monitors for sessions
pub struct HealthMonitor {
    /// Heartbeat interval
    pub interval: Duration,
    connector: Arc<SessionConnector>,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(interval: Duration, connector: Arc<SessionConnector>) -> Self {
        Self { interval, connector }
    }

    /// Start monitoring a session until it closes
    pub fn spawn_monitor(&self, session: Arc<Session>) -> JoinHandle<()> {
        let interval = self.interval;
        let connector = Arc::clone(&self.connector);
        tokio::spawn(run_monitor(session, connector, interval))
    }
}

async fn run_monitor(session: Arc<Session>, connector: Arc<SessionConnector>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = session.done().cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(reason) = check_health(&session, interval).await else {
            continue;
        };
        if session.is_closed() {
            break;
        }

        let last_msg = elapsed_duration(session.status().last_msg);
        tracing::warn!(
            "Session {} unhealthy (last message {}s ago): {}",
            session.key(),
            last_msg.as_secs(),
            reason
        );
        session.set_state(SessionState::Error, Some(reason)).await;

        let result = tokio::select! {
            biased;
            _ = session.done().cancelled() => break,
            result = connector.connect(&session) => result,
        };

        match result {
            Ok(()) => tracing::info!("Session {} reconnected", session.key()),
            Err(e) => {
                tracing::warn!("Reconnect of {} failed: {}", session.key(), e);
                session
                    .set_state(SessionState::Error, Some(e.to_string()))
                    .await;
            }
        }
    }

    tracing::debug!("Monitor for {} stopped", session.key());
}

/// Returns the reason a reconnect is needed, if any
async fn check_health(session: &Session, interval: Duration) -> Option<String> {
    if let Err(e) = session.write_upstream(WsMessage::Ping(Vec::new())).await {
        return Some(format!("heartbeat failed: {}", e));
    }

    let status = session.status();
    if status.state == SessionState::Error {
        return Some(
            status
                .error
                .unwrap_or_else(|| "session in error state".to_string()),
        );
    }

    let idle = session.idle_for();
    if idle > interval * 2 {
        return Some(format!("no upstream activity for {}s", idle.as_secs()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::testing::{client, resolver_with, ChannelDialer};
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use kp_protocol::{Message, MessageType, SessionKey, StatusPayload};

    async fn next_status(rx: &mut fmpsc::UnboundedReceiver<String>) -> StatusPayload {
        loop {
            let text = rx.next().await.unwrap();
            let msg: Message = serde_json::from_str(&text).unwrap();
            if msg.kind == MessageType::Status {
                return serde_json::from_str(&msg.data).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_connect_unknown_cluster() {
        let (dialer, _accepted) = ChannelDialer::new();
        let connector = SessionConnector::new(resolver_with(&["known"]), dialer.clone());
        let (client, _rx) = client();
        let (session, _streams) =
            Session::new(SessionKey::new("unknown", "/p", "u"), "", client, None);

        let err = connector.connect(&session).await.unwrap_err();
        assert!(matches!(err, SessionError::Context(_)));
        assert_eq!(dialer.dials(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sends_ping() {
        let (dialer, mut accepted) = ChannelDialer::new();
        let connector = Arc::new(SessionConnector::new(resolver_with(&["c"]), dialer.clone()));
        let (client, _rx) = client();
        let (session, _streams) = Session::new(SessionKey::new("c", "/p", "u"), "", client, None);
        connector.connect(&session).await.unwrap();
        let mut upstream = accepted.recv().await.unwrap();

        let monitor = HealthMonitor::new(Duration::from_secs(30), connector);
        let handle = monitor.spawn_monitor(Arc::clone(&session));

        let frame = upstream.rx.next().await.unwrap();
        assert!(matches!(frame, WsMessage::Ping(_)));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(dialer.dials(), 1);

        session.close().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_upstream_loss() {
        let (dialer, mut accepted) = ChannelDialer::new();
        let connector = Arc::new(SessionConnector::new(resolver_with(&["c"]), dialer.clone()));
        let (client, mut rx) = client();
        let (session, _streams) = Session::new(SessionKey::new("c", "/p", "u"), "", client, None);
        connector.connect(&session).await.unwrap();
        assert_eq!(next_status(&mut rx).await.state, SessionState::Connected);

        let first = accepted.recv().await.unwrap();
        drop(first);

        let monitor = HealthMonitor::new(Duration::from_secs(30), connector);
        let handle = monitor.spawn_monitor(Arc::clone(&session));

        let status = next_status(&mut rx).await;
        assert_eq!(status.state, SessionState::Error);
        assert!(status.error.starts_with("heartbeat failed"));

        let _second = accepted.recv().await.unwrap();
        assert_eq!(next_status(&mut rx).await.state, SessionState::Connected);
        assert_eq!(dialer.dials(), 2);

        session.close().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reconnect_stays_in_error() {
        let (dialer, mut accepted) = ChannelDialer::new();
        let connector = Arc::new(SessionConnector::new(resolver_with(&["c"]), dialer.clone()));
        let (client, mut rx) = client();
        let (session, _streams) = Session::new(SessionKey::new("c", "/p", "u"), "", client, None);
        connector.connect(&session).await.unwrap();
        let _ = next_status(&mut rx).await;

        drop(accepted.recv().await.unwrap());
        dialer.set_failing(true);

        let monitor = HealthMonitor::new(Duration::from_secs(30), connector);
        let handle = monitor.spawn_monitor(Arc::clone(&session));

        assert!(next_status(&mut rx)
            .await
            .error
            .starts_with("heartbeat failed"));
        let status = next_status(&mut rx).await;
        assert_eq!(status.state, SessionState::Error);
        assert!(!status.error.starts_with("heartbeat failed"));
        assert_eq!(session.state(), SessionState::Error);

        // Next heartbeat tries again
        dialer.set_failing(false);
        let _upstream = accepted.recv().await.unwrap();
        loop {
            if next_status(&mut rx).await.state == SessionState::Connected {
                break;
            }
        }
        assert_eq!(dialer.dials(), 3);

        session.close().await;
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_close() {
        let (dialer, _accepted) = ChannelDialer::new();
        let connector = Arc::new(SessionConnector::new(resolver_with(&["c"]), dialer));
        let (client, _rx) = client();
        let (session, _streams) = Session::new(SessionKey::new("c", "/p", "u"), "", client, None);

        let monitor = HealthMonitor::new(DEFAULT_HEARTBEAT_INTERVAL, connector);
        let handle = monitor.spawn_monitor(Arc::clone(&session));

        session.close().await;
        handle.await.unwrap();
    }
}
