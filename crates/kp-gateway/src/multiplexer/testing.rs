//! In-memory doubles for multiplexer tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use kp_core::config::GatewayConfig;
use kp_core::kubeconfig::{AuthInfo, ClusterInfo, Context, ContextSource, ContextStore};

use super::client::ClientHandle;
use super::upstream::{UpstreamConnection, UpstreamDialer};
use crate::error::UpstreamError;
use crate::resolver::ContextResolver;

/// Test side of one dialed upstream
pub struct FakeUpstream {
    pub path: String,
    pub query: String,
    pub token: Option<String>,
    /// Frames delivered to the gateway
    pub tx: fmpsc::UnboundedSender<Result<WsMessage, WsError>>,
    /// Frames the gateway wrote upstream
    pub rx: fmpsc::UnboundedReceiver<WsMessage>,
}

/// Dialer handing out channel-backed upstreams
pub struct ChannelDialer {
    dials: AtomicUsize,
    failing: AtomicBool,
    delays: Mutex<HashMap<String, Duration>>,
    accepted: mpsc::UnboundedSender<FakeUpstream>,
}

impl ChannelDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeUpstream>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            dials: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            delays: Mutex::new(HashMap::new()),
            accepted,
        });
        (dialer, rx)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every dial to `cluster` take `delay` before answering
    pub fn set_dial_delay(&self, cluster: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(cluster.to_string(), delay);
    }
}

#[async_trait]
impl UpstreamDialer for ChannelDialer {
    async fn dial(
        &self,
        context: &Context,
        path: &str,
        query: &str,
        token: Option<&str>,
    ) -> Result<UpstreamConnection, UpstreamError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(&context.name).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(UpstreamError::Timeout(Duration::from_secs(45)));
        }

        let (up_tx, up_rx) = fmpsc::unbounded();
        let (down_tx, down_rx) = fmpsc::unbounded();
        let _ = self.accepted.send(FakeUpstream {
            path: path.to_string(),
            query: query.to_string(),
            token: token.map(str::to_string),
            tx: down_tx,
            rx: up_rx,
        });

        Ok(UpstreamConnection {
            sink: Box::pin(up_tx.sink_map_err(|_| WsError::ConnectionClosed)),
            stream: Box::pin(down_rx),
        })
    }
}

pub fn context(name: &str) -> Context {
    Context {
        name: name.to_string(),
        cluster_name: name.to_string(),
        user_name: "admin".to_string(),
        custom_name: None,
        cluster: ClusterInfo {
            server: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        },
        auth: AuthInfo::default(),
        source: ContextSource::KubeConfig,
        internal: false,
    }
}

/// Resolver over a store holding one context per name
pub fn resolver_with(names: &[&str]) -> Arc<ContextResolver> {
    let store = ContextStore::new();
    for name in names {
        store.add_context(context(name));
    }
    Arc::new(ContextResolver::new(store, &GatewayConfig::default()))
}

pub fn client() -> (Arc<ClientHandle>, fmpsc::UnboundedReceiver<String>) {
    let (tx, rx) = fmpsc::unbounded();
    (Arc::new(ClientHandle::from_sink(tx)), rx)
}
