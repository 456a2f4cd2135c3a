//! Global gateway state

use std::sync::Arc;

use kp_core::config::GatewayConfig;
use kp_core::kubeconfig::ContextStore;
use tokio_util::sync::CancellationToken;

use crate::multiplexer::{Multiplexer, MultiplexerSettings, SessionTable, UpstreamDialer, WsDialer};
use crate::resolver::ContextResolver;

/// Global state for the gateway daemon
pub struct GatewayState {
    /// Configuration
    pub config: GatewayConfig,
    /// Persistent and stateless contexts
    pub contexts: ContextStore,
    /// Request to context mapping
    pub resolver: Arc<ContextResolver>,
    /// Stream multiplexer
    pub multiplexer: Arc<Multiplexer>,
    /// Fired on shutdown
    pub shutdown: CancellationToken,
}

impl GatewayState {
    /// Create gateway state dialing real API servers
    pub fn new(config: GatewayConfig, contexts: ContextStore) -> Self {
        let dialer = Arc::new(WsDialer::new(config.handshake_timeout));
        Self::with_dialer(config, contexts, dialer)
    }

    /// Create gateway state with a custom upstream dialer
    pub fn with_dialer(
        config: GatewayConfig,
        contexts: ContextStore,
        dialer: Arc<dyn UpstreamDialer>,
    ) -> Self {
        let resolver = Arc::new(ContextResolver::new(contexts.clone(), &config));
        let multiplexer = Arc::new(Multiplexer::new(
            Arc::new(SessionTable::new()),
            Arc::clone(&resolver),
            dialer,
            MultiplexerSettings::from_config(&config),
        ));

        Self {
            config,
            contexts,
            resolver,
            multiplexer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the multiplexer
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }
}
