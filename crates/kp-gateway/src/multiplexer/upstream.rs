//! Upstream dialing
//!
//! Builds the `ws(s)://` URL for a session, a rustls client configuration
//! from the resolved context, and dials the API server with a bounded
//! handshake. The [`UpstreamDialer`] trait is the seam tests use to swap in
//! in-memory upstreams.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::{Sink, Stream, StreamExt};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use url::Url;

use kp_core::kubeconfig::Context;

use crate::error::UpstreamError;

/// Sub-protocol asking the API server to base64 binary channels
pub const BINARY_PROTOCOL: &str = "base64.binary.k8s.io";

/// Sub-protocol prefix carrying a bearer token
pub const BEARER_PROTOCOL_PREFIX: &str = "base64url.bearer.authorization.k8s.io.";

/// Default bound on the upstream handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// Write half of an upstream stream
pub type UpstreamSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;

/// Read half of an upstream stream
pub type UpstreamStream = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;

/// An open upstream stream, split into halves
pub struct UpstreamConnection {
    pub sink: UpstreamSink,
    pub stream: UpstreamStream,
}

/// Opens upstream streams for sessions
#[async_trait]
pub trait UpstreamDialer: Send + Sync {
    /// Dial `path?query` on the context's API server
    async fn dial(
        &self,
        context: &Context,
        path: &str,
        query: &str,
        token: Option<&str>,
    ) -> Result<UpstreamConnection, UpstreamError>;
}

/// WebSocket dialer backed by tokio-tungstenite and rustls
pub struct WsDialer {
    handshake_timeout: Duration,
}

impl WsDialer {
    /// Create a dialer with the given handshake bound
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new(DEFAULT_HANDSHAKE_TIMEOUT)
    }
}

#[async_trait]
impl UpstreamDialer for WsDialer {
    async fn dial(
        &self,
        context: &Context,
        path: &str,
        query: &str,
        token: Option<&str>,
    ) -> Result<UpstreamConnection, UpstreamError> {
        let url = upstream_url(&context.cluster.server, path, query)?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_str(&context.cluster.server)
                .map_err(|e| UpstreamError::Url(e.to_string()))?,
        );

        let token = token.or(context.auth.token.as_deref());
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            headers.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_str(&bearer_protocols(token))
                    .map_err(|e| UpstreamError::Url(e.to_string()))?,
            );
        }

        let connector = if url.scheme() == "wss" {
            Some(Connector::Rustls(Arc::new(tls_config(context)?)))
        } else {
            None
        };

        tracing::debug!("Dialing upstream {}", url);

        let (ws, _response) = tokio::time::timeout(
            self.handshake_timeout,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| UpstreamError::Timeout(self.handshake_timeout))??;

        let (sink, stream) = ws.split();
        Ok(UpstreamConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Streaming URL for a path on an API server
///
/// `https` maps to `wss` and `http` to `ws`. The path is appended to any
/// path prefix the server URL already has.
pub fn upstream_url(server: &str, path: &str, query: &str) -> Result<Url, UpstreamError> {
    let mut url =
        Url::parse(server).map_err(|e| UpstreamError::Url(format!("{}: {}", server, e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(UpstreamError::Url(format!(
                "unsupported scheme {} in {}",
                other, server
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| UpstreamError::Url(format!("cannot use {} for {}", scheme, server)))?;

    let base = url.path().trim_end_matches('/').to_string();
    let path = path.trim_start_matches('/');
    url.set_path(&format!("{}/{}", base, path));
    url.set_query(Some(query).filter(|q| !q.is_empty()));

    Ok(url)
}

/// `Sec-WebSocket-Protocol` value carrying a bearer token
pub fn bearer_protocols(token: &str) -> String {
    format!(
        "{}{}, {}",
        BEARER_PROTOCOL_PREFIX,
        URL_SAFE_NO_PAD.encode(token),
        BINARY_PROTOCOL
    )
}

/// rustls client configuration for a context
///
/// Trusts the context's CA bundle, or the web PKI roots when it has none.
/// Presents the client certificate when both certificate and key are set.
pub fn tls_config(context: &Context) -> Result<ClientConfig, UpstreamError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let builder = if context.cluster.insecure_skip_tls_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
    } else {
        builder.with_root_certificates(root_store(context.cluster.certificate_authority.as_deref())?)
    };

    match (&context.auth.client_certificate, &context.auth.client_key) {
        (Some(cert), Some(key)) => {
            let certs = parse_certificates(cert)?;
            let mut reader = key.as_slice();
            let key = rustls_pemfile::private_key(&mut reader)
                .map_err(|e| UpstreamError::Tls(format!("reading client key: {}", e)))?
                .ok_or_else(|| UpstreamError::Tls("no private key in client key data".into()))?;
            Ok(builder.with_client_auth_cert(certs, key)?)
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn root_store(ca: Option<&[u8]>) -> Result<RootCertStore, UpstreamError> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(pem) => {
            for cert in parse_certificates(pem)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, UpstreamError> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| UpstreamError::Tls(format!("reading certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(UpstreamError::Tls("no certificates found in PEM data".into()));
    }
    Ok(certs)
}

/// Verifier for `insecure-skip-tls-verify`
///
/// Accepts any certificate chain but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
