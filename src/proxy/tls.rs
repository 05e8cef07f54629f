//! TLS termination with per-handshake certificate issuance.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use rustls::ServerConfig;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error};

use crate::ca::{CertIssuer, ClientHelloInfo};

/// Supplies the instant the intercepted application believes it is, when its
/// clock is frozen.
pub trait BackdateSource: Send + Sync {
    /// `None` means the application runs on the real clock.
    fn backdate(&self) -> Option<OffsetDateTime>;
}

/// The application clock is not frozen.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackdate;

impl BackdateSource for NoBackdate {
    fn backdate(&self) -> Option<OffsetDateTime> {
        None
    }
}

/// The application clock is frozen at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackdate(pub OffsetDateTime);

impl BackdateSource for FixedBackdate {
    fn backdate(&self) -> Option<OffsetDateTime> {
        Some(self.0)
    }
}

/// Default ALPN protocols offered to clients.
pub fn default_alpn() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

/// TLS acceptor that issues a certificate for whatever hostname the client
/// asks for.
///
/// rustls does not expose the transport to certificate resolvers, so each
/// connection gets its own resolver bound to the client's address.
#[derive(Clone)]
pub struct TlsAcceptor {
    issuer: Arc<CertIssuer>,
    backdate: Arc<dyn BackdateSource>,
    alpn: Vec<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl TlsAcceptor {
    pub fn new(issuer: Arc<CertIssuer>) -> Self {
        Self {
            issuer,
            backdate: Arc::new(NoBackdate),
            alpn: default_alpn(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    pub fn with_backdate_source(mut self, backdate: Arc<dyn BackdateSource>) -> Self {
        self.backdate = backdate;
        self
    }

    /// Sets the ALPN protocols offered, most preferred first. Empty disables
    /// ALPN.
    pub fn with_alpn<P: AsRef<[u8]>>(mut self, protocols: &[P]) -> Self {
        self.alpn = protocols.iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    pub fn issuer(&self) -> &Arc<CertIssuer> {
        &self.issuer
    }

    /// Builds the server config for one connection from `peer_addr`.
    pub fn server_config(&self, peer_addr: SocketAddr) -> Result<Arc<ServerConfig>, rustls::Error> {
        self.recording_config(peer_addr, Arc::new(OnceLock::new()))
    }

    fn recording_config(
        &self,
        peer_addr: SocketAddr,
        recorded: Arc<OnceLock<String>>,
    ) -> Result<Arc<ServerConfig>, rustls::Error> {
        let resolver = Arc::new(HandshakeResolver {
            issuer: Arc::clone(&self.issuer),
            backdate: Arc::clone(&self.backdate),
            peer_addr,
            recorded,
        });
        let mut config = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = self.alpn.clone();
        Ok(Arc::new(config))
    }

    /// Accepts a TLS connection, performing the handshake.
    /// Returns the TLS stream and the SNI (if provided by client).
    pub async fn accept(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, Option<String>), std::io::Error> {
        self.accept_recording(stream, Arc::new(OnceLock::new())).await
    }

    /// Like [`TlsAcceptor::accept`], and sets `recorded` to the hostname
    /// this handshake wrote into the registry, even if the handshake later
    /// fails.
    pub async fn accept_recording(
        &self,
        stream: TcpStream,
        recorded: Arc<OnceLock<String>>,
    ) -> Result<(TlsStream<TcpStream>, Option<String>), std::io::Error> {
        let peer_addr = stream.peer_addr()?;
        let config = self
            .recording_config(peer_addr, recorded)
            .map_err(std::io::Error::other)?;
        let tls_stream = tokio_rustls::TlsAcceptor::from(config).accept(stream).await?;

        let sni = tls_stream.get_ref().1.server_name().map(|s| s.to_string());

        debug!("TLS handshake with {} completed, SNI: {:?}", peer_addr, sni);

        Ok((tls_stream, sni))
    }
}

/// Certificate resolver for a single connection.
struct HandshakeResolver {
    issuer: Arc<CertIssuer>,
    backdate: Arc<dyn BackdateSource>,
    peer_addr: SocketAddr,
    recorded: Arc<OnceLock<String>>,
}

impl std::fmt::Debug for HandshakeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeResolver")
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for HandshakeResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let hello = ClientHelloInfo {
            server_name: client_hello.server_name().map(str::to_string),
            peer_addr: self.peer_addr,
        };
        debug!("resolving certificate for SNI {:?} from {}", hello.server_name, self.peer_addr);

        // Issuance records any present SNI, even if signing then fails.
        if let Some(name) = &hello.server_name {
            let _ = self.recorded.set(name.clone());
        }

        // Returning None aborts the handshake.
        match self.issuer.issue(&hello, self.backdate.backdate()) {
            Ok(issued) => Some(Arc::clone(issued.certified_key())),
            Err(e) => {
                error!(
                    "failed to issue certificate for {:?} from {}: {}",
                    hello.server_name, self.peer_addr, e
                );
                None
            }
        }
    }
}
