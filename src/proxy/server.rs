//! Reference intercepting listener.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs, lookup_host};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::tls::TlsAcceptor;
use super::tunnel::{Tunnel, TunnelError};
use crate::registry::ConnectionRegistry;

const DEFAULT_UPSTREAM_PORT: u16 = 443;

/// Terminates TLS with issued certificates and tunnels each connection to
/// the host the client named. The handshake's SNI decides the destination;
/// the connection registry, keyed by source port, is the fallback.
pub struct InterceptServer {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<ConnectionRegistry>,
    tunnel: Arc<Tunnel>,
    upstream_port: u16,
    upstream_addr: Option<SocketAddr>,
}

impl InterceptServer {
    pub async fn bind(addr: impl ToSocketAddrs, acceptor: TlsAcceptor) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("intercept server listening on {}", listener.local_addr()?);

        let registry = Arc::clone(acceptor.issuer().registry());
        Ok(Self {
            listener,
            acceptor,
            registry,
            tunnel: Arc::new(Tunnel::new()),
            upstream_port: DEFAULT_UPSTREAM_PORT,
            upstream_addr: None,
        })
    }

    pub fn with_tunnel(mut self, tunnel: Tunnel) -> Self {
        self.tunnel = Arc::new(tunnel);
        self
    }

    /// Port dialed on the resolved destination host.
    pub fn with_upstream_port(mut self, port: u16) -> Self {
        self.upstream_port = port;
        self
    }

    /// Sends every connection to `addr` instead of resolving the hostname.
    /// The hostname is still used for SNI and certificate verification.
    pub fn with_upstream_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.upstream_addr = addr;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), std::io::Error> {
        let server = Arc::new(ConnectionContext {
            acceptor: self.acceptor,
            registry: self.registry,
            tunnel: self.tunnel,
            upstream_port: self.upstream_port,
            upstream_addr: self.upstream_addr,
        });

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("intercept server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };
            debug!("accepted connection from {}", peer_addr);

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    error!("connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

struct ConnectionContext {
    acceptor: TlsAcceptor,
    registry: Arc<ConnectionRegistry>,
    tunnel: Arc<Tunnel>,
    upstream_port: u16,
    upstream_addr: Option<SocketAddr>,
}

impl ConnectionContext {
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let source_port = peer_addr.port();
        let recorded = Arc::new(OnceLock::new());
        let result = self.relay(stream, source_port, Arc::clone(&recorded)).await;
        // Clients on other addresses can share the port; leave their entries.
        if let Some(host) = recorded.get() {
            self.registry.remove_if(source_port, host);
        }
        result
    }

    async fn relay(
        &self,
        stream: TcpStream,
        source_port: u16,
        recorded: Arc<OnceLock<String>>,
    ) -> Result<(), ConnectionError> {
        let (mut client, sni) = self
            .acceptor
            .accept_recording(stream, recorded)
            .await
            .map_err(ConnectionError::TlsHandshake)?;

        let host = destination(sni, &self.registry, source_port)?;

        let upstream_addr = match self.upstream_addr {
            Some(addr) => addr,
            None => resolve_host(&host, self.upstream_port)
                .await
                .ok_or_else(|| ConnectionError::Resolve(host.clone()))?,
        };

        let alpn = client.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
        let mut upstream = self
            .tunnel
            .connect_upstream(upstream_addr, &host, alpn.as_deref())
            .await?;

        debug!("tunneling port {} to {} ({})", source_port, host, upstream_addr);
        Tunnel::run(&mut client, &mut upstream).await?;
        Ok(())
    }
}

/// Picks the upstream host: the connection's own SNI, else whatever the
/// registry holds for its source port.
fn destination(
    sni: Option<String>,
    registry: &ConnectionRegistry,
    source_port: u16,
) -> Result<String, ConnectionError> {
    if let Some(sni) = sni {
        if let Some(registered) = registry.get(source_port)
            && registered != sni
        {
            debug!("port {} registered to {}, routing by SNI {}", source_port, registered, sni);
        }
        return Ok(sni);
    }
    registry
        .get(source_port)
        .ok_or(ConnectionError::UnknownDestination(source_port))
}

/// Resolves a hostname to a socket address.
async fn resolve_host(host: &str, port: u16) -> Option<SocketAddr> {
    match lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            warn!("DNS resolution failed for {}: {}", host, e);
            None
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("no destination recorded for source port {0}")]
    UnknownDestination(u16),
    #[error("failed to resolve upstream host {0}")]
    Resolve(String),
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CertIssuer, KeyAlgorithm, LeafRequest, RootCa};
    use crate::proxy::tls::tests::client_config;

    use std::time::Duration;

    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{PrivateKeyDer, ServerName};
    use rustls::{RootCertStore, ServerConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Starts a TLS echo server for `host` whose certificate chains to
    /// `root`. Returns its address.
    async fn echo_upstream(root: Arc<RootCa>, host: &str) -> SocketAddr {
        let issuer = CertIssuer::new(root, Arc::new(ConnectionRegistry::default()));
        let leaf = issuer
            .sign(&LeafRequest::for_hostname(host, KeyAlgorithm::EcdsaP256), None)
            .unwrap();
        let key = PrivateKeyDer::from_pem_slice(leaf.key_pem().as_bytes()).unwrap();
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![leaf.cert_der().clone()], key)
            .unwrap();
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(stream).await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let n = tls.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                if tls.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            let _ = tls.shutdown().await;
        });
        addr
    }

    /// A client that trusts the intercepting root reaches the upstream host
    /// it named through the tunnel, and the registry entry is dropped once
    /// the connection ends.
    #[tokio::test]
    async fn tunnels_to_named_host() {
        let upstream_root = Arc::new(RootCa::generate("upstream test root").unwrap());
        let upstream_addr = echo_upstream(Arc::clone(&upstream_root), "echo.test").await;

        let intercept_root = Arc::new(RootCa::generate("intercept test root").unwrap());
        let registry = Arc::new(ConnectionRegistry::default());
        let issuer = CertIssuer::new(Arc::clone(&intercept_root), Arc::clone(&registry));
        let acceptor = TlsAcceptor::new(Arc::new(issuer));

        let mut upstream_roots = RootCertStore::empty();
        upstream_roots.add(upstream_root.cert_der().clone()).unwrap();
        let server = InterceptServer::bind("127.0.0.1:0", acceptor)
            .await
            .unwrap()
            .with_tunnel(Tunnel::with_root_store(upstream_roots))
            .with_upstream_addr(Some(upstream_addr));
        let listen_addr = server.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let running = tokio::spawn(server.run(cancel.clone()));

        let connector =
            tokio_rustls::TlsConnector::from(Arc::new(client_config(&intercept_root, &[])));
        let tcp = TcpStream::connect(listen_addr).await.unwrap();
        let mut tls = connector
            .connect(ServerName::try_from("echo.test").unwrap(), tcp)
            .await
            .unwrap();

        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(registry.len(), 1);

        tls.shutdown().await.unwrap();
        drop(tls);

        let mut cleared = false;
        for _ in 0..100 {
            if registry.is_empty() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cleared, "registry entry not removed");

        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    /// SNI routes the connection even when another client holds the port in
    /// the registry.
    #[test]
    fn destination_prefers_sni() {
        let registry = ConnectionRegistry::default();
        registry.record(50000, "other.test");

        assert_eq!(
            destination(Some("echo.test".to_string()), &registry, 50000).unwrap(),
            "echo.test"
        );
        assert_eq!(destination(None, &registry, 50000).unwrap(), "other.test");
        assert!(matches!(
            destination(None, &registry, 50001),
            Err(ConnectionError::UnknownDestination(50001))
        ));
    }

    /// When another client takes over the source port mid-connection, the
    /// end of this connection leaves that client's entry in place.
    #[tokio::test]
    async fn reused_port_entry_survives_connection_end() {
        let upstream_root = Arc::new(RootCa::generate("upstream test root").unwrap());
        let upstream_addr = echo_upstream(Arc::clone(&upstream_root), "echo.test").await;

        let intercept_root = Arc::new(RootCa::generate("intercept test root").unwrap());
        let registry = Arc::new(ConnectionRegistry::default());
        let issuer = CertIssuer::new(Arc::clone(&intercept_root), Arc::clone(&registry));

        let mut upstream_roots = RootCertStore::empty();
        upstream_roots.add(upstream_root.cert_der().clone()).unwrap();
        let server = InterceptServer::bind("127.0.0.1:0", TlsAcceptor::new(Arc::new(issuer)))
            .await
            .unwrap()
            .with_tunnel(Tunnel::with_root_store(upstream_roots))
            .with_upstream_addr(Some(upstream_addr));
        let listen_addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let running = tokio::spawn(server.run(cancel.clone()));

        let connector =
            tokio_rustls::TlsConnector::from(Arc::new(client_config(&intercept_root, &[])));
        let tcp = TcpStream::connect(listen_addr).await.unwrap();
        let port = tcp.local_addr().unwrap().port();
        let mut tls = connector
            .connect(ServerName::try_from("echo.test").unwrap(), tcp)
            .await
            .unwrap();

        tls.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(registry.get(port).as_deref(), Some("echo.test"));

        registry.record(port, "other.test");

        tls.shutdown().await.unwrap();
        let mut rest = Vec::new();
        let _ = tls.read_to_end(&mut rest).await;
        drop(tls);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(registry.get(port).as_deref(), Some("other.test"));

        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    /// A failed handshake leaves no registry entry behind.
    #[tokio::test]
    async fn failed_handshake_clears_registry() {
        let intercept_root = Arc::new(RootCa::generate("intercept test root").unwrap());
        let registry = Arc::new(ConnectionRegistry::default());
        let issuer = CertIssuer::new(Arc::clone(&intercept_root), Arc::clone(&registry));
        let server = InterceptServer::bind("127.0.0.1:0", TlsAcceptor::new(Arc::new(issuer)))
            .await
            .unwrap();
        let listen_addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let running = tokio::spawn(server.run(cancel.clone()));

        // The client does not trust the intercepting root.
        let other = RootCa::generate("unrelated root").unwrap();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config(&other, &[])));
        let tcp = TcpStream::connect(listen_addr).await.unwrap();
        assert!(
            connector
                .connect(ServerName::try_from("reject.test").unwrap(), tcp)
                .await
                .is_err()
        );

        let mut cleared = false;
        for _ in 0..100 {
            if registry.is_empty() {
                cleared = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cleared);

        cancel.cancel();
        running.await.unwrap().unwrap();
    }
}
