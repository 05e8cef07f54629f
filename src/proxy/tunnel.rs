//! Upstream TLS connections and byte relaying.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Opens verified TLS connections to the real destination and relays bytes
/// between it and the intercepted client.
pub struct Tunnel {
    client_config: Arc<ClientConfig>,
}

impl Tunnel {
    /// Creates a tunnel that trusts the bundled Mozilla roots.
    pub fn new() -> Self {
        Self::with_root_store(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        })
    }

    /// Creates a tunnel that trusts only `roots`.
    pub fn with_root_store(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            client_config: Arc::new(config),
        }
    }

    /// Connects to `addr` and completes a TLS handshake for `sni`, offering
    /// `alpn` if the client negotiated a protocol.
    pub async fn connect_upstream(
        &self,
        addr: SocketAddr,
        sni: &str,
        alpn: Option<&[u8]>,
    ) -> Result<TlsStream<TcpStream>, TunnelError> {
        debug!("connecting to upstream {} at {}", sni, addr);

        let server_name = ServerName::try_from(sni.to_string())
            .map_err(|_| TunnelError::InvalidSni(sni.to_string()))?;

        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(TunnelError::Connect)?;

        let config = match alpn {
            Some(protocol) => {
                let mut config = ClientConfig::clone(&self.client_config);
                config.alpn_protocols = vec![protocol.to_vec()];
                Arc::new(config)
            }
            None => Arc::clone(&self.client_config),
        };

        let tls_stream = TlsConnector::from(config)
            .connect(server_name, tcp_stream)
            .await
            .map_err(TunnelError::TlsHandshake)?;

        debug!("upstream TLS connection established to {}", sni);

        Ok(tls_stream)
    }

    /// Runs a bidirectional tunnel between two streams until both sides
    /// close. Returns bytes sent client to upstream and upstream to client.
    pub async fn run<C, U>(client: &mut C, upstream: &mut U) -> Result<(u64, u64), TunnelError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let result = copy_bidirectional(client, upstream)
            .await
            .map_err(TunnelError::Io)?;

        debug!(
            "tunnel closed: {} bytes client->upstream, {} bytes upstream->client",
            result.0, result.1
        );

        Ok(result)
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] std::io::Error),
    #[error("invalid SNI: {0}")]
    InvalidSni(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}
