//! On-path certificate authority for TLS interception.
//!
//! This crate provides the two halves a TLS-intercepting proxy needs:
//! making a custom root CA trusted on the host, and issuing leaf
//! certificates for arbitrary hostnames while a handshake is in progress.
//!
//! # Architecture
//!
//! At startup, once:
//! 1. The root certificate is written into every OS trust anchor directory
//!    and the distribution's update tools are run
//! 2. It is imported into the JVM keystore if Java is installed
//! 3. A copy is written to a temp file meant for `NODE_EXTRA_CA_CERTS` and
//!    `REQUESTS_CA_BUNDLE`. The library never edits the process environment:
//!    the returned [`trust::EnvExport`] is applied to child commands, or
//!    exported by a binary before it starts any threads
//!
//! Then, for every intercepted connection, the rustls certificate resolver
//! calls [`CertIssuer::issue`], which records `source port -> SNI` in the
//! [`ConnectionRegistry`] and signs a fresh leaf for the SNI hostname.
//!
//! # Clock freezing
//!
//! An application whose clock is frozen in the past would reject a
//! certificate issued today. Issuance therefore accepts a backdate: the
//! leaf becomes valid one year before it, and stays valid until one year
//! from the real now.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use intercept_ca::{CaConfig, CertIssuer, ConnectionRegistry, RootCa, TlsAcceptor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = CaConfig::default();
//! let root = Arc::new(RootCa::embedded()?);
//! let ctx = intercept_ca::setup_ca(&config, &root, &CancellationToken::new()).await?;
//!
//! let mut app = std::process::Command::new("node");
//! if let Some(export) = &ctx.env_export {
//!     export.apply_to(&mut app);
//! }
//!
//! let issuer = CertIssuer::new(root, Arc::new(ConnectionRegistry::default()));
//! let acceptor = TlsAcceptor::new(Arc::new(issuer));
//! # let _ = acceptor;
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod config;
pub mod logging;
pub mod proxy;
pub mod registry;
pub mod trust;

pub use ca::{
    CertIssuer, ClientHelloInfo, IssueError, IssuedCert, KeyAlgorithm, LeafRequest, RootCa,
    RootCaError,
};
pub use config::{CaConfig, ConfigError};
pub use logging::LogLevelGuard;
pub use proxy::{BackdateSource, FixedBackdate, InterceptServer, NoBackdate, TlsAcceptor};
pub use registry::ConnectionRegistry;
pub use trust::{InstallContext, Provisioner, TrustError, TrustProvider};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use config::RootConfig;
use trust::SystemCommandRunner;

/// Loads the root CA named in `config`, or the embedded one.
pub fn load_root(config: &RootConfig) -> Result<RootCa, RootCaError> {
    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            info!("loading root CA from {}", cert.display());
            RootCa::load(cert, key)
        }
        _ => RootCa::embedded(),
    }
}

/// Installs `root` into every trust mechanism available on this host.
///
/// The bundle for environment-driven runtimes is written but not exported;
/// see [`InstallContext::env_export`].
pub async fn setup_ca(
    config: &CaConfig,
    root: &RootCa,
    cancel: &CancellationToken,
) -> Result<InstallContext, TrustError> {
    let provisioner = Provisioner::from_config(config, Arc::new(SystemCommandRunner));
    let ctx = provisioner.provision(root.cert_pem(), cancel).await?;
    info!(
        "CA installed into {} trust store(s){}",
        ctx.anchor_files.len(),
        ctx.env_export
            .as_ref()
            .map(|export| format!(", bundle at {}", export.path().display()))
            .unwrap_or_default()
    );
    Ok(ctx)
}
