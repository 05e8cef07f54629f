use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use intercept_ca::{
    CaConfig, CertIssuer, ConnectionRegistry, FixedBackdate, InterceptServer, LeafRequest,
    NoBackdate, TlsAcceptor, logging,
};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// On-path certificate authority for TLS interception.
///
/// Installs a root CA into the host trust stores and issues leaf
/// certificates for intercepted hostnames on demand.
#[derive(Parser, Debug)]
#[command(name = "intercept-ca")]
#[command(version, about)]
struct Args {
    /// Path to the configuration file (YAML).
    /// If not specified, built-in defaults are used.
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install the root CA into the OS and Java trust stores, then print
    /// shell exports pointing NODE_EXTRA_CA_CERTS and REQUESTS_CA_BUNDLE at
    /// a bundle file.
    Setup,
    /// Issue a leaf certificate for a hostname and print it as PEM.
    Issue {
        /// Hostname or IP address to issue for.
        host: String,
        /// Frozen application time (RFC 3339) the certificate must cover.
        #[arg(long, value_parser = parse_rfc3339)]
        backdate: Option<OffsetDateTime>,
        /// Also print the leaf private key.
        #[arg(long)]
        with_key: bool,
    },
    /// Print the root CA certificate as PEM.
    ExportCa,
    /// Run an intercepting TLS listener that tunnels to the requested host.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8443")]
        listen: SocketAddr,
        /// Port dialed on the destination host.
        #[arg(long, default_value_t = 443)]
        upstream_port: u16,
        /// Provision the trust stores before listening.
        #[arg(long)]
        setup: bool,
        /// Frozen application time (RFC 3339) issued certificates must cover.
        #[arg(long, value_parser = parse_rfc3339)]
        backdate: Option<OffsetDateTime>,
    },
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| format!("invalid RFC 3339 time: {e}"))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_handle = logging::init(&args.log_level);
    let log_guard = Arc::new(log_handle.signer_guard());
    log_guard.ensure();

    let config = match &args.config {
        Some(path) => CaConfig::load(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => CaConfig::default(),
    };

    let root = Arc::new(intercept_ca::load_root(&config.root).context("failed to load root CA")?);

    match args.command {
        Command::Setup => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("failed to create tokio runtime")?;
            let ctx = rt.block_on(with_ctrl_c(|cancel| async move {
                intercept_ca::setup_ca(&config, &root, &cancel)
                    .await
                    .context("failed to set up CA")
            }))?;
            // This process exits here; a parent shell can `eval` the exports.
            if let Some(export) = &ctx.env_export {
                print!("{}", export.shell_exports());
            }
            Ok(())
        }
        Command::Issue {
            host,
            backdate,
            with_key,
        } => {
            let issuer = CertIssuer::new(Arc::clone(&root), Arc::new(ConnectionRegistry::default()))
                .with_log_guard(log_guard)
                .with_key_algorithm(config.issuance.key_algorithm);
            let request = LeafRequest::for_hostname(&host, config.issuance.key_algorithm);
            let issued = issuer
                .sign(&request, backdate)
                .with_context(|| format!("failed to issue certificate for {host}"))?;
            info!(
                "issued certificate for {} valid from {} to {}",
                host,
                issued.not_before(),
                issued.not_after()
            );
            print!("{}", issued.cert_pem());
            if with_key {
                print!("{}", issued.key_pem());
            }
            Ok(())
        }
        Command::ExportCa => {
            print!("{}", root.cert_pem());
            Ok(())
        }
        Command::Serve {
            listen,
            upstream_port,
            setup,
            backdate,
        } => {
            if setup {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("failed to create tokio runtime")?;
                let ctx = rt.block_on(with_ctrl_c(|cancel| {
                    let (config, root) = (&config, &root);
                    async move {
                        intercept_ca::setup_ca(config, root, &cancel)
                            .await
                            .context("failed to set up CA")
                    }
                }))?;
                // Joins the blocking pool, leaving only this thread.
                drop(rt);

                if let Some(export) = &ctx.env_export {
                    // SAFETY: the setup runtime is gone and the listener runtime
                    // is built below, so no other thread exists yet.
                    unsafe { export.export() };
                }
            }

            let registry = Arc::new(ConnectionRegistry::new(config.issuance.registry_ttl()));
            let issuer = CertIssuer::new(Arc::clone(&root), registry)
                .with_log_guard(log_guard)
                .with_key_algorithm(config.issuance.key_algorithm);
            let mut acceptor =
                TlsAcceptor::new(Arc::new(issuer)).with_alpn(&config.issuance.alpn);
            acceptor = match backdate {
                Some(at) => {
                    info!("backdating issued certificates to {}", at);
                    acceptor.with_backdate_source(Arc::new(FixedBackdate(at)))
                }
                None => acceptor.with_backdate_source(Arc::new(NoBackdate)),
            };

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to create tokio runtime")?;
            rt.block_on(with_ctrl_c(|cancel| async move {
                let server = InterceptServer::bind(listen, acceptor)
                    .await
                    .with_context(|| format!("failed to listen on {listen}"))?
                    .with_upstream_port(upstream_port);
                server.run(cancel).await.context("intercept server failed")
            }))
        }
    }
}

/// Runs `task` with a token cancelled on Ctrl-C.
async fn with_ctrl_c<F, Fut, T>(task: F) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, cancelling");
                trigger.cancel();
            }
            Err(e) => warn!("failed to listen for Ctrl-C: {}", e),
        }
    });

    let result = task(cancel).await;
    watcher.abort();
    result
}
