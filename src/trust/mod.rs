//! Trust provisioning: making the root CA trusted by the host.
//!
//! Each mechanism is a [`TrustProvider`]. The [`Provisioner`] runs them in
//! order on the startup path:
//!
//! 1. [`SystemTrustStore`] writes the certificate into every OS anchor
//!    directory and runs the distribution's update tools.
//! 2. [`JavaKeystore`] imports it into the JVM `cacerts` keystore.
//! 3. [`EnvPropagator`] writes a bundle file for Node.js and Python and
//!    returns the [`EnvExport`] naming it.
//!
//! Any failure aborts provisioning.

pub mod command;
pub mod env;
pub mod java;
pub mod system;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use command::{CommandError, CommandOutput, CommandRunner, SystemCommandRunner};
pub use env::{EnvExport, EnvPropagator};
pub use java::JavaKeystore;
pub use system::{SystemTrustStore, TrustStoreLocator, TrustUpdateTool};

use crate::config::CaConfig;

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("no valid CA store path found")]
    NoTrustStore,
    #[error("no valid CA store tools command found")]
    NoUpdateTool,
    #[error("failed to write CA certificate to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write CA certificate temp file: {0}")]
    TempFile(#[source] std::io::Error),
    #[error(transparent)]
    Command(CommandError),
    #[error("trust provisioning cancelled")]
    Cancelled,
    #[error("java detected but its home could not be determined: {0}")]
    JavaHome(String),
    #[error("no CA certificate file available to import")]
    NoCertificateFile,
}

/// State threaded through the providers of one provisioning run.
#[derive(Debug, Clone, Default)]
pub struct InstallContext {
    /// PEM of the root certificate being installed.
    pub cert_pem: String,
    /// Certificate files written into anchor directories.
    pub anchor_files: Vec<PathBuf>,
    /// Bundle file and the environment variables that should name it.
    pub env_export: Option<EnvExport>,
}

impl InstallContext {
    pub fn new(cert_pem: impl Into<String>) -> Self {
        Self {
            cert_pem: cert_pem.into(),
            ..Self::default()
        }
    }
}

/// A mechanism that makes a certificate trusted.
#[async_trait]
pub trait TrustProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this mechanism applies on this host. `Ok(false)` skips it;
    /// an error aborts provisioning.
    fn detect(&self) -> Result<bool, TrustError>;

    async fn install(
        &self,
        ctx: &mut InstallContext,
        cancel: &CancellationToken,
    ) -> Result<(), TrustError>;
}

/// Runs trust providers in registration order.
#[derive(Default)]
pub struct Provisioner {
    providers: Vec<Box<dyn TrustProvider>>,
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl TrustProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// The standard sequence, configured from `config`.
    pub fn from_config(config: &CaConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let trust = &config.trust;
        let system = SystemTrustStore::new(
            TrustStoreLocator::new(trust.store_paths.iter().cloned()),
            Arc::clone(&runner),
        )
        .with_tools(trust.update_tools.clone())
        .with_cert_file_name(trust.cert_file_name.clone());

        let mut provisioner = Self::new().with_provider(system);

        if config.java.enabled {
            let java = JavaKeystore::new(runner)
                .with_java_home(config.java.java_home.clone())
                .with_alias(config.java.alias.clone())
                .with_store_password(config.java.store_password.clone())
                .with_cert_file(config.java.cert_file.clone());
            provisioner = provisioner.with_provider(java);
        }

        provisioner.with_provider(
            EnvPropagator::new()
                .with_variables(config.env.variables.clone())
                .with_temp_dir(config.env.temp_dir.clone()),
        )
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Installs `cert_pem` through every applicable provider.
    pub async fn provision(
        &self,
        cert_pem: &str,
        cancel: &CancellationToken,
    ) -> Result<InstallContext, TrustError> {
        let mut ctx = InstallContext::new(cert_pem);

        for provider in &self.providers {
            if cancel.is_cancelled() {
                return Err(TrustError::Cancelled);
            }
            if !provider.detect()? {
                debug!("{} not present, skipping", provider.name());
                continue;
            }
            provider.install(&mut ctx, cancel).await?;
            info!("{} provisioned", provider.name());
        }

        Ok(ctx)
    }
}
