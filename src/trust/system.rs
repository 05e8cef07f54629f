//! OS trust anchor directories and the tools that rebuild the system bundle.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::command::{CommandError, CommandRunner};
use super::{InstallContext, TrustError, TrustProvider};

/// Anchor directories used by the common Linux and BSD distributions.
pub const DEFAULT_STORE_PATHS: &[&str] = &[
    "/usr/local/share/ca-certificates/",
    "/etc/pki/ca-trust/source/anchors/",
    "/etc/ca-certificates/trust-source/anchors/",
    "/etc/pki/trust/anchors/",
    "/usr/local/share/certs/",
    "/etc/ssl/certs/",
];

/// File name written into each anchor directory.
pub const DEFAULT_CERT_FILE_NAME: &str = "ca.crt";

/// A command that regenerates the system trust bundle from the anchors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustUpdateTool {
    /// Program name resolved on `PATH`.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

impl TrustUpdateTool {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Debian, RHEL, Arch, SUSE and FreeBSD update tools.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("update-ca-certificates", &[]),
            Self::new("update-ca-trust", &[]),
            Self::new("trust", &["extract-compat"]),
            Self::new("tools-ca-trust", &["extract"]),
            Self::new("certctl", &["rehash"]),
        ]
    }
}

impl std::fmt::Display for TrustUpdateTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Filters a fixed candidate list down to the anchor directories present on
/// this host.
#[derive(Debug, Clone)]
pub struct TrustStoreLocator {
    candidates: Vec<PathBuf>,
}

impl TrustStoreLocator {
    pub fn new(candidates: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
        }
    }

    /// A locator over [`DEFAULT_STORE_PATHS`].
    pub fn system() -> Self {
        Self::new(DEFAULT_STORE_PATHS.iter().copied())
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// Returns the existing directories, in candidate order.
    pub fn locate(&self) -> Result<Vec<PathBuf>, TrustError> {
        let found: Vec<PathBuf> = self
            .candidates
            .iter()
            .filter(|dir| dir.is_dir())
            .cloned()
            .collect();

        if found.is_empty() {
            return Err(TrustError::NoTrustStore);
        }
        debug!("located trust stores: {:?}", found);
        Ok(found)
    }
}

impl Default for TrustStoreLocator {
    fn default() -> Self {
        Self::system()
    }
}

/// Installs the root certificate into every located anchor directory and
/// then runs the update tools.
pub struct SystemTrustStore {
    locator: TrustStoreLocator,
    tools: Vec<TrustUpdateTool>,
    cert_file_name: String,
    runner: Arc<dyn CommandRunner>,
}

impl SystemTrustStore {
    pub fn new(locator: TrustStoreLocator, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            locator,
            tools: TrustUpdateTool::defaults(),
            cert_file_name: DEFAULT_CERT_FILE_NAME.to_string(),
            runner,
        }
    }

    pub fn with_tools(mut self, tools: Vec<TrustUpdateTool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cert_file_name(mut self, name: impl Into<String>) -> Self {
        self.cert_file_name = name.into();
        self
    }

    pub fn locator(&self) -> &TrustStoreLocator {
        &self.locator
    }

    /// Writes `pem` to `<dir>/<cert file name>`, replacing any previous copy.
    pub fn install_into(&self, dir: &Path, pem: &str) -> Result<PathBuf, TrustError> {
        let path = dir.join(&self.cert_file_name);
        fs::write(&path, pem).map_err(|source| TrustError::Write {
            path: path.clone(),
            source,
        })?;
        debug!("wrote CA certificate to {}", path.display());
        Ok(path)
    }

    /// Runs every update tool present on `PATH`, in order. Returns how many
    /// ran.
    pub async fn update(&self, cancel: &CancellationToken) -> Result<usize, TrustError> {
        let mut ran = 0;
        for tool in &self.tools {
            if !self.runner.exists(&tool.program) {
                debug!("trust update tool {} not found", tool.program);
                continue;
            }
            ran += 1;

            let output = self
                .runner
                .run(&tool.program, &tool.args, cancel)
                .await
                .map_err(|e| match e {
                    CommandError::Cancelled { .. } => TrustError::Cancelled,
                    other => TrustError::Command(other),
                })?;
            debug!("{} output: {}", tool, output.combined.trim());
        }

        if ran == 0 {
            return Err(TrustError::NoUpdateTool);
        }
        Ok(ran)
    }

    /// Writes the certificate into each located directory, then updates the
    /// system bundle. Nothing is written when no directory is found.
    pub async fn install_all(
        &self,
        pem: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>, TrustError> {
        let dirs = self.locator.locate()?;

        let mut written = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            written.push(self.install_into(dir, pem)?);
        }

        let ran = self.update(cancel).await?;
        info!(
            "installed CA certificate into {} trust store(s), ran {} update tool(s)",
            written.len(),
            ran
        );
        Ok(written)
    }
}

#[async_trait]
impl TrustProvider for SystemTrustStore {
    fn name(&self) -> &'static str {
        "system trust store"
    }

    fn detect(&self) -> Result<bool, TrustError> {
        self.locator.locate().map(|_| true)
    }

    async fn install(
        &self,
        ctx: &mut InstallContext,
        cancel: &CancellationToken,
    ) -> Result<(), TrustError> {
        let written = self.install_all(&ctx.cert_pem, cancel).await?;
        ctx.anchor_files.extend(written);
        Ok(())
    }
}
