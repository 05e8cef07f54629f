//! Exposes the root certificate to runtimes that read a CA bundle path from
//! the environment.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{InstallContext, TrustError, TrustProvider};

/// Node.js extra CA bundle.
pub const NODE_EXTRA_CA_CERTS: &str = "NODE_EXTRA_CA_CERTS";
/// Python `requests` CA bundle.
pub const REQUESTS_CA_BUNDLE: &str = "REQUESTS_CA_BUNDLE";

const TEMP_FILE_ATTEMPTS: u32 = 16;
const BUNDLE_MODE: u32 = 0o666;

/// Writes the certificate to a world-readable temp file for runtimes that
/// read a bundle path from the environment.
///
/// Nothing here touches the process environment. The returned [`EnvExport`]
/// is applied to child commands, or exported by the caller while it is
/// still single-threaded.
#[derive(Debug, Clone)]
pub struct EnvPropagator {
    variables: Vec<String>,
    temp_dir: Option<PathBuf>,
}

impl EnvPropagator {
    pub fn new() -> Self {
        Self {
            variables: vec![NODE_EXTRA_CA_CERTS.to_string(), REQUESTS_CA_BUNDLE.to_string()],
            temp_dir: None,
        }
    }

    pub fn with_variables(mut self, variables: Vec<String>) -> Self {
        self.variables = variables;
        self
    }

    /// Directory for the bundle file. Defaults to the system temp dir.
    pub fn with_temp_dir(mut self, temp_dir: Option<PathBuf>) -> Self {
        self.temp_dir = temp_dir;
        self
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Writes `pem` to a fresh file and returns the variables that should
    /// point at it.
    pub fn propagate(&self, pem: &str) -> Result<EnvExport, TrustError> {
        let dir = self.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
        let path = write_bundle(&dir, pem).map_err(TrustError::TempFile)?;
        info!(
            "CA bundle written to {} for {}",
            path.display(),
            self.variables.join(", ")
        );
        Ok(EnvExport {
            path,
            variables: self.variables.clone(),
        })
    }
}

/// A written CA bundle and the environment variables that name it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvExport {
    path: PathBuf,
    variables: Vec<String>,
}

impl EnvExport {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// `(name, value)` pairs to set.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.variables
            .iter()
            .map(move |name| (name.as_str(), self.path.as_path()))
    }

    /// Sets the variables on a child command.
    pub fn apply_to(&self, command: &mut std::process::Command) {
        command.envs(self.vars());
    }

    /// Shell `export` lines, for `eval` by a parent shell.
    pub fn shell_exports(&self) -> String {
        self.vars()
            .map(|(name, path)| format!("export {}='{}'\n", name, path.display()))
            .collect()
    }

    /// Sets the variables in this process's environment.
    ///
    /// # Safety
    ///
    /// No other thread may read or write the environment concurrently. Call
    /// it before any runtime or other thread is started, or after every one
    /// has been shut down.
    pub unsafe fn export(&self) {
        for (name, path) in self.vars() {
            // SAFETY: upheld by the caller.
            unsafe { std::env::set_var(name, path) };
            debug!("{}={}", name, path.display());
        }
    }
}

impl Default for EnvPropagator {
    fn default() -> Self {
        Self::new()
    }
}

/// Creates a uniquely named file in `dir`, mode 0666, holding `pem`.
fn write_bundle(dir: &Path, pem: &str) -> io::Result<PathBuf> {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    for attempt in 0..TEMP_FILE_ATTEMPTS {
        let path = dir.join(format!("intercept-ca-{pid}-{nanos}-{attempt}.crt"));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        };
        // Explicit chmod so the umask does not narrow it.
        fs::set_permissions(&path, fs::Permissions::from_mode(BUNDLE_MODE))?;
        file.write_all(pem.as_bytes())?;
        file.sync_all()?;
        return Ok(path);
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no unique CA bundle file name available",
    ))
}

#[async_trait]
impl TrustProvider for EnvPropagator {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn detect(&self) -> Result<bool, TrustError> {
        Ok(!self.variables.is_empty())
    }

    async fn install(
        &self,
        ctx: &mut InstallContext,
        _cancel: &CancellationToken,
    ) -> Result<(), TrustError> {
        ctx.env_export = Some(self.propagate(&ctx.cert_pem)?);
        Ok(())
    }
}
