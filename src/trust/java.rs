//! JVM `cacerts` keystore installation through `keytool`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::command::{CommandError, CommandRunner};
use super::{InstallContext, TrustError, TrustProvider};

/// Password shipped with every stock JDK keystore.
pub const DEFAULT_STORE_PASSWORD: &str = "changeit";

/// Alias the root certificate is imported under.
pub const DEFAULT_ALIAS: &str = "keployCA";

/// Imports the root certificate into the keystore of the `java` found on
/// `PATH`, or of an explicitly configured Java home.
pub struct JavaKeystore {
    runner: Arc<dyn CommandRunner>,
    java_home: Option<PathBuf>,
    alias: String,
    store_password: String,
    cert_file: Option<PathBuf>,
}

impl JavaKeystore {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            java_home: None,
            alias: DEFAULT_ALIAS.to_string(),
            store_password: DEFAULT_STORE_PASSWORD.to_string(),
            cert_file: None,
        }
    }

    pub fn with_java_home(mut self, java_home: Option<PathBuf>) -> Self {
        self.java_home = java_home;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_store_password(mut self, password: impl Into<String>) -> Self {
        self.store_password = password.into();
        self
    }

    /// Imports this file instead of the first anchor written by the system
    /// trust store.
    pub fn with_cert_file(mut self, cert_file: Option<PathBuf>) -> Self {
        self.cert_file = cert_file;
        self
    }

    pub fn is_installed(&self) -> bool {
        self.java_home.is_some() || self.runner.exists("java")
    }

    /// Configured Java home, or the `java.home` property reported by the
    /// runtime on `PATH`.
    pub async fn resolve_home(&self, cancel: &CancellationToken) -> Result<PathBuf, TrustError> {
        if let Some(home) = &self.java_home {
            return Ok(home.clone());
        }

        let args = ["-XshowSettings:properties", "-version"].map(String::from);
        let output = self
            .runner
            .run("java", &args, cancel)
            .await
            .map_err(|e| match e {
                CommandError::Cancelled { .. } => TrustError::Cancelled,
                other => TrustError::JavaHome(other.to_string()),
            })?;

        parse_java_home(&output.combined)
            .ok_or_else(|| TrustError::JavaHome("java.home not reported by runtime".to_string()))
    }

    /// Returns true if the keystore already holds our alias.
    pub async fn contains_alias(
        &self,
        keystore: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, TrustError> {
        let args = vec![
            "-list".to_string(),
            "-keystore".to_string(),
            keystore.display().to_string(),
            "-storepass".to_string(),
            self.store_password.clone(),
            "-alias".to_string(),
            self.alias.clone(),
        ];
        match self.runner.run("keytool", &args, cancel).await {
            Ok(_) => Ok(true),
            Err(CommandError::Cancelled { .. }) => Err(TrustError::Cancelled),
            Err(e) => {
                debug!("keytool -list: {}", e);
                Ok(false)
            }
        }
    }

    async fn import(
        &self,
        keystore: &Path,
        cert_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TrustError> {
        let args = vec![
            "-import".to_string(),
            "-trustcacerts".to_string(),
            "-keystore".to_string(),
            keystore.display().to_string(),
            "-storepass".to_string(),
            self.store_password.clone(),
            "-noprompt".to_string(),
            "-alias".to_string(),
            self.alias.clone(),
            "-file".to_string(),
            cert_file.display().to_string(),
        ];
        let output = self
            .runner
            .run("keytool", &args, cancel)
            .await
            .map_err(|e| match e {
                CommandError::Cancelled { .. } => TrustError::Cancelled,
                other => TrustError::Command(other),
            })?;
        debug!("keytool -import output: {}", output.combined.trim());
        Ok(())
    }

    /// Imports `cert_file` unless the alias is already present. Returns true
    /// if an import happened. Without a Java runtime this does nothing.
    pub async fn install_cert(
        &self,
        cert_file: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool, TrustError> {
        if !self.is_installed() {
            debug!("java is not installed");
            return Ok(false);
        }

        let home = self.resolve_home(cancel).await?;
        let keystore = keystore_path(&home);
        debug!(
            "java home {}, keystore {}, certificate {}",
            home.display(),
            keystore.display(),
            cert_file.display()
        );

        if self.contains_alias(&keystore, cancel).await? {
            debug!("alias {} already present in {}", self.alias, keystore.display());
            return Ok(false);
        }

        self.import(&keystore, cert_file, cancel).await?;
        info!("imported CA certificate into {}", keystore.display());
        Ok(true)
    }
}

/// `<home>/lib/security/cacerts`, the layout of JDK 9 and later.
pub fn keystore_path(java_home: &Path) -> PathBuf {
    java_home.join("lib").join("security").join("cacerts")
}

/// Extracts the `java.home = ...` property from `-XshowSettings` output.
pub fn parse_java_home(output: &str) -> Option<PathBuf> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        if key.trim() != "java.home" {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| PathBuf::from(value))
    })
}

#[async_trait]
impl TrustProvider for JavaKeystore {
    fn name(&self) -> &'static str {
        "java keystore"
    }

    fn detect(&self) -> Result<bool, TrustError> {
        Ok(self.is_installed())
    }

    async fn install(
        &self,
        ctx: &mut InstallContext,
        cancel: &CancellationToken,
    ) -> Result<(), TrustError> {
        let cert_file = self
            .cert_file
            .clone()
            .or_else(|| ctx.anchor_files.first().cloned())
            .ok_or(TrustError::NoCertificateFile)?;
        self.install_cert(&cert_file, cancel).await?;
        Ok(())
    }
}
