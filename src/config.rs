use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ca::KeyAlgorithm;
use crate::trust::env::{NODE_EXTRA_CA_CERTS, REQUESTS_CA_BUNDLE};
use crate::trust::java::{DEFAULT_ALIAS, DEFAULT_STORE_PASSWORD};
use crate::trust::system::{DEFAULT_CERT_FILE_NAME, DEFAULT_STORE_PATHS, TrustUpdateTool};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Overrides the embedded root CA with PEM files on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootConfig {
    /// Root certificate PEM.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// Root private key PEM. Required together with `cert`.
    #[serde(default)]
    pub key: Option<PathBuf>,
}

/// OS trust store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Candidate anchor directories, in order.
    #[serde(default = "default_store_paths")]
    pub store_paths: Vec<PathBuf>,
    /// Bundle update commands. Every one present on `PATH` runs.
    #[serde(default = "TrustUpdateTool::defaults")]
    pub update_tools: Vec<TrustUpdateTool>,
    /// File name written into each anchor directory.
    #[serde(default = "default_cert_file_name")]
    pub cert_file_name: String,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            store_paths: default_store_paths(),
            update_tools: TrustUpdateTool::defaults(),
            cert_file_name: default_cert_file_name(),
        }
    }
}

/// JVM keystore settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JavaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Java home. When unset it is queried from the `java` on `PATH`.
    #[serde(default)]
    pub java_home: Option<PathBuf>,
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default = "default_store_password")]
    pub store_password: String,
    /// Certificate file to import. Defaults to the first file written into
    /// a system anchor directory.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
}

impl Default for JavaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            java_home: None,
            alias: default_alias(),
            store_password: default_store_password(),
            cert_file: None,
        }
    }
}

/// Environment variable propagation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Variables set to the bundle path.
    #[serde(default = "default_env_variables")]
    pub variables: Vec<String>,
    /// Directory for the bundle file. Defaults to the system temp dir.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            variables: default_env_variables(),
            temp_dir: None,
        }
    }
}

/// Leaf issuance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuanceConfig {
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
    /// Lifetime of a source port registry entry.
    #[serde(default = "default_registry_ttl_secs")]
    pub registry_ttl_secs: u64,
    /// ALPN protocols offered by the intercepting listener.
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,
}

impl IssuanceConfig {
    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self {
            key_algorithm: KeyAlgorithm::default(),
            registry_ttl_secs: default_registry_ttl_secs(),
            alpn: default_alpn(),
        }
    }
}

/// Configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    /// Config version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub root: RootConfig,

    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub java: JavaConfig,

    #[serde(default)]
    pub env: EnvConfig,

    #[serde(default)]
    pub issuance: IssuanceConfig,
}

fn default_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_store_paths() -> Vec<PathBuf> {
    DEFAULT_STORE_PATHS.iter().map(PathBuf::from).collect()
}

fn default_cert_file_name() -> String {
    DEFAULT_CERT_FILE_NAME.to_string()
}

fn default_alias() -> String {
    DEFAULT_ALIAS.to_string()
}

fn default_store_password() -> String {
    DEFAULT_STORE_PASSWORD.to_string()
}

fn default_env_variables() -> Vec<String> {
    vec![NODE_EXTRA_CA_CERTS.to_string(), REQUESTS_CA_BUNDLE.to_string()]
}

fn default_registry_ttl_secs() -> u64 {
    600
}

fn default_alpn() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}

impl CaConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.cert.is_some() != self.root.key.is_some() {
            return Err(ConfigError::Invalid(
                "root.cert and root.key must be set together".to_string(),
            ));
        }

        let name = &self.trust.cert_file_name;
        if name.is_empty() || name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "trust.cert_file_name must be a plain file name: {name:?}"
            )));
        }
        for tool in &self.trust.update_tools {
            if tool.program.is_empty() || tool.program.chars().any(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "update tool program must be a single word: {:?}",
                    tool.program
                )));
            }
        }

        if self.java.alias.is_empty() {
            return Err(ConfigError::Invalid("java.alias is empty".to_string()));
        }

        for var in &self.env.variables {
            if var.is_empty() || var.contains('=') || var.contains('\0') {
                return Err(ConfigError::Invalid(format!(
                    "invalid environment variable name: {var:?}"
                )));
            }
        }

        if self.issuance.registry_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "issuance.registry_ttl_secs must be positive".to_string(),
            ));
        }
        if self.issuance.alpn.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(ConfigError::Invalid(
                "ALPN protocol names must be 1 to 255 bytes".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            root: RootConfig::default(),
            trust: TrustConfig::default(),
            java: JavaConfig::default(),
            env: EnvConfig::default(),
            issuance: IssuanceConfig::default(),
        }
    }
}
