//! Root CA material: the embedded trust anchor and its signing key.

use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;
use rustls::pki_types::pem::PemObject;
use time::{Duration, OffsetDateTime};
use tracing::debug;

const EMBEDDED_CA_CERT: &str = include_str!("../../assets/ca.crt");
const EMBEDDED_CA_KEY: &str = include_str!("../../assets/ca.key");

#[derive(Debug, thiserror::Error)]
pub enum RootCaError {
    #[error("invalid root CA certificate: {0}")]
    InvalidCertificate(String),
    #[error("invalid root CA signing key: {0}")]
    InvalidKey(#[source] rcgen::Error),
    #[error("root CA signing key does not match the certificate public key")]
    KeyMismatch,
    #[error("failed to read root CA material from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to generate root CA: {0}")]
    Generation(#[source] rcgen::Error),
}

/// The root certificate authority every leaf is signed by.
///
/// The signing key is parsed into an [`rcgen::KeyPair`] when the root is
/// loaded, so any root that exists is able to sign. The signature algorithm
/// used for leaves follows the key's own algorithm.
pub struct RootCa {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl RootCa {
    /// Loads the root CA compiled into the binary.
    pub fn embedded() -> Result<Self, RootCaError> {
        Self::from_pem(EMBEDDED_CA_CERT, EMBEDDED_CA_KEY)
    }

    /// Loads a root CA from PEM files on disk.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, RootCaError> {
        let read = |path: &Path| {
            fs::read_to_string(path).map_err(|source| RootCaError::Io {
                path: path.display().to_string(),
                source,
            })
        };
        let cert_pem = read(cert_path.as_ref())?;
        let key_pem = read(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Builds a root CA from a PEM certificate and a PEM (PKCS#8) private key.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, RootCaError> {
        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|e| RootCaError::InvalidCertificate(e.to_string()))?;
        let key_pair = KeyPair::from_pem(key_pem).map_err(RootCaError::InvalidKey)?;

        let (_, parsed) = x509_parser::parse_x509_certificate(cert_der.as_ref())
            .map_err(|e| RootCaError::InvalidCertificate(e.to_string()))?;
        if parsed.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
            return Err(RootCaError::KeyMismatch);
        }

        debug!(algorithm = ?key_pair.algorithm(), "loaded root CA certificate");

        let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)
            .map_err(|e| RootCaError::InvalidCertificate(e.to_string()))?;

        Ok(Self {
            cert_der,
            cert_pem: cert_pem.to_string(),
            issuer,
        })
    }

    /// Generates a fresh self-signed root, for tests and throwaway
    /// environments.
    pub fn generate(common_name: &str) -> Result<Self, RootCaError> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "intercept-ca");

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(365 * 5);
        params.not_after = now + Duration::days(365 * 10);

        let key_pair = KeyPair::generate().map_err(RootCaError::Generation)?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(RootCaError::Generation)?;

        debug!("generated root CA certificate {}", common_name);

        Ok(Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            issuer: Issuer::new(params, key_pair),
        })
    }

    /// Returns the CA certificate in PEM format.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns the CA certificate in DER format.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}
