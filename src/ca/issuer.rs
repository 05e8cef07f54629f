//! Leaf certificate issuance at TLS handshake time.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SignatureAlgorithm,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::root::RootCa;
use crate::logging::LogLevelGuard;
use crate::registry::ConnectionRegistry;

/// The result type for issuance operations.
pub type IssueResult<T> = Result<T, IssueError>;

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("client hello carries no server name")]
    MissingServerName,
    #[error("invalid hostname for certificate: {0}")]
    InvalidHostname(String),
    #[error("failed to generate leaf key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to sign leaf certificate: {0}")]
    Signing(#[source] rcgen::Error),
    #[error("failed to load leaf certificate and key: {0}")]
    KeyPairLoad(#[source] rustls::Error),
}

/// Key type generated for each leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

/// What the TLS layer knows about a connection when it asks for a certificate.
#[derive(Debug, Clone)]
pub struct ClientHelloInfo {
    /// SNI hostname announced by the client.
    pub server_name: Option<String>,
    /// Remote address of the underlying TCP connection.
    pub peer_addr: SocketAddr,
}

/// The subject a leaf certificate is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRequest {
    pub common_name: String,
    pub hosts: Vec<String>,
    pub key_algorithm: KeyAlgorithm,
}

impl LeafRequest {
    /// A request whose common name and only SAN are `hostname`.
    pub fn for_hostname(hostname: &str, key_algorithm: KeyAlgorithm) -> Self {
        Self {
            common_name: hostname.to_string(),
            hosts: vec![hostname.to_string()],
            key_algorithm,
        }
    }

    /// Certificate parameters under the server profile, validity left unset.
    fn to_params(&self) -> IssueResult<CertificateParams> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name.as_str());

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = self
            .hosts
            .iter()
            .map(|host| san_for(host))
            .collect::<IssueResult<Vec<_>>>()?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        Ok(params)
    }
}

fn san_for(host: &str) -> IssueResult<SanType> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    let name = host
        .try_into()
        .map_err(|_| IssueError::InvalidHostname(host.to_string()))?;
    Ok(SanType::DnsName(name))
}

/// Computes `[reference - 1 year, now + 1 year]`, where the reference is the
/// backdate if one is given and `now` otherwise.
///
/// The start is anchored to the backdate so that an application whose clock
/// is frozen in the past still sees the certificate as valid; the end is
/// anchored to the real clock.
pub fn validity_window(
    backdate: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> (OffsetDateTime, OffsetDateTime) {
    let reference = backdate.unwrap_or(now);
    (shift_years(reference, -1), shift_years(now, 1))
}

/// Calendar-year shift. Feb 29 lands on Mar 1 when the target year has none.
fn shift_years(at: OffsetDateTime, years: i32) -> OffsetDateTime {
    let year = at.year() + years;
    match at.replace_year(year) {
        Ok(shifted) => shifted,
        Err(_) => at
            .replace_day(28)
            .and_then(|day| day.replace_year(year))
            .map(|day| day + Duration::days(1))
            .unwrap_or(at),
    }
}

/// A freshly signed leaf, ready to be served for a single handshake.
pub struct IssuedCert {
    certified_key: Arc<CertifiedKey>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl std::fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCert")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl IssuedCert {
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }
}

/// Signs per-handshake leaf certificates with the root CA.
///
/// Safe to share across threads: the root is read-only, the registry is
/// internally synchronized, and the log guard runs its side effect once.
/// Nothing is cached, so every call produces a new key and certificate.
pub struct CertIssuer {
    root: Arc<RootCa>,
    registry: Arc<ConnectionRegistry>,
    log_guard: Arc<LogLevelGuard>,
    key_algorithm: KeyAlgorithm,
    provider: Arc<CryptoProvider>,
}

impl CertIssuer {
    pub fn new(root: Arc<RootCa>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            root,
            registry,
            log_guard: Arc::new(LogLevelGuard::noop()),
            key_algorithm: KeyAlgorithm::default(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Sets the guard run before the first issuance.
    pub fn with_log_guard(mut self, log_guard: Arc<LogLevelGuard>) -> Self {
        self.log_guard = log_guard;
        self
    }

    pub fn with_key_algorithm(mut self, key_algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = key_algorithm;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn root(&self) -> &RootCa {
        &self.root
    }

    /// Issues a leaf certificate for the hostname in `hello`.
    ///
    /// Records `source port -> hostname` in the registry before signing.
    /// `backdate` shifts the start of the validity window; `None` uses the
    /// current time.
    pub fn issue(
        &self,
        hello: &ClientHelloInfo,
        backdate: Option<OffsetDateTime>,
    ) -> IssueResult<IssuedCert> {
        self.log_guard.ensure();

        let hostname = hello
            .server_name
            .as_deref()
            .ok_or(IssueError::MissingServerName)?;
        self.registry.record(hello.peer_addr.port(), hostname);

        self.sign(&LeafRequest::for_hostname(hostname, self.key_algorithm), backdate)
    }

    /// Signs a leaf for an explicit request, without touching the registry.
    pub fn sign(
        &self,
        request: &LeafRequest,
        backdate: Option<OffsetDateTime>,
    ) -> IssueResult<IssuedCert> {
        let key_pair = KeyPair::generate_for(request.key_algorithm.signature_algorithm())
            .map_err(IssueError::KeyGeneration)?;
        let mut params = request.to_params()?;

        if backdate.is_none() {
            debug!("no backdate supplied, using current time");
        }
        let (not_before, not_after) = validity_window(backdate, OffsetDateTime::now_utc());
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key_pair, self.root.issuer())
            .map_err(IssueError::Signing)?;

        debug!(
            "signed certificate for {} valid from {} to {}",
            request.common_name, not_before, not_after
        );

        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let chain = vec![cert_der.clone(), self.root.cert_der().clone()];
        let certified_key = CertifiedKey::from_der(chain, key_der, &self.provider)
            .map_err(IssueError::KeyPairLoad)?;

        Ok(IssuedCert {
            certified_key: Arc::new(certified_key),
            cert_der,
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            not_before,
            not_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use rustls::RootCertStore;
    use rustls::client::WebPkiServerVerifier;
    use rustls::client::danger::ServerCertVerifier;
    use rustls::pki_types::{ServerName, UnixTime};
    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    fn hello(host: &str, port: u16) -> ClientHelloInfo {
        ClientHelloInfo {
            server_name: Some(host.to_string()),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    fn issuer_with(root: RootCa) -> CertIssuer {
        CertIssuer::new(Arc::new(root), Arc::new(ConnectionRegistry::default()))
    }

    fn test_issuer() -> CertIssuer {
        issuer_with(RootCa::generate("issuer test root").unwrap())
    }

    fn verify_at(
        root: &RootCa,
        leaf: &CertificateDer<'static>,
        host: &str,
        at: OffsetDateTime,
    ) -> Result<(), rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.add(root.cert_der().clone()).unwrap();
        let verifier = WebPkiServerVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(rustls::crypto::ring::default_provider()),
        )
        .build()
        .unwrap();
        let name = ServerName::try_from(host.to_string()).unwrap();
        let now = UnixTime::since_unix_epoch(std::time::Duration::from_secs(
            at.unix_timestamp() as u64,
        ));
        verifier
            .verify_server_cert(leaf, &[], &name, &[], now)
            .map(|_| ())
    }

    fn one_year_seconds_around(at: OffsetDateTime, years: i32) -> i64 {
        shift_years(at, years).unix_timestamp()
    }

    /// The leaf's common name and its only SAN are the SNI hostname.
    #[test]
    fn subject_matches_hostname() {
        let issuer = test_issuer();
        for host in ["example.com", "api.internal.test", "a.b.c.d.example.org"] {
            let issued = issuer.issue(&hello(host, 40000), None).unwrap();
            let (_, cert) = parse_x509_certificate(issued.cert_der().as_ref()).unwrap();

            let cn = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap();
            assert_eq!(cn, host);

            let san = cert.subject_alternative_name().unwrap().unwrap();
            assert_eq!(san.value.general_names.len(), 1);
            assert!(matches!(
                san.value.general_names[0],
                GeneralName::DNSName(name) if name == host
            ));
        }
    }

    #[test]
    fn ip_literal_gets_ip_san() {
        let issuer = test_issuer();
        let issued = issuer.issue(&hello("10.1.2.3", 40001), None).unwrap();
        let (_, cert) = parse_x509_certificate(issued.cert_der().as_ref()).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        assert!(matches!(
            san.value.general_names[0],
            GeneralName::IPAddress(bytes) if bytes == [10, 1, 2, 3]
        ));
    }

    /// Leaves chain to the issuing root across the whole validity window and
    /// never to an unrelated root.
    #[test]
    fn leaf_verifies_against_issuing_root_only() {
        let root = Arc::new(RootCa::generate("verifying root").unwrap());
        let other = RootCa::generate("unrelated root").unwrap();
        let issuer = CertIssuer::new(Arc::clone(&root), Arc::new(ConnectionRegistry::default()));

        let issued = issuer.issue(&hello("verify.example", 40002), None).unwrap();
        let leaf = issued.cert_der();

        verify_at(&root, leaf, "verify.example", OffsetDateTime::now_utc()).unwrap();
        verify_at(&root, leaf, "verify.example", issued.not_before() + Duration::seconds(1))
            .unwrap();
        verify_at(&root, leaf, "verify.example", issued.not_after() - Duration::seconds(1))
            .unwrap();

        assert!(verify_at(&other, leaf, "verify.example", OffsetDateTime::now_utc()).is_err());
        assert!(verify_at(&root, leaf, "other.example", OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn embedded_root_signs_verifiable_leaves() {
        let root = Arc::new(RootCa::embedded().unwrap());
        let issuer = CertIssuer::new(Arc::clone(&root), Arc::new(ConnectionRegistry::default()));
        let issued = issuer.issue(&hello("embedded.example", 40003), None).unwrap();
        verify_at(&root, issued.cert_der(), "embedded.example", OffsetDateTime::now_utc())
            .unwrap();
    }

    /// A backdate moves NotBefore to exactly one year before it, while
    /// NotAfter stays one year after the real clock.
    #[test]
    fn backdate_anchors_not_before() {
        let issuer = test_issuer();
        let backdate = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();
        let before_call = OffsetDateTime::now_utc();
        let issued = issuer
            .issue(&hello("frozen.example", 40004), Some(backdate))
            .unwrap();

        let (_, cert) = parse_x509_certificate(issued.cert_der().as_ref()).unwrap();
        assert_eq!(
            cert.validity().not_before.timestamp(),
            shift_years(backdate, -1).unix_timestamp()
        );

        let expected_after = one_year_seconds_around(before_call, 1);
        let not_after = cert.validity().not_after.timestamp();
        assert!((not_after - expected_after).abs() <= 5);
    }

    #[test]
    fn missing_backdate_uses_now() {
        let issuer = test_issuer();
        let before_call = OffsetDateTime::now_utc();
        let issued = issuer.issue(&hello("now.example", 40005), None).unwrap();

        let (_, cert) = parse_x509_certificate(issued.cert_der().as_ref()).unwrap();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        assert!((not_before - one_year_seconds_around(before_call, -1)).abs() <= 5);
        assert!((not_after - one_year_seconds_around(before_call, 1)).abs() <= 5);
    }

    /// A handshake frozen at the backdate still accepts the leaf.
    #[test]
    fn backdated_leaf_valid_at_frozen_time() {
        let root = Arc::new(RootCa::generate("frozen root").unwrap());
        let issuer = CertIssuer::new(Arc::clone(&root), Arc::new(ConnectionRegistry::default()));
        let frozen = OffsetDateTime::now_utc() - Duration::days(400);
        let issued = issuer
            .issue(&hello("frozen.example", 40006), Some(frozen))
            .unwrap();
        verify_at(&root, issued.cert_der(), "frozen.example", frozen).unwrap();
    }

    #[test]
    fn leap_day_shift_rolls_to_march() {
        let leap = OffsetDateTime::from_unix_timestamp(1_709_208_000).unwrap(); // 2024-02-29 12:00 UTC
        let shifted = shift_years(leap, -1);
        assert_eq!(shifted.year(), 2023);
        assert_eq!(shifted.month(), time::Month::March);
        assert_eq!(shifted.day(), 1);
        assert_eq!(shifted.hour(), 12);
    }

    #[test]
    fn missing_sni_fails_without_registry_entry() {
        let issuer = test_issuer();
        let hello = ClientHelloInfo {
            server_name: None,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 40007)),
        };
        assert!(matches!(
            issuer.issue(&hello, None),
            Err(IssueError::MissingServerName)
        ));
        assert!(issuer.registry().is_empty());
    }

    #[test]
    fn invalid_hostname_rejected() {
        let issuer = test_issuer();
        let err = issuer
            .issue(&hello("bad\u{e9}host.example", 40008), None)
            .unwrap_err();
        assert!(matches!(err, IssueError::InvalidHostname(_)));
    }

    /// Every call signs a new key; nothing is reused between handshakes.
    #[test]
    fn each_issue_is_fresh() {
        let issuer = test_issuer();
        let first = issuer.issue(&hello("fresh.example", 40009), None).unwrap();
        let second = issuer.issue(&hello("fresh.example", 40010), None).unwrap();
        assert_ne!(first.cert_der(), second.cert_der());
        assert_ne!(first.key_pem(), second.key_pem());
    }

    #[test]
    fn alternative_key_algorithms() {
        let root = Arc::new(RootCa::generate("algorithm root").unwrap());
        for algorithm in [KeyAlgorithm::EcdsaP384, KeyAlgorithm::Ed25519] {
            let issuer = CertIssuer::new(Arc::clone(&root), Arc::new(ConnectionRegistry::default()))
                .with_key_algorithm(algorithm);
            let issued = issuer.issue(&hello("algo.example", 40011), None).unwrap();
            verify_at(&root, issued.cert_der(), "algo.example", OffsetDateTime::now_utc())
                .unwrap();
        }
    }

    /// Concurrent handshakes on distinct ports each leave their own mapping
    /// and the log guard fires once.
    #[test]
    fn concurrent_issuance_populates_registry() {
        let runs = Arc::new(AtomicUsize::new(0));
        let guard = {
            let runs = Arc::clone(&runs);
            Arc::new(LogLevelGuard::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let issuer = Arc::new(test_issuer().with_log_guard(guard));

        let handles: Vec<_> = (0..16u16)
            .map(|i| {
                let issuer = Arc::clone(&issuer);
                thread::spawn(move || {
                    let host = format!("host{}.example", i);
                    issuer.issue(&hello(&host, 41000 + i), None).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(issuer.registry().len(), 16);
        for i in 0..16u16 {
            assert_eq!(
                issuer.registry().get(41000 + i),
                Some(format!("host{}.example", i))
            );
        }
    }
}
