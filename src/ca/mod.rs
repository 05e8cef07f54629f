//! Root CA material and per-handshake leaf certificate issuance.
//!
//! The root is loaded once and shared read-only; leaves are signed on demand
//! for whatever hostname the client names in its ClientHello.

mod issuer;
mod root;

pub use issuer::{
    CertIssuer, ClientHelloInfo, IssueError, IssueResult, IssuedCert, KeyAlgorithm, LeafRequest,
    validity_window,
};
pub use root::{RootCa, RootCaError};
