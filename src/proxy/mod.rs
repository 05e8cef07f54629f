//! TLS interception glue.
//!
//! [`TlsAcceptor`] plugs the certificate issuer into rustls' certificate
//! selection callback. [`InterceptServer`] is a minimal consumer that
//! terminates client connections and tunnels them to the hostname each
//! client asked for.

mod server;
mod tls;
mod tunnel;

pub use server::{ConnectionError, InterceptServer};
pub use tls::{BackdateSource, FixedBackdate, NoBackdate, TlsAcceptor, default_alpn};
pub use tunnel::{Tunnel, TunnelError};
