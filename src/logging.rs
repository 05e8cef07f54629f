//! Tracing setup and the one-time signer log quieting guard.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use tracing::{debug, error, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

/// Log targets that are noisy on every handshake.
pub const SIGNER_LOG_TARGETS: &[&str] = &["rustls", "rcgen"];

/// Runs a side effect exactly once, no matter how many threads race to
/// trigger it. Callers arriving while the first run is in progress block
/// until it completes.
pub struct LogLevelGuard {
    once: Once,
    action: Box<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for LogLevelGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelGuard")
            .field("completed", &self.once.is_completed())
            .finish()
    }
}

impl LogLevelGuard {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            once: Once::new(),
            action: Box::new(action),
        }
    }

    /// A guard whose side effect does nothing.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Runs the action if no caller has yet. A panicking action is logged
    /// and counts as the one run, so the guard stays usable.
    pub fn ensure(&self) {
        self.once.call_once(|| {
            if panic::catch_unwind(AssertUnwindSafe(|| (self.action)())).is_err() {
                error!("log level guard action panicked");
            }
        });
    }

    pub fn is_completed(&self) -> bool {
        self.once.is_completed()
    }
}

/// Handle to the process-wide log filter installed by [`init`].
#[derive(Clone)]
pub struct LogHandle {
    base_directives: String,
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogHandle {
    /// Lowers the signer-related targets to `error`, keeping the base filter.
    pub fn quiet_signer_logs(&self) {
        let directives = SIGNER_LOG_TARGETS
            .iter()
            .fold(self.base_directives.clone(), |acc, target| {
                format!("{acc},{target}=error")
            });

        match EnvFilter::try_new(&directives) {
            Ok(filter) => {
                if let Err(e) = self.handle.reload(filter) {
                    warn!("failed to reload log filter: {}", e);
                    return;
                }
                debug!("log filter now {}", directives);
            }
            Err(e) => warn!("invalid log directives {:?}: {}", directives, e),
        }
    }

    /// Builds the guard handed to the certificate issuer.
    pub fn signer_guard(&self) -> LogLevelGuard {
        let handle = self.clone();
        LogLevelGuard::new(move || handle.quiet_signer_logs())
    }
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `default_directives`.
pub fn init(default_directives: &str) -> LogHandle {
    let base_directives = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| EnvFilter::try_new(value).is_ok())
        .unwrap_or_else(|| default_directives.to_string());

    let filter = EnvFilter::try_new(&base_directives).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    LogHandle {
        base_directives,
        handle,
    }
}
