//! Source-port to SNI hostname registry.
//!
//! The issuance path records which hostname a client asked for during the
//! handshake, keyed by the client's ephemeral source port, so that later
//! connection-level processing can recover the destination.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

/// Default lifetime of a registry entry.
pub const DEFAULT_REGISTRY_TTL: Duration = Duration::from_secs(600);

/// Expired entries are swept every this many inserts.
const SWEEP_INTERVAL: u64 = 256;

struct RegistryEntry {
    hostname: String,
    recorded_at: Instant,
}

/// Concurrency-safe map from client source port to destination hostname.
///
/// Writes are last-writer-wins per port. Entries older than the TTL are never
/// returned and are dropped by [`ConnectionRegistry::evict_expired`].
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<u16, RegistryEntry>>,
    ttl: Duration,
    inserts: AtomicU64,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("entries", &"<RwLock>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            inserts: AtomicU64::new(0),
        }
    }

    // The map stays consistent across a panicking holder: every update is a
    // single insert, remove or retain.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<u16, RegistryEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u16, RegistryEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the hostname seen for a source port, replacing any previous
    /// entry for that port.
    pub fn record(&self, source_port: u16, hostname: &str) {
        self.write().insert(
            source_port,
            RegistryEntry {
                hostname: hostname.to_string(),
                recorded_at: Instant::now(),
            },
        );
        debug!("registered source port {} -> {}", source_port, hostname);

        let count = self.inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(SWEEP_INTERVAL) {
            self.evict_expired();
        }
    }

    /// Returns the hostname recorded for a source port, if still live.
    pub fn get(&self, source_port: u16) -> Option<String> {
        let entries = self.read();
        let entry = entries.get(&source_port)?;
        if entry.recorded_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.hostname.clone())
    }

    /// Removes and returns the entry for a source port.
    pub fn remove(&self, source_port: u16) -> Option<String> {
        self.write().remove(&source_port).map(|entry| entry.hostname)
    }

    /// Removes the entry for a source port only if it still maps to
    /// `hostname`. Returns whether an entry was removed.
    pub fn remove_if(&self, source_port: u16, hostname: &str) -> bool {
        let mut entries = self.write();
        match entries.get(&source_port) {
            Some(entry) if entry.hostname == hostname => {
                entries.remove(&source_port);
                true
            }
            _ => false,
        }
    }

    /// Drops every entry older than the TTL and returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.write();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|port, entry| {
            let keep = now.duration_since(entry.recorded_at) <= self.ttl;
            if !keep {
                debug!("expiring registry entry for port {}", port);
            }
            keep
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn record_and_get() {
        let registry = ConnectionRegistry::default();
        registry.record(50000, "example.com");
        assert_eq!(registry.get(50000).as_deref(), Some("example.com"));
        assert_eq!(registry.get(50001), None);
    }

    /// A reused source port takes the most recent hostname.
    #[test]
    fn port_reuse_overwrites() {
        let registry = ConnectionRegistry::default();
        registry.record(40000, "first.example");
        registry.record(40000, "second.example");
        assert_eq!(registry.get(40000).as_deref(), Some("second.example"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_returns_hostname() {
        let registry = ConnectionRegistry::default();
        registry.record(1234, "remove.example");
        assert_eq!(registry.remove(1234).as_deref(), Some("remove.example"));
        assert!(registry.is_empty());
        assert_eq!(registry.remove(1234), None);
    }

    /// Another connection's entry on the same port survives a conditional
    /// removal.
    #[test]
    fn remove_if_keeps_replaced_entry() {
        let registry = ConnectionRegistry::default();
        registry.record(4321, "first.example");
        registry.record(4321, "second.example");

        assert!(!registry.remove_if(4321, "first.example"));
        assert_eq!(registry.get(4321).as_deref(), Some("second.example"));
        assert!(registry.remove_if(4321, "second.example"));
        assert!(registry.is_empty());
        assert!(!registry.remove_if(4321, "second.example"));
    }

    /// A thread panicking while holding the lock does not hide entries.
    #[test]
    fn poisoned_lock_still_serves_lookups() {
        let registry = Arc::new(ConnectionRegistry::default());
        registry.record(8080, "kept.example");

        let holder = Arc::clone(&registry);
        let result = thread::spawn(move || {
            let _entries = holder.entries.write().unwrap();
            panic!("holder died");
        })
        .join();
        assert!(result.is_err());
        assert!(registry.entries.is_poisoned());

        assert_eq!(registry.get(8080).as_deref(), Some("kept.example"));
        registry.record(8081, "after.example");
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.remove(8081).as_deref(), Some("after.example"));
        assert_eq!(registry.evict_expired(), 0);
    }

    /// Entries past the TTL are hidden from lookups and swept on eviction.
    #[test]
    fn expired_entries_evicted() {
        let registry = ConnectionRegistry::new(Duration::from_millis(20));
        registry.record(1, "stale.example");
        thread::sleep(Duration::from_millis(40));
        registry.record(2, "fresh.example");

        assert_eq!(registry.get(1), None);
        assert_eq!(registry.evict_expired(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(2).as_deref(), Some("fresh.example"));
    }

    /// Concurrent writers on distinct ports never see each other's hostnames.
    #[test]
    fn concurrent_inserts_on_distinct_ports() {
        let registry = Arc::new(ConnectionRegistry::default());
        let handles: Vec<_> = (0..32u16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for round in 0..50u16 {
                        let port = 10000 + i * 100 + round;
                        registry.record(port, &format!("host-{}-{}.example", i, round));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 32 * 50);
        for i in 0..32u16 {
            for round in 0..50u16 {
                let port = 10000 + i * 100 + round;
                assert_eq!(
                    registry.get(port),
                    Some(format!("host-{}-{}.example", i, round))
                );
            }
        }
    }
}
