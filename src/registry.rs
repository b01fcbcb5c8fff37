use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::error;

/// Process-wide counters shared by every Zork session.
///
/// Passed explicitly into sessions instead of living in statics so a test
/// harness can spin up independent broker instances side by side.
#[derive(Debug, Default)]
pub struct Registry {
    zork_connections: AtomicU64,
    getters: AtomicU64,
    started_socks_server: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next Zork client id. Ids are monotone and never reused.
    pub fn next_client_id(&self) -> String {
        let n = self.zork_connections.fetch_add(1, Ordering::Relaxed);
        format!("zc{n}")
    }

    /// Number of tunnels currently alive on the giver side.
    pub fn getters(&self) -> u64 {
        self.getters.load(Ordering::Relaxed)
    }

    /// Records a getter whose heartbeat channel just opened.
    pub fn getter_opened(&self) -> u64 {
        self.getters.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Records a getter whose heartbeat went silent. Clamped at zero; the
    /// clamp firing means accounting went wrong somewhere upstream.
    pub fn getter_lost(&self) -> u64 {
        let mut current = self.getters.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                error!(target: "registry", "getter count underflow, clamping at zero");
                return 0;
            }
            match self.getters.compare_exchange(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// True exactly once per process: the first getter claims the configured
    /// SOCKS port, every later getter binds an ephemeral one.
    pub fn claim_socks_port(&self) -> bool {
        !self.started_socks_server.swap(true, Ordering::Relaxed)
    }

    /// Returns the claim after a failed bind so the next getter can retry
    /// the configured port.
    pub fn release_socks_port(&self) {
        self.started_socks_server.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_monotone() {
        let registry = Registry::new();
        assert_eq!(registry.next_client_id(), "zc0");
        assert_eq!(registry.next_client_id(), "zc1");
        assert_eq!(registry.next_client_id(), "zc2");
    }

    #[test]
    fn getter_count_never_goes_negative() {
        let registry = Registry::new();
        assert_eq!(registry.getters(), 0);
        assert_eq!(registry.getter_lost(), 0);
        assert_eq!(registry.getters(), 0);

        registry.getter_opened();
        registry.getter_opened();
        assert_eq!(registry.getters(), 2);
        assert_eq!(registry.getter_lost(), 1);
        assert_eq!(registry.getter_lost(), 0);
        assert_eq!(registry.getter_lost(), 0);
    }

    #[test]
    fn socks_port_is_claimed_once() {
        let registry = Registry::new();
        assert!(registry.claim_socks_port());
        assert!(!registry.claim_socks_port());
        assert!(!registry.claim_socks_port());
    }

    #[test]
    fn released_socks_port_can_be_claimed_again() {
        let registry = Registry::new();
        assert!(registry.claim_socks_port());
        registry.release_socks_port();
        assert!(registry.claim_socks_port());
    }
}
