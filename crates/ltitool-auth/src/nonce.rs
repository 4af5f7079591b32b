//! Replay protection: per-consumer nonce cache and the timestamp window
//!
//! The cache is process-local and in-memory. A restart forgets the live
//! window, which admits replay of launches signed during the dead time;
//! that trade-off is accepted operationally. Deployments spanning several
//! processes get best-effort protection per process unless they inject a
//! shared [`NonceStore`] implementation.

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::debug;

/// Trailing window inside which a nonce may not repeat.
pub const NONCE_WINDOW_SECS: u64 = 3600;

/// Accepted clock skew for `oauth_timestamp`.
pub const TIMESTAMP_SKEW_SECS: u64 = 60;

/// Injected replay-protection service.
///
/// Implementations must make `seen` atomic per consumer key: two
/// concurrent calls with the same fresh nonce must not both return false.
pub trait NonceStore: Send + Sync {
    /// True iff `nonce` was already used for `consumer_key` within the
    /// trailing window. A first use is recorded and returns false.
    fn seen(&self, consumer_key: &str, nonce: &str, now: u64) -> bool;
}

/// In-memory [`NonceStore`], one time-ordered list per consumer key.
///
/// Trimming is lazy: each check first evicts the expired prefix of the
/// consumer's list. The map entry guard serializes check-and-insert per
/// consumer key; no ordering is guaranteed across consumers.
#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    nonces: DashMap<String, VecDeque<(String, u64)>>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NonceStore for MemoryNonceStore {
    fn seen(&self, consumer_key: &str, nonce: &str, now: u64) -> bool {
        let mut entry = self.nonces.entry(consumer_key.to_string()).or_default();

        let horizon = now.saturating_sub(NONCE_WINDOW_SECS);
        while entry.front().is_some_and(|(_, t)| *t < horizon) {
            entry.pop_front();
        }

        if entry.iter().any(|(n, _)| n == nonce) {
            debug!(consumer_key, "nonce already seen in window");
            return true;
        }

        entry.push_back((nonce.to_string(), now));
        false
    }
}

/// Accept `oauth_timestamp` iff within the skew window of `now`.
/// Non-numeric input fails closed.
pub fn validate_timestamp(timestamp: &str, now: u64) -> bool {
    match timestamp.parse::<u64>() {
        Ok(ts) => now.abs_diff(ts) <= TIMESTAMP_SKEW_SECS,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn first_use_records_second_rejects() {
        let store = MemoryNonceStore::new();
        assert!(!store.seen("consumer", "abc", NOW));
        assert!(store.seen("consumer", "abc", NOW + 1));
    }

    #[test]
    fn window_eviction_readmits_old_nonce() {
        let store = MemoryNonceStore::new();
        assert!(!store.seen("consumer", "abc", NOW));
        // same nonce inside the window is a replay
        assert!(store.seen("consumer", "abc", NOW + NONCE_WINDOW_SECS - 1));
        // a fresh check past the window evicts it and accepts again
        assert!(!store.seen("consumer", "abc", NOW + 2 * NONCE_WINDOW_SECS + 1));
    }

    #[test]
    fn consumers_do_not_share_nonces() {
        let store = MemoryNonceStore::new();
        assert!(!store.seen("a", "abc", NOW));
        assert!(!store.seen("b", "abc", NOW));
        assert!(store.seen("a", "abc", NOW));
    }

    #[test]
    fn eviction_only_trims_expired_prefix() {
        let store = MemoryNonceStore::new();
        assert!(!store.seen("c", "old", NOW));
        assert!(!store.seen("c", "mid", NOW + 1800));
        // "old" expired, "mid" still live
        assert!(!store.seen("c", "old", NOW + NONCE_WINDOW_SECS + 1));
        assert!(store.seen("c", "mid", NOW + NONCE_WINDOW_SECS + 2));
    }

    #[test]
    fn timestamp_window_boundaries() {
        let now = NOW;
        assert!(validate_timestamp(&(now - 59).to_string(), now));
        assert!(validate_timestamp(&(now + 59).to_string(), now));
        assert!(validate_timestamp(&(now - 60).to_string(), now));
        assert!(validate_timestamp(&(now + 60).to_string(), now));
        assert!(!validate_timestamp(&(now - 61).to_string(), now));
        assert!(!validate_timestamp(&(now + 61).to_string(), now));
    }

    #[test]
    fn non_numeric_timestamp_fails_closed() {
        assert!(!validate_timestamp("", NOW));
        assert!(!validate_timestamp("yesterday", NOW));
        assert!(!validate_timestamp("-100", NOW));
        assert!(!validate_timestamp("12.5", NOW));
    }

    #[test]
    fn concurrent_first_use_admits_exactly_one() {
        use std::sync::Arc;
        let store = Arc::new(MemoryNonceStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || store.seen("c", "race", NOW)));
        }
        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|seen| !seen)
            .count();
        assert_eq!(fresh, 1);
    }
}
