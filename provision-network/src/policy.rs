//! Retry/backoff/timeout math and the scan cache, kept free of any D-Bus
//! dependency so the connect policy (§4.7) is unit-testable without a real
//! NetworkManager — the same split `provision_ble::session` uses for the
//! handshake state machine.

use std::time::{Duration, Instant};

pub const CONNECT_RETRIES: u32 = 3;
pub const BASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);
pub const BACKOFF_BASE: Duration = Duration::from_secs(2);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const SCAN_CACHE_TTL: Duration = Duration::from_secs(30);

/// Per-attempt timeout, growing exponentially with the number of already
/// consecutive failures (not the current attempt), capped at `MAX_TIMEOUT`.
pub fn adaptive_timeout(consecutive_failures: u32) -> Duration {
    let factor = 1u32 << consecutive_failures.min(8);
    (BASE_TIMEOUT * factor).min(MAX_TIMEOUT)
}

/// Delay before retry number `attempt` (1-indexed), exponential with a cap.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(8);
    (BACKOFF_BASE * factor).min(BACKOFF_CAP)
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInfo {
    pub ssid: String,
    pub bssid: String,
    pub signal_pct: u8,
    pub security: provision_core::SecurityType,
}

/// A TTL cache with no knowledge of how entries are produced; callers hold a
/// lock around the whole get-or-refresh sequence to get single-flight
/// behavior for free (concurrent callers block on the same mutex instead of
/// triggering redundant scans).
#[derive(Default)]
pub struct ScanCache {
    entry: Option<(Instant, Vec<NetworkInfo>)>,
}

impl ScanCache {
    pub fn fresh(&self, now: Instant) -> Option<&[NetworkInfo]> {
        self.entry.as_ref().and_then(|(stamp, networks)| {
            if now.duration_since(*stamp) < SCAN_CACHE_TTL {
                Some(networks.as_slice())
            } else {
                None
            }
        })
    }

    pub fn store(&mut self, now: Instant, networks: Vec<NetworkInfo>) {
        self.entry = Some((now, networks));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_timeout_grows_and_caps() {
        assert_eq!(adaptive_timeout(0), BASE_TIMEOUT);
        assert_eq!(adaptive_timeout(1), Duration::from_secs(60));
        assert_eq!(adaptive_timeout(2), Duration::from_secs(120));
        assert_eq!(adaptive_timeout(10), MAX_TIMEOUT);
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(20), BACKOFF_CAP);
    }

    #[test]
    fn scan_cache_expires_after_ttl() {
        let mut cache = ScanCache::default();
        let t0 = Instant::now();
        cache.store(t0, vec![]);
        assert!(cache.fresh(t0).is_some());
        assert!(cache.fresh(t0 + SCAN_CACHE_TTL + Duration::from_secs(1)).is_none());
    }
}
