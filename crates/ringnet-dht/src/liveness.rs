//! Suspicion tracking for members that stop answering

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Consecutive failure counts per member address
///
/// A failed contact marks the member suspect instead of evicting it right
/// away; only once `threshold` consecutive failures accumulate does
/// [`record_failure`](Self::record_failure) report the member as dead.
#[derive(Debug)]
pub struct SuspectList {
    threshold: u32,
    failures: Mutex<HashMap<SocketAddr, u32>>,
}

impl SuspectList {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count one more failure; returns `true` once the member crossed the threshold.
    /// The counter is dropped at that point so a re-added member starts clean.
    pub fn record_failure(&self, address: SocketAddr) -> bool {
        let mut failures = self.failures.lock();
        let count = failures.entry(address).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            failures.remove(&address);
            true
        } else {
            false
        }
    }

    /// The member answered; forget its failures
    pub fn record_success(&self, address: &SocketAddr) {
        self.failures.lock().remove(address);
    }

    pub fn failures(&self, address: &SocketAddr) -> u32 {
        self.failures.lock().get(address).copied().unwrap_or(0)
    }

    /// Addresses with at least one outstanding failure
    pub fn suspects(&self) -> Vec<SocketAddr> {
        let mut suspects: Vec<_> = self.failures.lock().keys().copied().collect();
        suspects.sort();
        suspects
    }

    pub fn clear(&self) {
        self.failures.lock().clear();
    }
}
