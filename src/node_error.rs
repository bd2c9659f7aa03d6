//! Failure-suspension cache.
//!
//! Remembers peers whose last interaction failed so that the data engine
//! stops hammering them for the suspension window. Entries expire lazily
//! when queried.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SUSPEND_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
struct NodeErrorState {
    reason: String,
    retry_after: SystemTime,
}

/// One row of the diagnostics snapshot; `retry_after` is epoch seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeErrorEntry {
    pub address: String,
    pub reason: String,
    pub retry_after: u64,
}

/// The set of currently suspended peers. Cheap to clone; all clones share
/// the same state.
#[derive(Clone, Default)]
pub struct NodeErrorStateSet {
    inner: Arc<Mutex<HashMap<String, NodeErrorState>>>,
}

impl NodeErrorStateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend a peer for the default window. An existing entry is
    /// overwritten, which also pushes its expiry out.
    pub fn add(&self, address: &str, reason: &str) {
        self.add_with_suspension(address, reason, Duration::from_secs(SUSPEND_SECONDS));
    }

    pub fn add_with_suspension(&self, address: &str, reason: &str, suspension: Duration) {
        let state = NodeErrorState {
            reason: reason.to_string(),
            retry_after: SystemTime::now() + suspension,
        };
        log::warn!("suspending peer {} for {:?}: {}", address, suspension, reason);
        self.inner.lock().insert(address.to_string(), state);
    }

    /// True while the peer's suspension window is open. An expired entry
    /// is removed on the way out.
    pub fn is_in_failure(&self, address: &str) -> bool {
        let mut set = self.inner.lock();
        match set.get(address) {
            None => false,
            Some(state) => {
                if state.retry_after <= SystemTime::now() {
                    set.remove(address);
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<NodeErrorEntry> {
        let set = self.inner.lock();
        let mut entries: Vec<NodeErrorEntry> = set
            .iter()
            .map(|(address, state)| NodeErrorEntry {
                address: address.clone(),
                reason: state.reason.clone(),
                retry_after: state
                    .retry_after
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            })
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let set = NodeErrorStateSet::new();
        assert!(!set.is_in_failure("192.0.2.1"));

        set.add("192.0.2.1", "connection refused");
        assert!(set.is_in_failure("192.0.2.1"));
        assert!(!set.is_in_failure("192.0.2.2"));
    }

    #[test]
    fn test_expired_entry_is_removed() {
        let set = NodeErrorStateSet::new();
        set.add_with_suspension("192.0.2.1", "timeout", Duration::ZERO);

        assert!(!set.is_in_failure("192.0.2.1"));
        assert!(set.snapshot().is_empty());
    }

    #[test]
    fn test_add_overwrites_existing_entry() {
        let set = NodeErrorStateSet::new();
        set.add_with_suspension("192.0.2.1", "first", Duration::ZERO);
        set.add("192.0.2.1", "second");

        assert!(set.is_in_failure("192.0.2.1"));
        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].reason, "second");
        assert!(snapshot[0].retry_after > 0);
    }
}
