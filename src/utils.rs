//! Local-address detection.
//!
//! Block locations and hypervisors are plain addresses; whether one of
//! them means "this machine" decides between a direct block-store call
//! and a proxy RPC. The interface enumeration is cached for one second to
//! bound the syscall cost on hot I/O paths.

use crate::types::UkaiConfig;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

const IFADDR_CACHE_VALID: Duration = Duration::from_secs(1);

#[derive(Default)]
struct CachedAddrs {
    expires_at: Option<Instant>,
    addrs: Vec<String>,
}

pub struct NodeAddressCache {
    cache_enabled: bool,
    /// The configured core address of this node, always local regardless
    /// of what the interfaces report.
    node_address: String,
    inner: Mutex<CachedAddrs>,
}

impl NodeAddressCache {
    pub fn new(config: &UkaiConfig) -> Self {
        Self {
            cache_enabled: config.ifaddr_cache,
            node_address: config.core_server.clone(),
            inner: Mutex::new(CachedAddrs::default()),
        }
    }

    /// Compare the address textually against every address assigned to a
    /// local interface.
    pub fn is_local(&self, address: &str) -> bool {
        if address == self.node_address {
            return true;
        }
        let mut cached = self.inner.lock();
        let now = Instant::now();
        let valid = self.cache_enabled && cached.expires_at.is_some_and(|at| at > now);
        if !valid {
            cached.addrs = enumerate_interface_addrs();
            cached.expires_at = Some(now + IFADDR_CACHE_VALID);
        }
        cached.addrs.iter().any(|a| a == address)
    }
}

fn enumerate_interface_addrs() -> Vec<String> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces.iter().map(|i| i.ip().to_string()).collect(),
        Err(e) => {
            log::warn!("interface address enumeration failed: {}", e);
            Vec::new()
        }
    }
}
