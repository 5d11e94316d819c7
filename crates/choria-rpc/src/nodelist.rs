//! Thread-safe set of node identities.

use parking_lot::RwLock;
use std::collections::HashSet;

/// A set of host identities shared between reply receivers.
///
/// Every operation takes the lock once, so membership checks and removals are
/// atomic with respect to concurrent callers.
#[derive(Debug, Default)]
pub struct NodeList {
    hosts: RwLock<HashSet<String>>,
}

impl NodeList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds hosts, ignoring ones already present.
    pub fn add<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.hosts.write();
        for host in hosts {
            set.insert(host.into());
        }
    }

    /// Removes every host.
    pub fn clear(&self) {
        self.hosts.write().clear();
    }

    /// Number of hosts.
    pub fn count(&self) -> usize {
        self.hosts.read().len()
    }

    /// Snapshot of the hosts, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts.read().iter().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Removes `host`, returning whether it was present.
    pub fn delete_if_known(&self, host: &str) -> bool {
        self.hosts.write().remove(host)
    }

    /// Returns true when `host` is present.
    pub fn have(&self, host: &str) -> bool {
        self.hosts.read().contains(host)
    }

    /// Returns true when any of `hosts` is present.
    pub fn have_any<S: AsRef<str>>(&self, hosts: &[S]) -> bool {
        let set = self.hosts.read();
        hosts.iter().any(|h| set.contains(h.as_ref()))
    }
}
