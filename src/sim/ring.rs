//! Consistent hash ring used by simulated membership views.
//!
//! Every host contributes `replica_points` points, hashed with SipHash-1-3
//! under fixed keys so two views holding the same hosts resolve every key to
//! the same owner.

use std::{
    collections::{BTreeMap, BTreeSet},
    hash::Hasher,
};

use siphasher::sip::SipHasher13;

const RING_KEY_0: u64 = 0x6d65_7368_2d72_696e;
const RING_KEY_1: u64 = 0x672d_7369_6d2d_7631;

fn hash_str(value: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(RING_KEY_0, RING_KEY_1);
    hasher.write(value.as_bytes());
    hasher.finish()
}

/// A set of hosts placed on a hash ring.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    replica_points: usize,
    hosts: BTreeSet<String>,
    points: BTreeMap<u64, String>,
}

impl HashRing {
    /// Create an empty ring placing `replica_points` points per host.
    pub fn new(replica_points: usize) -> Self {
        Self {
            replica_points: replica_points.max(1),
            hosts: BTreeSet::new(),
            points: BTreeMap::new(),
        }
    }

    /// Add `host`. Returns false if it was already present.
    pub fn add(&mut self, host: &str) -> bool {
        if !self.hosts.insert(host.to_string()) {
            return false;
        }
        for i in 0..self.replica_points {
            self.points.insert(hash_str(&format!("{host}{i}")), host.to_string());
        }
        true
    }

    /// Remove `host`. Returns false if it was absent.
    pub fn remove(&mut self, host: &str) -> bool {
        if !self.hosts.remove(host) {
            return false;
        }
        self.points.retain(|_, owner| owner != host);
        true
    }

    /// Whether `host` is on the ring.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }

    /// Owner of `key`: the first point at or after the key's hash, wrapping.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        let hash = hash_str(key);
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, host)| host.as_str())
    }

    /// Hosts in sorted order.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Checksum over the sorted host list.
    pub fn checksum(&self) -> u32 {
        let joined = self.hosts.iter().cloned().collect::<Vec<_>>().join(";");
        let hash = hash_str(&joined);
        (hash ^ (hash >> 32)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_order_independent() {
        let mut a = HashRing::new(16);
        let mut b = HashRing::new(16);
        for host in ["127.0.0.1:1", "127.0.0.1:2", "127.0.0.1:3"] {
            a.add(host);
        }
        for host in ["127.0.0.1:3", "127.0.0.1:1", "127.0.0.1:2"] {
            b.add(host);
        }
        for i in 0..50 {
            let key = format!("svc~{i}");
            assert_eq!(a.lookup(&key), b.lookup(&key));
        }
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new(4);
        assert_eq!(ring.lookup("bob~0"), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_add_remove() {
        let mut ring = HashRing::new(4);
        assert!(ring.add("a:1"));
        assert!(!ring.add("a:1"));
        let before = ring.checksum();
        ring.add("b:2");
        assert_ne!(ring.checksum(), before);
        assert!(ring.remove("b:2"));
        assert!(!ring.remove("b:2"));
        assert_eq!(ring.checksum(), before);
        assert_eq!(ring.lookup("anything"), Some("a:1"));
    }
}
