//! Exit-shard resolution.
//!
//! For a service `S` and replication factor `K`, the replica keys
//! `S~0 .. S~K-1` are looked up on a node's membership ring and grouped by
//! owning host. The resulting [`ExitShard`] says which hosts are exit points
//! for `S` and which replica keys each of them owns.
//!
//! The mapping is a pure function of the membership view, so on a converged
//! cluster every node computes the same one. Value lists keep ring lookup
//! order; sort them with [`normalize_shard`] before comparing nodes.

use std::collections::{BTreeMap, BTreeSet};

use crate::mesh::Membership;

/// Exit host -> replica keys it owns.
pub type ExitShard = BTreeMap<String, Vec<String>>;

/// Replica keys for `service` under replication factor `k_value`.
pub fn replica_keys(service: &str, k_value: usize) -> Vec<String> {
    (0..k_value).map(|i| format!("{service}~{i}")).collect()
}

/// Compute the exit shard of `service` on one membership view.
///
/// Keys the ring cannot resolve (empty view) are left out.
pub fn exit_shard_for<M: Membership>(membership: &M, service: &str, k_value: usize) -> ExitShard {
    let mut shard = ExitShard::new();
    for key in replica_keys(service, k_value) {
        if let Some(host) = membership.lookup(&key) {
            shard.entry(host).or_default().push(key);
        }
    }
    shard
}

/// Sort every value list so shards from different nodes compare structurally.
pub fn normalize_shard(mut shard: ExitShard) -> ExitShard {
    for keys in shard.values_mut() {
        keys.sort();
    }
    shard
}

/// Distinct replica keys mentioned anywhere in `shard`.
pub fn shard_keys(shard: &ExitShard) -> BTreeSet<&str> {
    shard.values().flatten().map(String::as_str).collect()
}

/// Compare two shards key by key and value by value.
///
/// Every mismatch is reported, labelled with `actual_label`.
pub fn diff_shards(expected: &ExitShard, actual: &ExitShard, actual_label: &str) -> Vec<String> {
    let mut violations = Vec::new();
    for (host, keys) in expected {
        match actual.get(host) {
            None => violations.push(format!("{actual_label}: missing exit host {host}")),
            Some(actual_keys) if actual_keys != keys => violations.push(format!(
                "{actual_label}: exit host {host} owns {actual_keys:?}, expected {keys:?}"
            )),
            Some(_) => {}
        }
    }
    for host in actual.keys().filter(|h| !expected.contains_key(*h)) {
        violations.push(format!("{actual_label}: unexpected exit host {host}"));
    }
    violations
}

/// Query layer over one node's membership view.
#[derive(Debug, Clone)]
pub struct ShardResolver<M> {
    membership: M,
    k_value: usize,
}

impl<M: Membership> ShardResolver<M> {
    /// Create a resolver over `membership` with replication factor `k_value`.
    pub fn new(membership: M, k_value: usize) -> Self {
        Self {
            membership,
            k_value,
        }
    }

    /// Replication factor.
    pub fn k_value(&self) -> usize {
        self.k_value
    }

    /// The membership view this resolver reads.
    pub fn membership(&self) -> &M {
        &self.membership
    }

    /// Exit shard of `service`, in ring lookup order.
    pub fn exit_shard(&self, service: &str) -> ExitShard {
        exit_shard_for(&self.membership, service, self.k_value)
    }

    /// Exit hosts of `service`.
    pub fn exit_hosts(&self, service: &str) -> BTreeSet<String> {
        self.exit_shard(service).into_keys().collect()
    }
}
