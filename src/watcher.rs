//! Waiting for exit peers to connect to, or disconnect from, a channel.
//!
//! The expected peer set is computed from the exit shard of a service. A
//! peer counts as connected once an identified *inbound* connection from it
//! exists on the observed channel: the peer must have dialled back, an
//! outbound dial from our side does not count.

use std::collections::BTreeSet;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::{
    channel::{Channel, Connection, Direction},
    error::{Error, Result},
    mesh::Membership,
    shard::ShardResolver,
};

/// Peers a single watcher invocation is still waiting for.
///
/// Peers only ever leave the set, each at most once.
#[derive(Debug, Clone, Default)]
pub struct PendingPeerSet {
    pending: BTreeSet<String>,
    settled: Vec<String>,
}

impl PendingPeerSet {
    /// Seed the set with `peers`.
    pub fn new(peers: impl IntoIterator<Item = String>) -> Self {
        Self {
            pending: peers.into_iter().collect(),
            settled: Vec::new(),
        }
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of pending peers.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether `peer` is still pending.
    pub fn contains(&self, peer: &str) -> bool {
        self.pending.contains(peer)
    }

    /// Remove `peer`. Returns false if it was not pending.
    pub fn settle(&mut self, peer: &str) -> bool {
        if self.pending.remove(peer) {
            self.settled.push(peer.to_string());
            true
        } else {
            false
        }
    }

    /// Remove every pending peer with an identified inbound connection on
    /// `channel`. Returns how many were removed.
    pub fn settle_connected(&mut self, channel: &Channel) -> usize {
        let connected: Vec<String> = self
            .pending
            .iter()
            .filter(|peer| channel.has_connection(peer, Direction::In))
            .cloned()
            .collect();
        connected.iter().filter(|peer| self.settle(peer)).count()
    }

    /// Peers removed so far, in removal order.
    pub fn settled(&self) -> &[String] {
        &self.settled
    }

    /// Remaining peers.
    pub fn remaining(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    fn into_settled(self) -> Vec<String> {
        self.settled
    }
}

/// Outcome of a watcher invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchReport {
    /// Peers in the order they were observed.
    pub peers: Vec<String>,
    /// Connection events consumed (identifications or closes).
    pub connections: usize,
}

/// Connection-lifecycle waits over exit-shard output.
#[derive(Debug, Clone)]
pub struct ConnectionWatcher<M> {
    resolver: ShardResolver<M>,
}

impl<M: Membership> ConnectionWatcher<M> {
    /// Create a watcher computing exit peers with `resolver`.
    pub fn new(resolver: ShardResolver<M>) -> Self {
        Self { resolver }
    }

    /// The resolver used to compute expected peers.
    pub fn resolver(&self) -> &ShardResolver<M> {
        &self.resolver
    }

    /// Exit hosts of `service` minus `except`.
    pub fn expected_peers(&self, service: &str, except: &BTreeSet<String>) -> BTreeSet<String> {
        self.resolver
            .exit_hosts(service)
            .into_iter()
            .filter(|host| !except.contains(host))
            .collect()
    }

    /// Wait until every exit peer of `service` (minus `except`) has an
    /// identified inbound connection on `channel`.
    pub async fn until_connected(
        &self,
        service: &str,
        channel: &Channel,
        except: &BTreeSet<String>,
    ) -> Result<WatchReport> {
        let mut pending = PendingPeerSet::new(self.expected_peers(service, except));
        debug!(service, expected = pending.len(), "waiting for exit peers to connect");

        let mut new_connections = channel.subscribe_connections();
        let mut identifying: FuturesUnordered<_> = channel
            .connections()
            .into_iter()
            .filter(|c| !c.is_identified())
            .map(identification)
            .collect();
        pending.settle_connected(channel);

        let mut connections = 0;
        while !pending.is_empty() {
            tokio::select! {
                Some(connection) = new_connections.recv() => {
                    identifying.push(identification(connection));
                }
                Some(remote_name) = identifying.next(), if !identifying.is_empty() => {
                    connections += 1;
                    let settled = pending.settle_connected(channel);
                    debug!(
                        service,
                        remote = ?remote_name,
                        settled,
                        remaining = pending.len(),
                        "connection identified"
                    );
                }
                else => return Err(Error::Disconnected("channel")),
            }
        }

        Ok(WatchReport {
            peers: pending.into_settled(),
            connections,
        })
    }

    /// Wait until every existing connection on `channel` to an exit peer of
    /// `service` has closed or errored. Each connection is counted once.
    pub async fn until_disconnected(&self, service: &str, channel: &Channel) -> Result<WatchReport> {
        let expected = self.expected_peers(service, &BTreeSet::new());
        let mut closing: FuturesUnordered<_> = channel
            .connections()
            .into_iter()
            .filter(|c| c.remote_name().is_some_and(|name| expected.contains(&name)))
            .map(|connection| async move {
                let reason = connection.closed().await;
                (connection, reason)
            })
            .collect();
        debug!(service, connections = closing.len(), "waiting for exit peers to disconnect");

        // Resolve on a later turn even when there is nothing to wait for.
        tokio::task::yield_now().await;

        let mut report = WatchReport::default();
        while let Some((connection, reason)) = closing.next().await {
            report.connections += 1;
            if let Some(name) = connection.remote_name() {
                if !report.peers.contains(&name) {
                    report.peers.push(name);
                }
            }
            debug!(service, id = connection.id(), ?reason, "exit connection closed");
        }
        Ok(report)
    }
}

async fn identification(connection: Connection) -> Option<String> {
    connection.identified().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::tests::StaticMembership;
    use std::time::Duration;

    const HOSTS: [&str; 3] = ["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"];

    fn watcher() -> ConnectionWatcher<StaticMembership> {
        ConnectionWatcher::new(ShardResolver::new(StaticMembership::new(&HOSTS), 3))
    }

    /// Add an identified inbound connection from `from`; returns the far end.
    fn dial_in(channel: &Channel, from: &str) -> Connection {
        let (out, inbound) = Connection::pair();
        inbound.identify(from);
        channel.add_connection(inbound);
        out
    }

    #[test]
    fn test_pending_set_settles_once() {
        let mut pending = PendingPeerSet::new(["a".to_string(), "b".to_string()]);
        assert!(pending.settle("a"));
        assert!(!pending.settle("a"));
        assert!(!pending.settle("zzz"));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.settled(), ["a".to_string()]);
        assert_eq!(pending.remaining().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_settle_connected_ignores_outbound() {
        let channel = Channel::new();
        let (out, _inbound) = Connection::pair();
        out.identify("a");
        channel.add_connection(out);

        let mut pending = PendingPeerSet::new(["a".to_string()]);
        assert_eq!(pending.settle_connected(&channel), 0);

        let (_out, inbound) = Connection::pair();
        inbound.identify("a");
        channel.add_connection(inbound);
        assert_eq!(pending.settle_connected(&channel), 1);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_until_connected_sweeps_and_follows_new_connections() {
        let watcher = watcher();
        let expected = watcher.expected_peers("bob", &BTreeSet::new());
        assert!(!expected.is_empty());
        let channel = Channel::new();

        // One peer already connected, one mid-identification, the rest later.
        let mut peers = expected.iter();
        let first = peers.next().unwrap().clone();
        let (_o1, connected) = Connection::pair();
        connected.identify(first.clone());
        channel.add_connection(connected);

        let rest: Vec<String> = peers.cloned().collect();
        let mut late = Vec::new();
        for _ in &rest {
            let (_out, inbound) = Connection::pair();
            late.push(inbound);
        }
        if let Some(inbound) = late.first() {
            channel.add_connection(inbound.clone());
        }

        let task = {
            let channel = channel.clone();
            let watcher = watcher.clone();
            tokio::spawn(async move {
                watcher
                    .until_connected("bob", &channel, &BTreeSet::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        for (i, (inbound, name)) in late.iter().zip(&rest).enumerate() {
            if i > 0 {
                channel.add_connection(inbound.clone());
            }
            inbound.identify(name.clone());
        }

        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("watcher stalled")
            .unwrap()
            .unwrap();
        let settled: BTreeSet<String> = report.peers.iter().cloned().collect();
        assert_eq!(settled, expected);
        assert_eq!(report.peers.len(), expected.len());
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_until_connected_except_skips_peers() {
        let watcher = watcher();
        let expected = watcher.expected_peers("bob", &BTreeSet::new());
        let channel = Channel::new();

        let report = watcher
            .until_connected("bob", &channel, &expected)
            .await
            .unwrap();
        assert!(report.peers.is_empty());
        assert_eq!(channel.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_until_disconnected_empty_resolves() {
        let watcher = watcher();
        let report = watcher
            .until_disconnected("bob", &Channel::new())
            .await
            .unwrap();
        assert_eq!(report, WatchReport::default());
    }

    #[tokio::test]
    async fn test_until_disconnected_counts_each_connection_once() {
        let watcher = watcher();
        let expected = watcher.expected_peers("bob", &BTreeSet::new());
        let channel = Channel::new();

        let mut outs = Vec::new();
        for peer in &expected {
            outs.push(dial_in(&channel, peer));
        }
        // A connection to a non-exit peer is not awaited.
        let (_stranger_out, stranger) = Connection::pair();
        stranger.identify("192.168.0.1:9");
        channel.add_connection(stranger);

        let task = {
            let channel = channel.clone();
            let watcher = watcher.clone();
            tokio::spawn(async move { watcher.until_disconnected("bob", &channel).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        for out in &outs {
            out.fail("peer went away");
            out.close();
        }

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.connections, expected.len());
        let peers: BTreeSet<String> = report.peers.into_iter().collect();
        assert_eq!(peers, expected);
    }
}
