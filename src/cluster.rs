//! Cluster orchestration.
//!
//! [`Cluster`] owns the ring nodes, the canonical host list and every
//! auxiliary endpoint. Growing the ring runs three phases, each a fan-out
//! over the new nodes joined by a barrier:
//!
//! 1. partial bootstrap: every node binds and starts its services,
//! 2. gossip wiring: every node is seeded with the complete host list,
//! 3. convergence: wait until every view matches the host list.
//!
//! Setup fails fast with the first error. Teardown with [`Cluster::close`]
//! is best-effort and never fails.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Arc, OnceLock},
};

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    channel::Channel,
    config::{CallOptions, ClusterConfig, RemoteConfig, TRACE_COLLECTOR_SERVICE},
    convergence::{memberships_converged, wait_for_convergence, ConvergenceReport},
    error::{Error, Result},
    mesh::{
        call_advertise, AdvertiseOp, AdvertiseRequest, AdvertiseResponse, Endpoint, HostList,
        MeshBackend, MeshNode, NodeOptions,
    },
    ready::{fan_in, ReadySignal},
    registration::Remote,
    shard::{diff_shards, normalize_shard, shard_keys, ShardResolver},
    watcher::{ConnectionWatcher, WatchReport},
};

/// Membership handle type of a backend's nodes.
pub type MembershipOf<B> = <<B as MeshBackend>::Node as MeshNode>::Membership;

/// Lifecycle of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterState {
    /// No node has been created.
    Empty,
    /// Nodes are being created and bound.
    Growing,
    /// Every new node is listening; gossip not yet wired.
    PartiallyBootstrapped,
    /// Every new node has its seed list and gossips.
    GossipWired,
    /// Every view matches the host list.
    Converged,
    /// Torn down.
    Closed,
}

/// Role of an addressable endpoint in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostRole {
    /// Ring node.
    Ring,
    /// Passive endpoint that never registers.
    Dummy,
    /// Primary remote created by `bootstrap`.
    Remote,
    /// Remote requested by name.
    NamedRemote,
    /// Trace-collector remote.
    TraceCollector,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Ring => f.write_str("ring"),
            HostRole::Dummy => f.write_str("dummy"),
            HostRole::Remote => f.write_str("remote"),
            HostRole::NamedRemote => f.write_str("named-remote"),
            HostRole::TraceCollector => f.write_str("trace-collector"),
        }
    }
}

/// One ring node with its fixed ordinal.
pub struct ClusterNode<N> {
    index: usize,
    node: N,
    host_port: OnceLock<String>,
}

impl<N: MeshNode> ClusterNode<N> {
    /// Ordinal index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The backend node.
    pub fn node(&self) -> &N {
        &self.node
    }

    /// Host:port recorded at listen time.
    pub fn host_port(&self) -> Option<&str> {
        self.host_port.get().map(String::as_str)
    }

    /// The node's channel.
    pub fn channel(&self) -> &Channel {
        self.node.channel()
    }
}

impl<N> fmt::Debug for ClusterNode<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterNode")
            .field("index", &self.index)
            .field("host_port", &self.host_port.get())
            .finish()
    }
}

/// Options of [`Cluster::check_exit_k_value`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitKValueCheck {
    /// Service whose shard is checked.
    pub service_name: String,
    /// Expected distinct replica keys. Defaults to the cluster's K.
    pub k_value: Option<usize>,
}

impl ExitKValueCheck {
    /// Check `service_name` against the cluster's K.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            k_value: None,
        }
    }

    /// Expect `k_value` distinct replica keys (builder pattern).
    pub fn with_k_value(mut self, k_value: usize) -> Self {
        self.k_value = Some(k_value);
        self
    }
}

/// Options of [`Cluster::check_exit_peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPeersCheck {
    /// Service whose routing is checked.
    pub service_name: String,
    /// Host:port of the service instance.
    pub host_port: String,
    /// Expect the instance to be gone from every exit node.
    pub is_dead: bool,
    /// Ring hosts to skip.
    pub blacklist: BTreeSet<String>,
}

impl ExitPeersCheck {
    /// Expect every exit node of `service_name` to route to `host_port`.
    pub fn new(service_name: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            host_port: host_port.into(),
            is_dead: false,
            blacklist: BTreeSet::new(),
        }
    }

    /// Expect the instance to be gone (builder pattern).
    pub fn dead(mut self) -> Self {
        self.is_dead = true;
        self
    }

    /// Skip `host` (builder pattern).
    pub fn with_blacklisted(mut self, host: impl Into<String>) -> Self {
        self.blacklist.insert(host.into());
        self
    }
}

struct RemoteEntry<E> {
    role: HostRole,
    remote: Arc<Remote<E>>,
}

type Dummies<E> = Arc<Mutex<Vec<Option<Arc<E>>>>>;
type Remotes<E> = Arc<Mutex<BTreeMap<String, RemoteEntry<E>>>>;

/// A test cluster over a mesh backend.
pub struct Cluster<B: MeshBackend> {
    config: ClusterConfig,
    backend: Arc<B>,
    k_value: usize,
    nodes: Vec<Arc<ClusterNode<B::Node>>>,
    hosts: HostList,
    dummies: Dummies<B::Endpoint>,
    remotes: Remotes<B::Endpoint>,
    state: ClusterState,
}

impl<B: MeshBackend> Cluster<B> {
    /// Create an empty cluster. The configuration is validated here.
    pub fn new(backend: B, config: ClusterConfig) -> Result<Self> {
        config.validate()?;
        let k_value = config.effective_k_value();
        Ok(Self {
            config,
            backend: Arc::new(backend),
            k_value,
            nodes: Vec::new(),
            hosts: HostList::new(),
            dummies: Arc::new(Mutex::new(Vec::new())),
            remotes: Arc::new(Mutex::new(BTreeMap::new())),
            state: ClusterState::Empty,
        })
    }

    /// The cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Replication factor, fixed at creation.
    pub fn k_value(&self) -> usize {
        self.k_value
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClusterState {
        self.state
    }

    /// The canonical host list.
    pub fn hosts(&self) -> &HostList {
        &self.hosts
    }

    /// Ring nodes in ordinal order.
    pub fn nodes(&self) -> &[Arc<ClusterNode<B::Node>>] {
        &self.nodes
    }

    /// Ring node with ordinal `index`.
    pub fn node(&self, index: usize) -> Option<&ClusterNode<B::Node>> {
        self.nodes.get(index).map(Arc::as_ref)
    }

    /// Number of ring nodes.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Add `n` ring nodes and wait until the enlarged ring converges.
    ///
    /// New nodes are part of the cluster as soon as they are created, so a
    /// failed or cancelled grow leaves them for [`Cluster::close`] to tear
    /// down. Nodes that never bound have empty views and the ring can no
    /// longer converge, so after such a grow `close()` is the only valid
    /// next step; a further `grow` is rejected with [`Error::Config`].
    pub async fn grow(&mut self, n: usize) -> Result<ConvergenceReport> {
        match self.state {
            ClusterState::Empty | ClusterState::Converged => {}
            ClusterState::Closed => return Err(Error::Closed),
            interrupted => {
                return Err(Error::Config(format!(
                    "cannot grow a cluster left {interrupted:?} by an earlier grow; close it"
                )))
            }
        }
        self.state = ClusterState::Growing;

        let start = self.nodes.len();
        let added: Vec<_> = (start..start + n)
            .map(|index| {
                Arc::new(ClusterNode {
                    index,
                    node: self.backend.create_node(NodeOptions {
                        index,
                        k_value: self.k_value,
                    }),
                    host_port: OnceLock::new(),
                })
            })
            .collect();
        self.nodes.extend(added.iter().cloned());
        info!(start, count = n, "growing cluster");

        let bound = fan_in(
            added
                .iter()
                .cloned()
                .map(|node| async move {
                    let addr = node.node.listen().await.map_err(|source| Error::Bootstrap {
                        index: node.index,
                        source: Box::new(source),
                    })?;
                    let host = node.node.host_port().unwrap_or_else(|| addr.to_string());
                    let _ = node.host_port.set(host.clone());
                    Ok::<_, Error>(host)
                })
                .collect(),
        )
        .await?;
        self.state = ClusterState::PartiallyBootstrapped;
        self.hosts.extend(bound);
        debug!(hosts = ?self.hosts, "partial bootstrap complete");

        fan_in(
            added
                .iter()
                .cloned()
                .map(|node| {
                    let seeds = self.hosts.clone();
                    async move {
                        node.node.join(seeds).await.map_err(|source| Error::Bootstrap {
                            index: node.index,
                            source: Box::new(source),
                        })
                    }
                })
                .collect(),
        )
        .await?;
        self.state = ClusterState::GossipWired;

        let report = self.wait_for_ringpop().await?;
        self.state = ClusterState::Converged;
        info!(
            size = self.nodes.len(),
            events = report.events_observed,
            "cluster converged"
        );
        Ok(report)
    }

    /// Grow to the configured size, then start every auxiliary actor and
    /// wait until all of them are ready.
    pub async fn bootstrap(&mut self) -> Result<ConvergenceReport> {
        let report = self.grow(self.config.size).await?;

        let (ready, all_ready) = ReadySignal::new(self.config.auxiliary_count());
        for index in 0..self.config.dummy_size {
            self.spawn_dummy(index, ready.clone());
        }
        if self.config.trace {
            self.spawn_remote(
                RemoteConfig::new(TRACE_COLLECTOR_SERVICE),
                HostRole::TraceCollector,
                ready.clone(),
            )?;
        }
        for remote in self.config.primary_remotes.clone() {
            self.spawn_remote(remote, HostRole::Remote, ready.clone())?;
        }
        for remote in self.config.named_remotes.clone() {
            self.spawn_remote(remote, HostRole::NamedRemote, ready.clone())?;
        }
        drop(ready);

        all_ready.wait().await?;
        info!(
            size = self.nodes.len(),
            dummies = self.config.dummy_size,
            remotes = self.remotes.lock().len(),
            "cluster ready"
        );
        Ok(report)
    }

    fn spawn_dummy(&self, index: usize, ready: ReadySignal) {
        let endpoint = Arc::new(
            self.backend
                .create_endpoint(&format!("dummy-{index}"), self.hosts.clone()),
        );
        {
            let mut dummies = self.dummies.lock();
            if dummies.len() <= index {
                dummies.resize_with(index + 1, || None);
            }
            dummies[index] = Some(endpoint.clone());
        }
        tokio::spawn(async move {
            let result = endpoint.listen().await.map(|addr| {
                debug!(index, %addr, "dummy listening");
            });
            ready.complete(result);
        });
    }

    fn spawn_remote(
        &self,
        config: RemoteConfig,
        role: HostRole,
        ready: ReadySignal,
    ) -> Result<Arc<Remote<B::Endpoint>>> {
        let watcher = self.watcher()?;
        let endpoint = self
            .backend
            .create_endpoint(&config.service_name, self.hosts.clone());
        let remote = Arc::new(Remote::new(endpoint, &config, self.config.call));
        {
            let mut remotes = self.remotes.lock();
            if remotes.contains_key(&config.service_name) {
                return Err(Error::Config(format!(
                    "remote {} already exists",
                    config.service_name
                )));
            }
            remotes.insert(
                config.service_name.clone(),
                RemoteEntry {
                    role,
                    remote: remote.clone(),
                },
            );
        }

        let task_remote = remote.clone();
        tokio::spawn(async move {
            let result = task_remote.bootstrap(&watcher).await.map(|report| {
                debug!(
                    service = %task_remote.service_name(),
                    peers = report.peers.len(),
                    "remote ready"
                );
            });
            ready.complete(result);
        });
        Ok(remote)
    }

    /// Start one more remote and wait until it is registered and its exit
    /// peers have connected.
    pub async fn create_remote(&self, config: RemoteConfig) -> Result<Arc<Remote<B::Endpoint>>> {
        if self.state == ClusterState::Closed {
            return Err(Error::Closed);
        }
        let (ready, wait) = ReadySignal::new(1);
        let remote = self.spawn_remote(config, HostRole::NamedRemote, ready)?;
        wait.wait().await?;
        Ok(remote)
    }

    /// Remote advertising `service_name`.
    pub fn remote(&self, service_name: &str) -> Option<Arc<Remote<B::Endpoint>>> {
        self.remotes
            .lock()
            .get(service_name)
            .map(|entry| entry.remote.clone())
    }

    /// Dummy endpoint `index`, unless destroyed.
    pub fn dummy(&self, index: usize) -> Option<Arc<B::Endpoint>> {
        self.dummies.lock().get(index).cloned().flatten()
    }

    /// Destroy dummy `index`. Returns false if it was absent or already
    /// destroyed.
    pub async fn destroy_dummy(&self, index: usize) -> bool {
        let endpoint = self
            .dummies
            .lock()
            .get_mut(index)
            .and_then(Option::take);
        match endpoint {
            Some(endpoint) => {
                endpoint.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Tear everything down. Never fails and may be called more than once.
    pub async fn close(&mut self) {
        if self.state == ClusterState::Closed {
            return;
        }
        self.state = ClusterState::Closed;

        let remotes: Vec<_> = std::mem::take(&mut *self.remotes.lock())
            .into_values()
            .map(|entry| entry.remote)
            .collect();
        join_all(remotes.iter().map(|remote| remote.destroy())).await;

        let dummies: Vec<_> = std::mem::take(&mut *self.dummies.lock())
            .into_iter()
            .flatten()
            .collect();
        join_all(dummies.iter().map(|dummy| dummy.destroy())).await;

        join_all(self.nodes.iter().map(|node| node.node.destroy())).await;
        info!(
            nodes = self.nodes.len(),
            dummies = dummies.len(),
            remotes = remotes.len(),
            "cluster closed"
        );
    }

    /// Wait until every node's view matches the host list.
    pub async fn wait_for_ringpop(&self) -> Result<ConvergenceReport> {
        let memberships = self.memberships();
        let wait = wait_for_convergence(&memberships, &self.hosts);
        match self.config.convergence_timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait)
                .await
                .map_err(|_| Error::timeout("convergence", timeout))?,
            None => wait.await,
        }
    }

    /// Whether every node's view matches the host list right now.
    pub fn is_ringpop_converged(&self) -> bool {
        memberships_converged(&self.memberships(), &self.hosts)
    }

    fn memberships(&self) -> Vec<MembershipOf<B>> {
        self.nodes.iter().map(|n| n.node.membership()).collect()
    }

    /// Shard resolver over node `index`'s view.
    pub fn resolver(&self, index: usize) -> Result<ShardResolver<MembershipOf<B>>> {
        let node = self.nodes.get(index).ok_or(Error::NoNodes)?;
        Ok(ShardResolver::new(node.node.membership(), self.k_value))
    }

    /// Connection watcher computing exits from node 0's view.
    pub fn watcher(&self) -> Result<ConnectionWatcher<MembershipOf<B>>> {
        Ok(ConnectionWatcher::new(self.resolver(0)?))
    }

    /// Exit hosts of `service_name`.
    pub fn exit_nodes(&self, service_name: &str) -> Result<BTreeSet<String>> {
        Ok(self.resolver(0)?.exit_hosts(service_name))
    }

    /// Check that `service_name` resolves to exactly K replica keys on
    /// between 1 and K ring hosts, identically on every node.
    pub fn check_exit_k_value(&self, check: &ExitKValueCheck) -> Result<()> {
        let service = check.service_name.as_str();
        let k_value = check.k_value.unwrap_or(self.k_value);
        let reference = normalize_shard(self.resolver(0)?.exit_shard(service));
        let mut violations = Vec::new();

        let keys = shard_keys(&reference).len();
        if keys != k_value {
            violations.push(format!(
                "node 0: {keys} distinct shard keys for {service}, expected {k_value}"
            ));
        }
        if reference.is_empty() || reference.len() > k_value {
            violations.push(format!(
                "node 0: {} exit hosts for {service}, expected 1..={k_value}",
                reference.len()
            ));
        }
        for host in reference.keys().filter(|h| !self.hosts.contains(h)) {
            violations.push(format!("node 0: exit host {host} is not a ring node"));
        }
        for index in 1..self.nodes.len() {
            let shard = normalize_shard(self.resolver(index)?.exit_shard(service));
            violations.extend(diff_shards(&reference, &shard, &format!("node {index}")));
        }

        collapse(format!("exit k-value check for {service}"), violations)
    }

    /// Check that exactly the exit nodes of the service route to the
    /// instance (or, when dead, that none do).
    pub fn check_exit_peers(&self, check: &ExitPeersCheck) -> Result<()> {
        let service = check.service_name.as_str();
        let peer = check.host_port.as_str();
        let exits = self.exit_nodes(service)?;
        let mut violations = Vec::new();

        for node in &self.nodes {
            let Some(host) = node.host_port() else {
                violations.push(format!("node {}: never listened", node.index));
                continue;
            };
            if check.blacklist.contains(host) {
                continue;
            }
            let routes = node
                .node
                .service_peers(service)
                .iter()
                .any(|p| p == peer);
            match (exits.contains(host), check.is_dead, routes) {
                (true, false, false) => violations.push(format!(
                    "exit {host} does not route {service} to {peer}"
                )),
                (true, true, true) => violations.push(format!(
                    "exit {host} still routes {service} to dead peer {peer}"
                )),
                (false, _, true) => violations.push(format!(
                    "non-exit {host} routes {service} to {peer}"
                )),
                _ => {}
            }
        }

        collapse(format!("exit peers check for {service}"), violations)
    }

    /// Wait until every exit of `service_name` has dialled into `channel`.
    pub async fn until_exits_connected(
        &self,
        service_name: &str,
        channel: &Channel,
    ) -> Result<WatchReport> {
        self.until_exits_connected_except(service_name, channel, &BTreeSet::new())
            .await
    }

    /// Like [`Cluster::until_exits_connected`], ignoring `except`.
    pub async fn until_exits_connected_except(
        &self,
        service_name: &str,
        channel: &Channel,
        except: &BTreeSet<String>,
    ) -> Result<WatchReport> {
        self.watcher()?
            .until_connected(service_name, channel, except)
            .await
    }

    /// Wait until every current connection from an exit of `service_name`
    /// on `channel` has closed.
    pub async fn until_exits_disconnected(
        &self,
        service_name: &str,
        channel: &Channel,
    ) -> Result<WatchReport> {
        self.watcher()?
            .until_disconnected(service_name, channel)
            .await
    }

    /// Advertise `service_name` from `endpoint`, outside any agent.
    pub async fn send_register(
        &self,
        endpoint: &B::Endpoint,
        service_name: &str,
    ) -> Result<AdvertiseResponse> {
        self.send_advertisement(
            endpoint,
            AdvertiseOp::Advertise,
            AdvertiseRequest::single(service_name),
            self.config.call,
        )
        .await
    }

    /// Withdraw `service_name` from `endpoint`, outside any agent.
    pub async fn send_unregister(
        &self,
        endpoint: &B::Endpoint,
        service_name: &str,
    ) -> Result<AdvertiseResponse> {
        self.send_advertisement(
            endpoint,
            AdvertiseOp::Withdraw,
            AdvertiseRequest::single(service_name),
            self.config.call,
        )
        .await
    }

    /// Raw advertise/withdraw call with explicit options.
    pub async fn send_advertisement(
        &self,
        endpoint: &B::Endpoint,
        op: AdvertiseOp,
        request: AdvertiseRequest,
        options: CallOptions,
    ) -> Result<AdvertiseResponse> {
        call_advertise(endpoint, op, request, options).await
    }

    /// Visit every addressable host: ring nodes, dummies, then remotes.
    pub fn for_each_host_port<F>(&self, mut visit: F)
    where
        F: FnMut(HostRole, &str),
    {
        for node in &self.nodes {
            if let Some(host) = node.host_port() {
                visit(HostRole::Ring, host);
            }
        }
        for dummy in self.dummies.lock().iter().flatten() {
            if let Some(host) = dummy.host_port() {
                visit(HostRole::Dummy, &host);
            }
        }
        for entry in self.remotes.lock().values() {
            if let Some(host) = entry.remote.host_port() {
                visit(entry.role, &host);
            }
        }
    }

    /// Log every addressable host at info level.
    pub fn log_host_ports(&self) {
        self.for_each_host_port(|role, host_port| {
            info!(%role, host_port, "cluster host");
        });
    }
}

impl<B: MeshBackend> fmt::Debug for Cluster<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("state", &self.state)
            .field("k_value", &self.k_value)
            .field("hosts", &self.hosts)
            .field("remotes", &self.remotes.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

fn collapse(context: String, violations: Vec<String>) -> Result<()> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::Assertion {
            context,
            violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse() {
        assert!(collapse("ok".into(), Vec::new()).is_ok());
        let err = collapse("bad".into(), vec!["a".into(), "b".into()]).unwrap_err();
        assert_eq!(err.violations().len(), 2);
        assert!(err.to_string().starts_with("bad: 2 violation(s)"));
    }

    #[test]
    fn test_check_builders() {
        let check = ExitPeersCheck::new("bob", "127.0.0.1:9")
            .dead()
            .with_blacklisted("127.0.0.1:1");
        assert!(check.is_dead);
        assert!(check.blacklist.contains("127.0.0.1:1"));
        assert_eq!(ExitKValueCheck::new("bob").with_k_value(3).k_value, Some(3));
    }

    #[test]
    fn test_role_names() {
        assert_eq!(HostRole::NamedRemote.to_string(), "named-remote");
        assert_eq!(HostRole::TraceCollector.to_string(), "trace-collector");
    }
}
