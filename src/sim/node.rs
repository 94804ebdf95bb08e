//! Simulated ring node and its membership view.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use rand::seq::IndexedRandom;
use tokio::{net::TcpListener, task::JoinHandle};
use tracing::{debug, trace};

use super::{ring::HashRing, SimConfig, SimNetwork};
use crate::{
    channel::{Channel, Connection},
    error::{Error, Result},
    event::{EventEmitter, Subscription},
    mesh::{
        AdvertiseOp, AdvertiseRequest, AdvertiseResponse, HostList, MeshNode, Membership,
        NodeOptions,
    },
    shard::exit_shard_for,
};

struct MembershipInner {
    ring: RwLock<HashRing>,
    events: EventEmitter<u32>,
}

/// Gossiped membership view of one simulated node.
///
/// Every merge recomputes the checksum and fires an event, whether or not
/// the view changed.
#[derive(Clone)]
pub struct SimMembership {
    inner: Arc<MembershipInner>,
}

impl SimMembership {
    /// Empty view placing `replica_points` ring points per host.
    pub fn new(replica_points: usize) -> Self {
        Self {
            inner: Arc::new(MembershipInner {
                ring: RwLock::new(HashRing::new(replica_points)),
                events: EventEmitter::new(),
            }),
        }
    }

    /// Merge `hosts` into the view. Returns whether anything was added.
    pub fn merge<I, S>(&self, hosts: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (changed, checksum) = {
            let mut ring = self.inner.ring.write();
            let mut changed = false;
            for host in hosts {
                changed |= ring.add(host.as_ref());
            }
            (changed, ring.checksum())
        };
        self.inner.events.emit(checksum);
        changed
    }
}

impl Membership for SimMembership {
    fn lookup(&self, key: &str) -> Option<String> {
        self.inner.ring.read().lookup(key).map(str::to_string)
    }

    fn hosts(&self) -> Vec<String> {
        self.inner.ring.read().hosts().map(str::to_string).collect()
    }

    fn checksum(&self) -> u32 {
        self.inner.ring.read().checksum()
    }

    fn subscribe_checksum(&self) -> Subscription<u32> {
        self.inner.events.subscribe()
    }

    fn listener_count(&self) -> usize {
        self.inner.events.listener_count()
    }
}

impl std::fmt::Debug for SimMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.inner.ring.read();
        f.debug_struct("SimMembership")
            .field("hosts", &ring.len())
            .field("checksum", &ring.checksum())
            .finish()
    }
}

/// State of one node reachable through the network registry.
pub(crate) struct NodeShared {
    index: usize,
    k_value: usize,
    config: SimConfig,
    network: SimNetwork,
    host: OnceLock<String>,
    listener: Mutex<Option<TcpListener>>,
    joined: AtomicBool,
    destroyed: AtomicBool,
    membership: SimMembership,
    channel: Channel,
    service_peers: Mutex<BTreeMap<String, BTreeSet<String>>>,
    links: Mutex<HashMap<String, Connection>>,
    handshakes: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeShared {
    fn host(&self) -> Option<&str> {
        self.host.get().map(String::as_str)
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::Acquire)
    }

    /// Entry point of an advertise call: route each service to its exit
    /// nodes as seen from this node's view.
    pub(crate) fn handle_advertise(
        &self,
        op: AdvertiseOp,
        body: &[u8],
        from: &str,
        from_channel: &Channel,
    ) -> Result<AdvertiseResponse> {
        let request = AdvertiseRequest::decode(body)?;
        let mut reached = BTreeSet::new();
        for service in request.service_names() {
            let shard = exit_shard_for(&self.membership, service, self.k_value);
            for exit in shard.keys() {
                let relayed = match self.network.node(exit) {
                    Some(node) => {
                        node.relay(op, service, from, from_channel);
                        true
                    }
                    None => false,
                };
                if relayed {
                    reached.insert(exit.clone());
                }
            }
            debug!(
                index = self.index,
                method = op.method(),
                service,
                exits = shard.len(),
                "advertise routed"
            );
        }
        Ok(AdvertiseResponse {
            connection_count: reached.len(),
        })
    }

    /// Apply one advertise/withdraw at an exit node.
    fn relay(&self, op: AdvertiseOp, service: &str, from: &str, from_channel: &Channel) {
        let Some(host) = self.host().map(str::to_string) else {
            return;
        };
        match op {
            AdvertiseOp::Advertise => {
                self.service_peers
                    .lock()
                    .entry(service.to_string())
                    .or_default()
                    .insert(from.to_string());
                self.connect_to(&host, from, from_channel);
            }
            AdvertiseOp::Withdraw => {
                let still_serving = {
                    let mut peers = self.service_peers.lock();
                    if let Some(set) = peers.get_mut(service) {
                        set.remove(from);
                    }
                    peers.values().any(|set| set.contains(from))
                };
                if !still_serving {
                    if let Some(link) = self.links.lock().remove(from) {
                        link.close();
                    }
                }
            }
        }
    }

    /// Dial `peer` unless a live link exists. The peer's end is identified
    /// after the handshake delay.
    fn connect_to(&self, host: &str, peer: &str, peer_channel: &Channel) {
        let mut links = self.links.lock();
        if links.get(peer).is_some_and(|link| !link.is_closed()) {
            return;
        }
        let (out, inbound) = Connection::pair();
        out.identify(peer);
        self.channel.add_connection(out.clone());
        peer_channel.add_connection(inbound.clone());
        links.insert(peer.to_string(), out);
        drop(links);

        let delay = self.config.handshake_delay;
        let host = host.to_string();
        let handshake = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !inbound.is_closed() {
                inbound.identify(host);
            }
        });
        let mut handshakes = self.handshakes.lock();
        handshakes.retain(|task| !task.is_finished());
        handshakes.push(handshake);
    }

    /// Exchange views with one random known host.
    fn gossip_round(&self, seeds: &HostList) {
        let Some(own) = self.host() else {
            return;
        };
        let mut candidates = seeds.snapshot();
        candidates.extend(self.membership.hosts());
        candidates.sort();
        candidates.dedup();
        candidates.retain(|host| host != own);

        let target = candidates.choose(&mut rand::rng()).cloned();
        let Some(peer) = target.and_then(|host| self.network.node(&host)) else {
            // Still record our own recomputation.
            self.membership.merge([own]);
            return;
        };
        if !peer.is_joined() {
            return;
        }
        let mine = self.membership.hosts();
        let theirs = peer.membership.hosts();
        let learned = self.membership.merge(&theirs);
        let taught = peer.membership.merge(&mine);
        if learned || taught {
            trace!(index = self.index, peer = peer.index, "gossip exchanged new members");
        }
    }

    fn shutdown(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        if let Some(host) = self.host() {
            self.network.deregister_node(host);
        }
        self.joined.store(false, Ordering::Release);
        for task in self.handshakes.lock().drain(..) {
            task.abort();
        }
        for (_, link) in self.links.lock().drain() {
            link.close();
        }
        self.channel.close_all();
        self.listener.lock().take();
    }
}

async fn run_gossip(node: Weak<NodeShared>, seeds: HostList, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(node) = node.upgrade() else {
            break;
        };
        if !node.is_joined() {
            break;
        }
        node.gossip_round(&seeds);
    }
}

/// A simulated ring node.
pub struct SimNode {
    shared: Arc<NodeShared>,
    gossip: Mutex<Option<JoinHandle<()>>>,
}

impl SimNode {
    pub(crate) fn new(options: NodeOptions, network: SimNetwork, config: SimConfig) -> Self {
        let membership = SimMembership::new(config.replica_points);
        Self {
            shared: Arc::new(NodeShared {
                index: options.index,
                k_value: options.k_value,
                config,
                network,
                host: OnceLock::new(),
                listener: Mutex::new(None),
                joined: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                membership,
                channel: Channel::new(),
                service_peers: Mutex::new(BTreeMap::new()),
                links: Mutex::new(HashMap::new()),
                handshakes: Mutex::new(Vec::new()),
            }),
            gossip: Mutex::new(None),
        }
    }

    /// Ordinal index.
    pub fn index(&self) -> usize {
        self.shared.index
    }

    /// Whether the node has joined gossip.
    pub fn is_joined(&self) -> bool {
        self.shared.is_joined()
    }
}

impl MeshNode for SimNode {
    type Membership = SimMembership;

    async fn listen(&self) -> Result<SocketAddr> {
        let shared = &self.shared;
        if let Some(kind) = shared.network.take_listen_fault(shared.index) {
            return Err(Error::Io(io::Error::new(
                kind,
                format!("node {} refused to listen", shared.index),
            )));
        }
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let host = shared.host.get_or_init(|| addr.to_string());
        *shared.listener.lock() = Some(listener);
        shared.network.register_node(host, shared);
        // A destroy may have raced the bind.
        if shared.destroyed.load(Ordering::SeqCst) {
            shared.network.deregister_node(host);
            shared.listener.lock().take();
            return Err(Error::Closed);
        }
        debug!(index = shared.index, host_port = %host, "node listening");
        Ok(addr)
    }

    async fn join(&self, seeds: HostList) -> Result<()> {
        let shared = &self.shared;
        let Some(host) = shared.host() else {
            return Err(Error::Rpc(format!(
                "node {} joined before listening",
                shared.index
            )));
        };
        shared.membership.merge([host]);
        shared.joined.store(true, Ordering::Release);
        shared.gossip_round(&seeds);

        let task = tokio::spawn(run_gossip(
            Arc::downgrade(shared),
            seeds,
            shared.config.gossip_interval,
        ));
        if let Some(previous) = self.gossip.lock().replace(task) {
            previous.abort();
        }
        debug!(index = shared.index, host_port = %host, "node joined gossip");
        Ok(())
    }

    fn host_port(&self) -> Option<String> {
        self.shared.host().map(str::to_string)
    }

    fn membership(&self) -> SimMembership {
        self.shared.membership.clone()
    }

    fn channel(&self) -> &Channel {
        &self.shared.channel
    }

    fn service_peers(&self, service: &str) -> Vec<String> {
        self.shared
            .service_peers
            .lock()
            .get(service)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn destroy(&self) {
        if let Some(task) = self.gossip.lock().take() {
            task.abort();
        }
        self.shared.shutdown();
        debug!(index = self.shared.index, "node destroyed");
    }
}

impl Drop for SimNode {
    fn drop(&mut self) {
        if let Some(task) = self.gossip.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode")
            .field("index", &self.shared.index)
            .field("host", &self.shared.host())
            .field("joined", &self.shared.is_joined())
            .finish()
    }
}
