//! Collaborator surface of the routing mesh.
//!
//! The harness never implements the mesh itself. It drives nodes and
//! endpoints through these traits and observes membership through
//! [`Membership`]. The in-process [`sim`](crate::sim) backend implements
//! them for the crate's own tests; a binding to a real mesh implements them
//! the same way.

use std::{fmt, future::Future, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    channel::Channel,
    config::CallOptions,
    error::{Error, Result},
    event::Subscription,
};

/// Ordered list of ring node addresses, shared by reference as every node's
/// gossip seed. Only the orchestrator appends to it.
#[derive(Clone, Default)]
pub struct HostList {
    hosts: Arc<RwLock<Vec<String>>>,
}

impl HostList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<String> {
        self.hosts.read().clone()
    }

    /// Number of hosts.
    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Whether `host` is listed.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.read().iter().any(|h| h == host)
    }

    pub(crate) fn extend(&self, hosts: impl IntoIterator<Item = String>) {
        self.hosts.write().extend(hosts);
    }
}

impl fmt::Debug for HostList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hosts.read().iter()).finish()
    }
}

impl From<Vec<String>> for HostList {
    fn from(hosts: Vec<String>) -> Self {
        Self {
            hosts: Arc::new(RwLock::new(hosts)),
        }
    }
}

/// A node's gossip-membership view.
///
/// Handles are cheap clones of the same live view.
pub trait Membership: Clone + Send + Sync + 'static {
    /// Deterministic ring lookup: which host owns `key`.
    fn lookup(&self, key: &str) -> Option<String>;

    /// Hosts currently in the view, in no particular order.
    fn hosts(&self) -> Vec<String>;

    /// Current membership checksum.
    fn checksum(&self) -> u32;

    /// Subscribe to checksum recomputation events. Events may fire without
    /// a material change of the view.
    fn subscribe_checksum(&self) -> Subscription<u32>;

    /// Number of live checksum subscriptions.
    fn listener_count(&self) -> usize;
}

/// Per-node creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOptions {
    /// Ordinal index in the cluster.
    pub index: usize,
    /// Replication factor the node uses for exit shards.
    pub k_value: usize,
}

/// One mesh instance taking part in the ring.
pub trait MeshNode: Send + Sync + 'static {
    /// Membership handle type.
    type Membership: Membership;

    /// Partial bootstrap: bind the transport and start internal services
    /// without joining gossip. Returns the bound address.
    fn listen(&self) -> impl Future<Output = Result<SocketAddr>> + Send;

    /// Gossip wiring: install `seeds` as the bootstrap list and start the
    /// membership client.
    fn join(&self, seeds: HostList) -> impl Future<Output = Result<()>> + Send;

    /// Bound host:port, once listening.
    fn host_port(&self) -> Option<String>;

    /// The node's membership view.
    fn membership(&self) -> Self::Membership;

    /// The node's channel.
    fn channel(&self) -> &Channel;

    /// Hosts this node currently routes `service` to.
    fn service_peers(&self, service: &str) -> Vec<String>;

    /// Stop the node. Must not fail.
    fn destroy(&self) -> impl Future<Output = ()> + Send;
}

/// An auxiliary service endpoint outside the ring.
pub trait Endpoint: Send + Sync + 'static {
    /// Bind the endpoint's listener. Returns the bound address.
    fn listen(&self) -> impl Future<Output = Result<SocketAddr>> + Send;

    /// Bound host:port, once listening.
    fn host_port(&self) -> Option<String>;

    /// The endpoint's channel.
    fn channel(&self) -> &Channel;

    /// Send one advertise or withdraw call to the mesh.
    fn advertise(
        &self,
        op: AdvertiseOp,
        request: AdvertiseRequest,
    ) -> impl Future<Output = Result<AdvertiseResponse>> + Send;

    /// Stop the endpoint. Must not fail and may be called more than once.
    fn destroy(&self) -> impl Future<Output = ()> + Send;
}

/// Factory for nodes and endpoints.
pub trait MeshBackend: Send + Sync + 'static {
    /// Ring node type.
    type Node: MeshNode;
    /// Endpoint type for remotes and dummies.
    type Endpoint: Endpoint;

    /// Construct a ring node. It is not listening yet.
    fn create_node(&self, options: NodeOptions) -> Self::Node;

    /// Construct an endpoint named `name` that reaches the mesh through
    /// `seeds`. It is not listening yet.
    fn create_endpoint(&self, name: &str, seeds: HostList) -> Self::Endpoint;
}

/// The two advertisement calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdvertiseOp {
    /// Service advertisement (`ad`).
    Advertise,
    /// Service withdrawal (`unad`).
    Withdraw,
}

impl AdvertiseOp {
    /// RPC method name.
    pub const fn method(&self) -> &'static str {
        match self {
            AdvertiseOp::Advertise => "ad",
            AdvertiseOp::Withdraw => "unad",
        }
    }
}

impl fmt::Display for AdvertiseOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

/// One advertised service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAdvertisement {
    /// Service name.
    pub service_name: String,
    /// Optional routing cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u32>,
}

/// Body of an `ad`/`unad` call: `{"services":[{"serviceName":..,"cost":..}]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertiseRequest {
    /// Services being advertised or withdrawn.
    pub services: Vec<ServiceAdvertisement>,
}

impl AdvertiseRequest {
    /// Request for a single service without a cost.
    pub fn single(service_name: impl Into<String>) -> Self {
        Self {
            services: vec![ServiceAdvertisement {
                service_name: service_name.into(),
                cost: None,
            }],
        }
    }

    /// Encode as a JSON body.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a JSON body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Service names in request order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.service_name.as_str())
    }
}

/// Reply to an `ad`/`unad` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertiseResponse {
    /// Number of exit nodes the call reached.
    pub connection_count: usize,
}

/// Send one advertisement from `endpoint`, bounded by `options`.
///
/// Each attempt gets the full timeout. With the default retry limit of one the
/// call is delivered exactly once.
pub async fn call_advertise<E: Endpoint>(
    endpoint: &E,
    op: AdvertiseOp,
    request: AdvertiseRequest,
    options: CallOptions,
) -> Result<AdvertiseResponse> {
    let attempts = options.retry_limit.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        let call = endpoint.advertise(op, request.clone());
        match tokio::time::timeout(options.timeout, call).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(err)) => {
                tracing::debug!(method = op.method(), attempt, error = %err, "advertise attempt failed");
                last_error = Some(err);
            }
            Err(_) => {
                tracing::debug!(method = op.method(), attempt, "advertise attempt timed out");
                last_error = Some(Error::timeout(op.method(), options.timeout));
            }
        }
    }
    Err(last_error.unwrap_or(Error::Rpc(format!("{op} was never attempted"))))
}
