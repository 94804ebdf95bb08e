//! In-process mesh backend.
//!
//! Nodes bind real ephemeral TCP listeners on loopback so every host:port is
//! unique, but all traffic stays in memory:
//!
//! - membership is a [`HashRing`] per node, spread by periodic pairwise
//!   gossip with a random known host;
//! - an advertise call enters the mesh at the first live seed, which routes
//!   it to the exit nodes of each service on its own ring;
//! - each exit node dials the advertising endpoint with a paired
//!   [`Connection`](crate::channel::Connection). The endpoint's inbound end
//!   identifies after [`SimConfig::handshake_delay`].
//!
//! [`SimNetwork`] exposes fault injection (`fail_listen`, `fail_advertise`)
//! and per-service call counters for tests.

mod endpoint;
mod network;
mod node;
mod ring;

use std::time::Duration;

pub use endpoint::SimEndpoint;
pub use network::SimNetwork;
pub use node::{SimMembership, SimNode};
pub use ring::HashRing;

use crate::mesh::{HostList, MeshBackend, NodeOptions};

/// Tuning of the simulated mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    /// Period of each node's gossip round.
    ///
    /// Default: 5ms
    pub gossip_interval: Duration,

    /// Delay before a dialled endpoint sees the connection identified.
    ///
    /// Default: 1ms
    pub handshake_delay: Duration,

    /// Ring points placed per host.
    ///
    /// Default: 100
    pub replica_points: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(5),
            handshake_delay: Duration::from_millis(1),
            replica_points: 100,
        }
    }
}

impl SimConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gossip period (builder pattern).
    pub const fn with_gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    /// Set the handshake delay (builder pattern).
    pub const fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Set ring points per host (builder pattern).
    pub const fn with_replica_points(mut self, points: usize) -> Self {
        self.replica_points = points;
        self
    }
}

/// [`MeshBackend`] over a [`SimNetwork`].
#[derive(Debug, Clone, Default)]
pub struct SimBackend {
    network: SimNetwork,
    config: SimConfig,
}

impl SimBackend {
    /// Backend on a fresh network with default tuning.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend on a fresh network with `config`.
    pub fn with_config(config: SimConfig) -> Self {
        Self {
            network: SimNetwork::new(),
            config,
        }
    }

    /// The shared network, for fault injection and call accounting.
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Backend tuning.
    pub fn config(&self) -> SimConfig {
        self.config
    }
}

impl MeshBackend for SimBackend {
    type Node = SimNode;
    type Endpoint = SimEndpoint;

    fn create_node(&self, options: NodeOptions) -> SimNode {
        SimNode::new(options, self.network.clone(), self.config)
    }

    fn create_endpoint(&self, name: &str, seeds: HostList) -> SimEndpoint {
        SimEndpoint::new(name, seeds, self.network.clone())
    }
}
