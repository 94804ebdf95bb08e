//! # mesh-cluster
//!
//! Test harness that stands up a multi-node routing-mesh cluster, drives it
//! through staged bootstrap and verifies cluster-wide invariants.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Cluster<B>                              │
//! │      grow / bootstrap / close, checks, waits, host listing       │
//! ├────────────────┬──────────────────┬─────────────────────────────┤
//! │  Convergence   │ ConnectionWatcher│      RegistrationAgent      │
//! │ (checksum evts)│ (exit peers dial)│  (ad / unad, re-register)   │
//! ├────────────────┴────────┬─────────┴─────────────────────────────┤
//! │      ShardResolver      │   ReadySignal / fan_in, EventEmitter   │
//! ├─────────────────────────┴───────────────────────────────────────┤
//! │      MeshBackend: MeshNode, Membership, Endpoint, Channel        │
//! │                 (sim backend, or a real mesh binding)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything waits on events and counted completions; nothing polls with
//! sleeps. Waits carry no timeout of their own, so tests wrap them in
//! `tokio::time::timeout`.
//!
//! ## Example
//!
//! ```ignore
//! use mesh_cluster::{sim::SimBackend, Cluster, ClusterConfig, ExitKValueCheck};
//!
//! let mut cluster = Cluster::new(SimBackend::new(), ClusterConfig::new().with_size(5))?;
//! cluster.bootstrap().await?;
//! cluster.check_exit_k_value(&ExitKValueCheck::new("bob").with_k_value(2))?;
//! cluster.close().await;
//! ```

#![deny(missing_docs)]
#![allow(clippy::type_complexity)]

mod channel;
mod cluster;
mod config;
mod convergence;
mod error;
mod event;
mod mesh;
mod ready;
mod registration;
mod shard;
mod watcher;

pub mod sim;

// Re-export channel types
pub use channel::{Channel, CloseReason, Connection, Direction};

// Re-export cluster types
pub use cluster::{
    Cluster, ClusterNode, ClusterState, ExitKValueCheck, ExitPeersCheck, HostRole, MembershipOf,
};

// Re-export config types
pub use config::{
    default_k_value, CallOptions, ClusterConfig, RemoteConfig, ENV_K_VALUE, ENV_SIZE, ENV_TRACE,
    TRACE_COLLECTOR_SERVICE,
};

// Re-export convergence types
pub use convergence::{
    is_converged, memberships_converged, view_matches, wait_for_convergence, ConvergenceReport,
};

// Re-export error types
pub use error::{Error, Result};

// Re-export event types
pub use event::{EventEmitter, Subscription};

// Re-export mesh collaborator types
pub use mesh::{
    call_advertise, AdvertiseOp, AdvertiseRequest, AdvertiseResponse, Endpoint, HostList,
    MeshBackend, MeshNode, Membership, NodeOptions, ServiceAdvertisement,
};

// Re-export fan-in types
pub use ready::{fan_in, ReadySignal, ReadyWait};

// Re-export registration types
pub use registration::{RegistrationAgent, RegistrationState, Remote};

// Re-export shard types
pub use shard::{
    diff_shards, exit_shard_for, normalize_shard, replica_keys, shard_keys, ExitShard,
    ShardResolver,
};

// Re-export watcher types
pub use watcher::{ConnectionWatcher, PendingPeerSet, WatchReport};
