//! Shared helpers for mesh-cluster integration tests.

#![allow(dead_code)]

use std::{future::Future, time::Duration};

use mesh_cluster::{sim::SimBackend, Cluster, ClusterConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Upper bound for any single wait in these tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a tracing subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer().with_filter(
            EnvFilter::from_default_env().add_directive("mesh_cluster=info".parse().unwrap()),
        ))
        .try_init();
}

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    match tokio::time::timeout(TEST_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("{what} did not finish within {TEST_TIMEOUT:?}"),
    }
}

/// Cluster over a fresh sim network.
pub fn sim_cluster(config: ClusterConfig) -> Cluster<SimBackend> {
    init_tracing();
    Cluster::new(SimBackend::new(), config).unwrap()
}

/// Bootstrapped cluster over a fresh sim network.
pub async fn bootstrapped(config: ClusterConfig) -> Cluster<SimBackend> {
    let mut cluster = sim_cluster(config);
    within("bootstrap", cluster.bootstrap()).await.unwrap();
    cluster
}
