//! Integration tests for exit connection waits and registration timers.

mod common;

use std::{collections::BTreeSet, time::Duration};

use common::{bootstrapped, within};
use mesh_cluster::{
    AdvertiseOp, AdvertiseRequest, CallOptions, ClusterConfig, Direction, Endpoint,
    RegistrationState, RemoteConfig,
};

#[tokio::test]
async fn test_exits_connect_then_disconnect() {
    let mut cluster = bootstrapped(ClusterConfig::new().with_size(4)).await;
    let dummy = cluster.dummy(0).unwrap();
    let channel = dummy.channel().clone();
    let exits = cluster.exit_nodes("alice").unwrap();

    let (connected, response) = within("connect", async {
        tokio::join!(
            cluster.until_exits_connected("alice", &channel),
            cluster.send_register(&dummy, "alice"),
        )
    })
    .await;
    let connected = connected.unwrap();
    assert_eq!(response.unwrap().connection_count, exits.len());
    assert_eq!(
        connected.peers.iter().cloned().collect::<BTreeSet<_>>(),
        exits
    );
    assert_eq!(connected.peers.len(), exits.len());
    for exit in &exits {
        assert!(channel.has_connection(exit, Direction::In));
    }
    assert_eq!(channel.listener_count(), 0);

    let (disconnected, response) = within("disconnect", async {
        tokio::join!(
            cluster.until_exits_disconnected("alice", &channel),
            cluster.send_unregister(&dummy, "alice"),
        )
    })
    .await;
    response.unwrap();
    let disconnected = disconnected.unwrap();
    assert_eq!(disconnected.connections, exits.len());
    assert_eq!(
        disconnected.peers.into_iter().collect::<BTreeSet<_>>(),
        exits
    );
    assert!(channel.connections().is_empty());

    cluster.close().await;
}

#[tokio::test]
async fn test_disconnect_wait_without_connections_resolves() {
    let mut cluster = bootstrapped(ClusterConfig::new().with_size(2)).await;
    let dummy = cluster.dummy(1).unwrap();

    let report = within(
        "disconnect",
        cluster.until_exits_disconnected("nobody", dummy.channel()),
    )
    .await
    .unwrap();
    assert_eq!(report.connections, 0);

    cluster.close().await;
}

#[tokio::test]
async fn test_connected_except_skips_excluded_exits() {
    let mut cluster = bootstrapped(ClusterConfig::new().with_size(6).with_k_value(3)).await;
    let dummy = cluster.dummy(0).unwrap();
    let exits = cluster.exit_nodes("dave").unwrap();
    let excluded: BTreeSet<String> = exits.iter().take(1).cloned().collect();

    let (report, response) = within("connect", async {
        tokio::join!(
            cluster.until_exits_connected_except("dave", dummy.channel(), &excluded),
            cluster.send_register(&dummy, "dave"),
        )
    })
    .await;
    response.unwrap();
    let report = report.unwrap();
    assert_eq!(report.peers.len(), exits.len() - 1);
    assert!(report.peers.iter().all(|peer| !excluded.contains(peer)));

    cluster.close().await;
}

#[tokio::test]
async fn test_raw_advertisement_uses_explicit_options() {
    let mut cluster = bootstrapped(ClusterConfig::new().with_size(2)).await;
    let dummy = cluster.dummy(0).unwrap();
    let network = cluster.backend().network().clone();

    network.fail_advertise("erin", 1);
    let options = CallOptions::new()
        .with_timeout(Duration::from_millis(500))
        .with_retry_limit(2);
    let response = within(
        "advertise",
        cluster.send_advertisement(
            &dummy,
            AdvertiseOp::Advertise,
            AdvertiseRequest::single("erin"),
            options,
        ),
    )
    .await
    .unwrap();
    assert_eq!(network.advertise_calls("erin"), 2);
    assert!(response.connection_count >= 1);

    // Default options deliver exactly once.
    network.fail_advertise("frank", 1);
    assert!(cluster.send_register(&dummy, "frank").await.is_err());
    assert_eq!(network.advertise_calls("frank"), 1);

    cluster.close().await;
}

#[tokio::test]
async fn test_periodic_registration_stops_on_destroy() {
    let steve = RemoteConfig::new("steve").with_register_every(Duration::from_millis(100));
    let mut cluster = bootstrapped(
        ClusterConfig::new()
            .with_size(3)
            .with_primary_remotes([RemoteConfig::new("bob"), steve]),
    )
    .await;
    let network = cluster.backend().network().clone();
    let steve = cluster.remote("steve").unwrap();
    assert!(steve.agent().timer_armed());

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(network.advertise_calls("steve") >= 2);
    assert_eq!(steve.agent().state(), RegistrationState::Registered);

    steve.destroy().await;
    assert!(!steve.agent().timer_armed());
    let observed = network.advertise_calls("steve");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(network.advertise_calls("steve"), observed);

    // One-shot remotes never re-register.
    assert_eq!(network.advertise_calls("bob"), 1);

    cluster.close().await;
}
