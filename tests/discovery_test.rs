//! Integration tests for chainkit discovery
//!
//! Every test runs real nodes on loopback with ephemeral ports. Node B is
//! bootstrapped to node A only; no public network is involved.

use chainkit_core::{DiscoveryConfig, DiscoveryError, DiscoveryServer, PeerInfo};
use futures_util::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use std::path::Path;
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::{fmt, EnvFilter};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Initialize tracing for tests
fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

fn config(root: &Path, bootstrap: Vec<String>) -> DiscoveryConfig {
    DiscoveryConfig::new(root, 0).with_bootstrap_peers(bootstrap)
}

/// Loopback address other local nodes can dial. Interfaces are reported
/// one by one, so poll until loopback shows up.
async fn loopback_address(server: &DiscoveryServer) -> String {
    let peer_id = server.peer_id().unwrap();
    let loopback = Protocol::Ip4("127.0.0.1".parse().unwrap());

    for _ in 0..100 {
        let found: Option<Multiaddr> = server
            .listen_addresses()
            .unwrap()
            .into_iter()
            .find(|a| a.iter().any(|p| p == loopback));
        if let Some(addr) = found {
            return addr.with(Protocol::P2p(peer_id)).to_string();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node never listened on IPv4 loopback");
}

/// Start A with no bootstrap peers and B bootstrapped to A
async fn start_pair(dir: &Path) -> (DiscoveryServer, DiscoveryServer) {
    let mut a = DiscoveryServer::new(config(&dir.join("a"), vec![]));
    a.start().await.unwrap();
    a.wait_ready().await.unwrap();

    let mut b = DiscoveryServer::new(config(&dir.join("b"), vec![loopback_address(&a).await]));
    b.start().await.unwrap();
    timeout(TEST_TIMEOUT, b.wait_ready()).await.unwrap().unwrap();

    (a, b)
}

fn write_project(dir: &Path) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let manifest = b"name: testnet\nimage: testnet:latest\n".to_vec();
    let genesis = br#"{"chain_id":"testnet-1","validators":[]}"#.to_vec();
    // A bit over two chunks
    let image: Vec<u8> = (0..600 * 1024).map(|i| (i * 7 % 256) as u8).collect();

    std::fs::write(dir.join("chainkit.yml"), &manifest).unwrap();
    std::fs::write(dir.join("genesis.json"), &genesis).unwrap();
    std::fs::write(dir.join("image.tar"), &image).unwrap();
    (manifest, genesis, image)
}

#[tokio::test]
async fn test_announce_then_find_peers() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (mut a, mut b) = start_pair(dir.path()).await;
    write_project(dir.path());

    let network_id = a
        .publish(
            &dir.path().join("chainkit.yml"),
            &dir.path().join("genesis.json"),
            &dir.path().join("image.tar"),
        )
        .await
        .unwrap()
        .to_string();

    let announced = PeerInfo::new("node-a", 26656);
    timeout(TEST_TIMEOUT, a.announce(&network_id, announced.clone()))
        .await
        .unwrap()
        .unwrap();

    let peers: Vec<PeerInfo> = timeout(TEST_TIMEOUT, async {
        b.peers(&network_id).await.unwrap().collect().await
    })
    .await
    .unwrap();

    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].node_id, announced.node_id);
    assert_eq!(peers[0].tendermint_p2p_port, announced.tendermint_p2p_port);
    assert!(!peers[0].ips.is_empty());

    // The announcer never finds itself
    let own: Vec<PeerInfo> = timeout(TEST_TIMEOUT, async {
        a.peers(&network_id).await.unwrap().collect().await
    })
    .await
    .unwrap();
    assert!(own.iter().all(|p| p.node_id != "node-a"));

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_publish_then_join_over_network() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (mut a, mut b) = start_pair(dir.path()).await;
    let (manifest, genesis, image) = write_project(dir.path());

    let network_id = a
        .publish(
            &dir.path().join("chainkit.yml"),
            &dir.path().join("genesis.json"),
            &dir.path().join("image.tar"),
        )
        .await
        .unwrap()
        .to_string();
    timeout(TEST_TIMEOUT, a.announce(&network_id, PeerInfo::new("node-a", 26656)))
        .await
        .unwrap()
        .unwrap();

    let mut network = timeout(TEST_TIMEOUT, b.join(&network_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(network.manifest, manifest);
    assert_eq!(network.genesis, genesis);

    let mut fetched = Vec::new();
    timeout(TEST_TIMEOUT, network.write_image(&mut fetched))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched, image);

    b.stop().await.unwrap();
    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_second_start_on_same_root_fails() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut first = DiscoveryServer::new(config(dir.path(), vec![]));
    first.start().await.unwrap();

    let mut second = DiscoveryServer::new(config(dir.path(), vec![]));
    assert!(matches!(
        second.start().await,
        Err(DiscoveryError::AlreadyRunning(_))
    ));
    assert!(!second.is_running());

    first.stop().await.unwrap();
    second.start().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_ready_with_unreachable_bootstrap() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let mut server = DiscoveryServer::new(config(
        dir.path(),
        vec![
            "garbage".to_string(),
            "/ip4/127.0.0.1/tcp/1/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .to_string(),
        ],
    ));
    server.start().await.unwrap();

    timeout(TEST_TIMEOUT, server.wait_ready())
        .await
        .unwrap()
        .unwrap();
    // Already fired: returns immediately
    timeout(Duration::from_millis(100), server.wait_ready())
        .await
        .unwrap()
        .unwrap();

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_while_network_info_held() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    write_project(dir.path());
    let root = dir.path().join("node");

    let mut server = DiscoveryServer::new(config(&root, vec![]));
    server.start().await.unwrap();
    let network_id = server
        .publish(
            &dir.path().join("chainkit.yml"),
            &dir.path().join("genesis.json"),
            &dir.path().join("image.tar"),
        )
        .await
        .unwrap()
        .to_string();
    let mut held = timeout(TEST_TIMEOUT, server.join(&network_id))
        .await
        .unwrap()
        .unwrap();
    server.stop().await.unwrap();

    server.start().await.unwrap();
    let network = timeout(TEST_TIMEOUT, server.join(&network_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(network.manifest, held.manifest);

    // The stale stream fails instead of reading the reopened store
    let mut sink = Vec::new();
    assert!(held.write_image(&mut sink).await.is_err());

    server.stop().await.unwrap();
}
