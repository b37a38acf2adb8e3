//! Bootstrap connector
//!
//! Dials every configured entry peer concurrently, starts a DHT bootstrap
//! query if any of them answered, and then fires the readiness signal. The
//! signal fires exactly once whatever the outcome, so a node with no
//! reachable entry peers still becomes usable for local work.

use futures::future::join_all;
use libp2p::{Multiaddr, PeerId};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::node::OverlayNode;
use crate::readiness::Readiness;

/// Per-entry connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Well-known public IPFS DHT entry points
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
    "/ip4/104.236.179.241/tcp/4001/p2p/QmSoLPppuBtQSGwKDZT2M73ULpjvfd3aZ6ha4oFGL1KrGM",
    "/ip4/104.236.76.40/tcp/4001/p2p/QmSoLV4Bbm51jM9C4gDYZQ9Cy3U6aXMJDAbzgu2fzaDs64",
    "/ip4/128.199.219.111/tcp/4001/p2p/QmSoLSafTMBsPKadTEgaXctDQVcqN88CNLHXMkTNwMKPnu",
    "/ip4/178.62.158.247/tcp/4001/p2p/QmSoLer265NRgSp2LA3dPaeykiS1J6DifTC88f5uVQKNAd",
];

pub fn default_bootstrap_peers() -> Vec<String> {
    DEFAULT_BOOTSTRAP_PEERS.iter().map(|s| s.to_string()).collect()
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Invalid bootstrap address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("Bootstrap peer {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },
}

pub struct BootstrapConnector {
    peers: Vec<String>,
    timeout: Duration,
}

impl BootstrapConnector {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers,
            timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run in the background; `ready` fires when every entry has been tried
    pub fn spawn(self, node: OverlayNode, ready: Readiness) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(&node, &ready).await;
        })
    }

    /// Try every entry peer, then fire `ready`. Returns the peers reached.
    pub async fn run(&self, node: &OverlayNode, ready: &Readiness) -> Vec<PeerId> {
        info!("Bootstrapping from {} entry peers", self.peers.len());

        let attempts = self.peers.iter().map(|addr| self.connect_one(node, addr));
        let mut connected = Vec::new();
        for result in join_all(attempts).await {
            match result {
                Ok(peer) => connected.push(peer),
                Err(e) => warn!("{}", e),
            }
        }

        if connected.is_empty() {
            warn!("No bootstrap peer reachable, continuing without DHT bootstrap");
        } else {
            info!("Connected to {} bootstrap peers", connected.len());
            if let Err(e) = node.bootstrap_dht() {
                warn!("Failed to start DHT bootstrap: {}", e);
            }
        }

        if ready.fire() {
            debug!("Readiness signal fired");
        }
        connected
    }

    async fn connect_one(&self, node: &OverlayNode, addr: &str) -> Result<PeerId, BootstrapError> {
        let multiaddr: Multiaddr = addr.parse().map_err(|e: libp2p::multiaddr::Error| {
            BootstrapError::InvalidAddress {
                addr: addr.to_string(),
                reason: e.to_string(),
            }
        })?;

        let unreachable = |reason: String| BootstrapError::Unreachable {
            addr: addr.to_string(),
            reason,
        };

        match tokio::time::timeout(self.timeout, node.connect(multiaddr)).await {
            Ok(Ok(peer)) => {
                debug!(%peer, "Connected to bootstrap peer {}", addr);
                Ok(peer)
            }
            Ok(Err(e)) => Err(unreachable(e.to_string())),
            Err(_) => Err(unreachable(format!("timed out after {:?}", self.timeout))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::{dial_address, test_node};

    #[test]
    fn test_default_peers_are_dialable() {
        for addr in DEFAULT_BOOTSTRAP_PEERS {
            let addr: Multiaddr = addr.parse().unwrap();
            assert!(matches!(
                addr.iter().last(),
                Some(libp2p::multiaddr::Protocol::P2p(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_fires_with_no_reachable_peers() {
        let (_dir, node) = test_node().await;
        let ready = Readiness::new();

        let connector = BootstrapConnector::new(vec![
            "not a multiaddr".to_string(),
            // Valid address, nothing listening
            "/ip4/127.0.0.1/tcp/1/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .to_string(),
        ])
        .with_timeout(Duration::from_secs(2));

        let connected = connector.run(&node, &ready).await;
        assert!(connected.is_empty());
        assert!(ready.is_ready());
        node.close().await;
    }

    #[tokio::test]
    async fn test_connects_to_entry_peer() {
        let (_da, a) = test_node().await;
        let (_db, b) = test_node().await;
        let ready = Readiness::new();

        let connector = BootstrapConnector::new(vec![dial_address(&a).to_string()]);
        let handle = connector.spawn(b.clone(), ready.clone());

        tokio::time::timeout(Duration::from_secs(15), ready.wait())
            .await
            .unwrap();
        handle.await.unwrap();
        assert!(!b.addresses_of(&a.peer_id()).is_empty());

        a.close().await;
        b.close().await;
    }
}
