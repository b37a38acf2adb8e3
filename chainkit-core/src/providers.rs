//! Provider registry: announce a network and find the peers serving it
//!
//! Announcing registers the peer-info stream handler and publishes a DHT
//! provider record for the network identifier. Finding peers walks the
//! provider records and asks each candidate for its peer info.

use cid::Cid;
use futures::{Stream, StreamExt};
use libp2p::PeerId;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::content_id::parse_network_id;
use crate::node::{NodeError, OverlayNode};
use crate::peer_info::{self, PeerInfo};
use crate::readiness::Readiness;

/// Bound on DHT provide and find-providers
pub const DHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Distinct providers considered per search
pub const MAX_PROVIDERS: usize = 10;

/// Peer info exchanges in flight per search
const EXCHANGE_CONCURRENCY: usize = 4;

const PEER_QUEUE_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Timed out announcing {0} to the DHT")]
    ProvideTimeout(String),

    #[error("Failed to announce {network_id}: {source}")]
    ProvideFailure {
        network_id: String,
        #[source]
        source: NodeError,
    },

    #[error("Invalid network id {0:?}")]
    InvalidNetworkId(String),

    #[error("Overlay error: {0}")]
    Node(#[from] NodeError),
}

/// Peer records found for a network. Dropping it stops the search.
pub struct PeerStream {
    rx: mpsc::Receiver<PeerInfo>,
    producer: JoinHandle<()>,
}

impl Stream for PeerStream {
    type Item = PeerInfo;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PeerInfo>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PeerStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    node: OverlayNode,
    ready: Readiness,
    served: Arc<RwLock<Option<PeerInfo>>>,
    handler_registered: Arc<Mutex<bool>>,
    timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(node: OverlayNode, ready: Readiness) -> Self {
        Self {
            node,
            ready,
            served: Arc::new(RwLock::new(None)),
            handler_registered: Arc::new(Mutex::new(false)),
            timeout: DHT_TIMEOUT,
        }
    }

    /// Override the bound on DHT provide and peer searches
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Serve `info` to peers and advertise this node as a provider of `network_id`
    pub async fn announce(&self, network_id: &str, info: PeerInfo) -> Result<(), ProviderError> {
        let cid = parse_network_id(network_id)
            .map_err(|_| ProviderError::InvalidNetworkId(network_id.to_string()))?;

        self.ready.wait().await;

        *self.served.write().await = Some(info);
        self.register_handler().await?;

        let network_id = cid.to_string();
        match tokio::time::timeout(self.timeout, self.node.provide(&cid)).await {
            Ok(Ok(())) => {
                info!(%network_id, "Announced network");
                Ok(())
            }
            Ok(Err(source)) => Err(ProviderError::ProvideFailure { network_id, source }),
            Err(_) => Err(ProviderError::ProvideTimeout(network_id)),
        }
    }

    async fn register_handler(&self) -> Result<(), ProviderError> {
        let mut registered = self.handler_registered.lock().await;
        if *registered {
            return Ok(());
        }

        let served = Arc::clone(&self.served);
        self.node
            .set_stream_handler(peer_info::PROTOCOL, move |peer, stream| {
                let served = Arc::clone(&served);
                async move {
                    let Some(info) = served.read().await.clone() else {
                        debug!(%peer, "No peer info to serve");
                        return;
                    };
                    if let Err(e) = peer_info::write_peer_info(stream, &info).await {
                        debug!(%peer, "Failed to send peer info: {}", e);
                    }
                }
            })
            .await?;

        *registered = true;
        Ok(())
    }

    /// Find peers serving `network_id`. The local node is never returned.
    pub async fn find_peers(&self, network_id: &str) -> Result<PeerStream, ProviderError> {
        let cid = parse_network_id(network_id)
            .map_err(|_| ProviderError::InvalidNetworkId(network_id.to_string()))?;

        self.ready.wait().await;

        let own_node_id = self.served.read().await.as_ref().map(|i| i.node_id.clone());
        let (tx, rx) = mpsc::channel(PEER_QUEUE_CAPACITY);
        let producer = tokio::spawn(produce_peers(
            self.node.clone(),
            cid,
            own_node_id,
            self.timeout,
            tx,
        ));

        Ok(PeerStream { rx, producer })
    }
}

async fn produce_peers(
    node: OverlayNode,
    cid: Cid,
    own_node_id: Option<String>,
    bound: Duration,
    tx: mpsc::Sender<PeerInfo>,
) {
    let providers = match node.find_providers(&cid, MAX_PROVIDERS).await {
        Ok(providers) => providers,
        Err(e) => {
            warn!("Provider search for {} failed: {}", cid, e);
            return;
        }
    };

    let local = node.peer_id();
    let exchanges = providers
        .filter(|peer| futures::future::ready(*peer != local))
        .for_each_concurrent(EXCHANGE_CONCURRENCY, |peer| {
            let node = node.clone();
            let tx = tx.clone();
            let own_node_id = own_node_id.as_deref();
            async move {
                let Some(info) = exchange(&node, peer).await else {
                    return;
                };
                if own_node_id == Some(info.node_id.as_str()) {
                    debug!(%peer, "Skipping our own peer info");
                    return;
                }
                let _ = tx.send(info).await;
            }
        });

    tokio::select! {
        _ = exchanges => debug!("Provider search for {} exhausted", cid),
        _ = tokio::time::sleep(bound) => debug!("Provider search for {} timed out", cid),
        _ = tx.closed() => debug!("Peer stream for {} dropped", cid),
    }
}

async fn exchange(node: &OverlayNode, peer: PeerId) -> Option<PeerInfo> {
    match peer_info::request(node, peer).await {
        Ok(mut info) => {
            info.observe_addresses(&node.addresses_of(&peer));
            debug!(%peer, node_id = %info.node_id, "Received peer info");
            Some(info)
        }
        Err(e) => {
            warn!(%peer, "Peer info exchange failed: {}", e);
            None
        }
    }
}
