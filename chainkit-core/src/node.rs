//! Overlay node: a libp2p swarm driven by a single event-loop task
//!
//! [`OverlayNode`] is a cheap, cloneable handle. Every operation that needs
//! the swarm is sent to the event loop as a [`Command`] and answered over a
//! oneshot channel. Raw application streams go through the
//! `libp2p-stream` control directly and never touch the loop.

use cid::Cid;
use futures::{Stream, StreamExt};
use libp2p::identity::Keypair;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, DialError, SwarmEvent};
use libp2p::{identify, kad, Multiaddr, PeerId, StreamProtocol, Swarm};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::blockexc::{BlockExcEvent, BlockRequest, BlockResponse};
use crate::content_id::provider_key;
use crate::p2p::{create_swarm, Behaviour, BehaviourEvent, P2PError, KAD_PROTOCOL};
use crate::storage::{BlockStore, StorageError};

/// How long `spawn` waits for the first listener to come up
const ONLINE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid peer address {0}: missing /p2p/<peer id>")]
    InvalidAddress(String),

    #[error("Dial error: {0}")]
    Dial(String),

    #[error("Provide failed: {0}")]
    Provide(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Protocol handler already registered: {0}")]
    HandlerExists(String),

    #[error("Block exchange error: {0}")]
    BlockExchange(String),

    #[error("Node is shut down")]
    Shutdown,
}

impl From<P2PError> for NodeError {
    fn from(e: P2PError) -> Self {
        NodeError::Transport(e.to_string())
    }
}

type Reply<T> = oneshot::Sender<Result<T, NodeError>>;

enum Command {
    Dial {
        addr: Multiaddr,
        reply: Reply<PeerId>,
    },
    Bootstrap,
    Provide {
        key: kad::RecordKey,
        reply: Reply<()>,
    },
    FindProviders {
        key: kad::RecordKey,
        limit: usize,
        tx: mpsc::UnboundedSender<PeerId>,
        reply: oneshot::Sender<kad::QueryId>,
    },
    FinishQuery(kad::QueryId),
    RequestBlock {
        peer: PeerId,
        cid: Cid,
        reply: Reply<Option<Vec<u8>>>,
    },
    RespondBlock {
        channel: ResponseChannel<BlockResponse>,
        response: BlockResponse,
    },
    Shutdown,
}

/// State shared by the event loop and handles
struct Shared {
    listen_addrs: RwLock<Vec<Multiaddr>>,
    address_book: RwLock<HashMap<PeerId, Vec<Multiaddr>>>,
    /// Emptied on shutdown, which closes the database once in-flight reads finish
    store: RwLock<Option<Arc<BlockStore>>>,
}

impl Shared {
    fn new(store: Arc<BlockStore>) -> Self {
        Self {
            listen_addrs: RwLock::default(),
            address_book: RwLock::default(),
            store: RwLock::new(Some(store)),
        }
    }

    fn store(&self) -> Option<Arc<BlockStore>> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn release_store(&self) {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn record_address(&self, peer: PeerId, addr: Multiaddr) {
        let mut book = self
            .address_book
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let known = book.entry(peer).or_default();
        if !known.contains(&addr) {
            trace!(%peer, %addr, "Observed peer address");
            known.push(addr);
        }
    }
}

struct Inner {
    peer_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
    control: libp2p_stream::Control,
    shared: Arc<Shared>,
    handlers: Mutex<HashMap<StreamProtocol, JoinHandle<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn shutdown(&self) {
        self.shared.release_store();
        if let Ok(mut handlers) = self.handlers.try_lock() {
            for (_, handler) in handlers.drain() {
                handler.abort();
            }
        }
        let _ = self.commands.send(Command::Shutdown);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a running overlay node
#[derive(Clone)]
pub struct OverlayNode {
    inner: Arc<Inner>,
}

impl OverlayNode {
    /// Build the swarm, start listening and spawn the event loop.
    ///
    /// Returns once at least one listener is up. Listen addresses that fail
    /// to bind are logged and skipped; if none binds the node is not started.
    pub async fn spawn(
        keypair: Keypair,
        store: Arc<BlockStore>,
        listen_addrs: &[Multiaddr],
    ) -> Result<Self, NodeError> {
        let mut swarm = create_swarm(keypair)?;
        let peer_id = *swarm.local_peer_id();

        let mut listening = 0;
        for addr in listen_addrs {
            match swarm.listen_on(addr.clone()) {
                Ok(_) => listening += 1,
                Err(e) => warn!("Failed to listen on {}: {}", addr, e),
            }
        }
        if listening == 0 {
            return Err(NodeError::Transport(
                "no listen address could be bound".to_string(),
            ));
        }

        let control = swarm.behaviour().streams.new_control();
        let shared = Arc::new(Shared::new(store));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (online_tx, online_rx) = oneshot::channel();

        let event_loop = EventLoop {
            swarm,
            commands: commands_rx,
            commands_tx: commands_tx.downgrade(),
            shared: Arc::clone(&shared),
            online: Some(online_tx),
            pending_dials: HashMap::new(),
            pending_provides: HashMap::new(),
            provider_queries: HashMap::new(),
            pending_blocks: HashMap::new(),
        };
        let task = tokio::spawn(event_loop.run());

        match tokio::time::timeout(ONLINE_TIMEOUT, online_rx).await {
            Ok(Ok(())) => {}
            _ => {
                task.abort();
                return Err(NodeError::Transport("node did not come online".to_string()));
            }
        }

        info!("Overlay node {} online", peer_id);

        Ok(Self {
            inner: Arc::new(Inner {
                peer_id,
                commands: commands_tx,
                control,
                shared,
                handlers: Mutex::new(HashMap::new()),
                task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// The block store, until the node is shut down
    pub fn store(&self) -> Result<Arc<BlockStore>, StorageError> {
        self.inner.shared.store().ok_or(StorageError::Closed)
    }

    /// Addresses the node is currently listening on
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.inner
            .shared
            .listen_addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Addresses observed for `peer` so far
    pub fn addresses_of(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.inner
            .shared
            .address_book
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    fn send(&self, command: Command) -> Result<(), NodeError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| NodeError::Shutdown)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| NodeError::Shutdown)?
    }

    /// Connect to a peer given a full `/…/p2p/<peer id>` address
    pub async fn connect(&self, addr: Multiaddr) -> Result<PeerId, NodeError> {
        self.call(|reply| Command::Dial { addr, reply }).await
    }

    /// Kick off a Kademlia bootstrap query
    pub fn bootstrap_dht(&self) -> Result<(), NodeError> {
        self.send(Command::Bootstrap)
    }

    /// Announce to the DHT that this node provides `cid`
    pub async fn provide(&self, cid: &Cid) -> Result<(), NodeError> {
        let key = kad::RecordKey::new(&provider_key(cid));
        self.call(|reply| Command::Provide { key, reply }).await
    }

    /// Start a provider search for `cid`, yielding at most `limit` distinct peers
    pub async fn find_providers(&self, cid: &Cid, limit: usize) -> Result<ProviderStream, NodeError> {
        let key = kad::RecordKey::new(&provider_key(cid));
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply, id_rx) = oneshot::channel();
        self.send(Command::FindProviders {
            key,
            limit,
            tx,
            reply,
        })?;
        let query = id_rx.await.map_err(|_| NodeError::Shutdown)?;

        Ok(ProviderStream {
            rx,
            query,
            commands: self.inner.commands.clone(),
        })
    }

    /// Fetch one block from `peer`. `Ok(None)` means the peer does not have it.
    pub async fn request_block(&self, peer: PeerId, cid: Cid) -> Result<Option<Vec<u8>>, NodeError> {
        self.call(|reply| Command::RequestBlock { peer, cid, reply })
            .await
    }

    /// Open a raw stream to `peer`, dialing it if needed
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
    ) -> Result<libp2p::Stream, NodeError> {
        self.inner
            .control
            .clone()
            .open_stream(peer, protocol)
            .await
            .map_err(|e| NodeError::Stream(e.to_string()))
    }

    /// Serve inbound streams for `protocol`, one spawned task per stream
    pub async fn set_stream_handler<F, Fut>(
        &self,
        protocol: StreamProtocol,
        handler: F,
    ) -> Result<(), NodeError>
    where
        F: Fn(PeerId, libp2p::Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut handlers = self.inner.handlers.lock().await;
        if handlers.contains_key(&protocol) {
            return Err(NodeError::HandlerExists(protocol.to_string()));
        }

        let mut incoming = self
            .inner
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|_| NodeError::HandlerExists(protocol.to_string()))?;

        let name = protocol.clone();
        let task = tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                debug!(%peer, protocol = %name, "Inbound stream");
                tokio::spawn(handler(peer, stream));
            }
            debug!(protocol = %name, "Stream handler finished");
        });
        handlers.insert(protocol, task);
        Ok(())
    }

    /// Release the block store, stop stream handlers and tell the event loop
    /// to exit without waiting for it. Clones of this handle that outlive the
    /// call get `Shutdown`/`Closed` errors.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Shut down and wait for the event loop to exit
    pub async fn close(&self) {
        for (_, handler) in self.inner.handlers.lock().await.drain() {
            handler.abort();
        }
        self.inner.shutdown();

        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("Overlay node {} closed", self.inner.peer_id);
    }
}

/// Providers found by a DHT search. Dropping it finishes the query.
pub struct ProviderStream {
    rx: mpsc::UnboundedReceiver<PeerId>,
    query: kad::QueryId,
    commands: mpsc::UnboundedSender<Command>,
}

impl Stream for ProviderStream {
    type Item = PeerId;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PeerId>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ProviderStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::FinishQuery(self.query));
    }
}

struct ProviderQuery {
    tx: mpsc::UnboundedSender<PeerId>,
    seen: HashSet<PeerId>,
    limit: usize,
}

struct EventLoop {
    swarm: Swarm<Behaviour>,
    commands: mpsc::UnboundedReceiver<Command>,
    // Weak so that dropping every handle ends the loop
    commands_tx: mpsc::WeakUnboundedSender<Command>,
    shared: Arc<Shared>,
    online: Option<oneshot::Sender<()>>,
    pending_dials: HashMap<ConnectionId, Reply<PeerId>>,
    pending_provides: HashMap<kad::QueryId, Reply<()>>,
    provider_queries: HashMap<kad::QueryId, ProviderQuery>,
    pending_blocks: HashMap<OutboundRequestId, Reply<Option<Vec<u8>>>>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        debug!("Event loop for {} stopped", self.swarm.local_peer_id());
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { addr, reply } => self.dial(addr, reply),
            Command::Bootstrap => {
                if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                    debug!("DHT bootstrap skipped: {}", e);
                }
            }
            Command::Provide { key, reply } => {
                match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    Ok(id) => {
                        self.pending_provides.insert(id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NodeError::Provide(e.to_string())));
                    }
                }
            }
            Command::FindProviders {
                key,
                limit,
                tx,
                reply,
            } => {
                let id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.provider_queries.insert(
                    id,
                    ProviderQuery {
                        tx,
                        seen: HashSet::new(),
                        limit,
                    },
                );
                let _ = reply.send(id);
            }
            Command::FinishQuery(id) => {
                if self.provider_queries.remove(&id).is_some() {
                    self.finish_query(id);
                }
            }
            Command::RequestBlock { peer, cid, reply } => {
                let id = self.swarm.behaviour_mut().block_exchange.send_request(
                    &peer,
                    BlockRequest {
                        cid: cid.to_string(),
                    },
                );
                self.pending_blocks.insert(id, reply);
            }
            Command::RespondBlock { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .block_exchange
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("Block requester went away before the response");
                }
            }
            Command::Shutdown => {}
        }
    }

    fn dial(&mut self, addr: Multiaddr, reply: Reply<PeerId>) {
        let Some(Protocol::P2p(peer)) = addr.iter().last() else {
            let _ = reply.send(Err(NodeError::InvalidAddress(addr.to_string())));
            return;
        };

        self.swarm
            .behaviour_mut()
            .kademlia
            .add_address(&peer, addr.clone());

        let opts = DialOpts::peer_id(peer).addresses(vec![addr]).build();
        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(connection_id, reply);
            }
            // Already connected or dialing
            Err(DialError::DialPeerConditionFalse(_)) => {
                let _ = reply.send(Ok(peer));
            }
            Err(e) => {
                let _ = reply.send(Err(NodeError::Dial(e.to_string())));
            }
        }
    }

    fn finish_query(&mut self, id: kad::QueryId) {
        if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
            query.finish();
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                self.shared
                    .listen_addrs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(address);
                if let Some(online) = self.online.take() {
                    let _ = online.send(());
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.shared
                    .listen_addrs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                debug!(
                    "Connected to peer: {} at {}",
                    peer_id,
                    endpoint.get_remote_address()
                );
                self.shared
                    .record_address(peer_id, endpoint.get_remote_address().clone());
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Connection closed with {}: {:?}", peer_id, cause);
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                debug!("Outgoing connection error to {:?}: {}", peer_id, error);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(NodeError::Dial(error.to_string())));
                }
            }
            SwarmEvent::NewExternalAddrOfPeer { peer_id, address } => {
                self.shared.record_address(peer_id, address);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kademlia(event)) => self.handle_kad(event),
            SwarmEvent::Behaviour(BehaviourEvent::Identify(event)) => self.handle_identify(event),
            SwarmEvent::Behaviour(BehaviourEvent::BlockExchange(event)) => {
                self.handle_block_exchange(event)
            }
            SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}
            SwarmEvent::Behaviour(BehaviourEvent::Streams(_)) => {}
            _ => {}
        }
    }

    fn handle_kad(&mut self, event: kad::Event) {
        let (id, result, step) = match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => (id, result, step),
            other => {
                trace!("Kademlia event: {:?}", other);
                return;
            }
        };

        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_provides.remove(&id) {
                    let result = result
                        .map(|_| ())
                        .map_err(|e| NodeError::Provide(e.to_string()));
                    let _ = reply.send(result);
                }
            }
            kad::QueryResult::GetProviders(result) => self.on_providers(id, result, step.last),
            kad::QueryResult::Bootstrap(result) => match result {
                Ok(ok) => debug!("DHT bootstrap step, {} remaining", ok.num_remaining),
                Err(e) => debug!("DHT bootstrap failed: {}", e),
            },
            other => trace!("Query {:?} progressed: {:?}", id, other),
        }
    }

    fn on_providers(&mut self, id: kad::QueryId, result: kad::GetProvidersResult, last: bool) {
        let Some(query) = self.provider_queries.get_mut(&id) else {
            return;
        };

        let mut done = last;
        match result {
            Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                for peer in providers {
                    if query.seen.len() >= query.limit {
                        break;
                    }
                    if query.seen.insert(peer) && query.tx.send(peer).is_err() {
                        // Consumer gone
                        done = true;
                        break;
                    }
                }
                if query.seen.len() >= query.limit {
                    done = true;
                }
            }
            Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
            Err(e) => {
                debug!("Provider search {:?} ended: {}", id, e);
                done = true;
            }
        }

        if done {
            // Dropping the sender ends the consumer's stream
            self.provider_queries.remove(&id);
            if !last {
                self.finish_query(id);
            }
        }
    }

    fn handle_identify(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            let speaks_kad = info.protocols.iter().any(|p| *p == KAD_PROTOCOL);
            for addr in info.listen_addrs {
                if speaks_kad {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                self.shared.record_address(peer_id, addr);
            }
        }
    }

    fn handle_block_exchange(&mut self, event: BlockExcEvent) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.serve_block(peer, request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_blocks.remove(&request_id) {
                        let data = response
                            .into_data()
                            .map_err(|e| NodeError::BlockExchange(e.to_string()));
                        let _ = reply.send(data);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                debug!(%peer, "Block request failed: {}", error);
                if let Some(reply) = self.pending_blocks.remove(&request_id) {
                    let _ = reply.send(Err(NodeError::BlockExchange(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, "Inbound block request failed: {}", error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    /// Answer a block request from the store without blocking the loop
    fn serve_block(
        &mut self,
        peer: PeerId,
        request: BlockRequest,
        channel: ResponseChannel<BlockResponse>,
    ) {
        let Some(store) = self.shared.store() else {
            let _ = self
                .swarm
                .behaviour_mut()
                .block_exchange
                .send_response(channel, BlockResponse::missing());
            return;
        };
        let commands = self.commands_tx.clone();

        tokio::spawn(async move {
            let response = match request.cid.parse::<Cid>() {
                Ok(cid) => match store.try_get(&cid).await {
                    Ok(Some(block)) => {
                        debug!(%peer, "Serving block {}", cid);
                        BlockResponse::found(&block.data)
                    }
                    Ok(None) => BlockResponse::missing(),
                    Err(e) => {
                        warn!("Failed to read block {}: {}", cid, e);
                        BlockResponse::missing()
                    }
                },
                Err(_) => {
                    debug!(%peer, "Malformed CID in block request: {}", request.cid);
                    BlockResponse::missing()
                }
            };
            drop(store);
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::RespondBlock { channel, response });
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::content_id::RAW_CODEC;

    pub(crate) async fn test_node() -> (tempfile::TempDir, OverlayNode) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path().join("blocks")).unwrap());
        let listen: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
        let node = OverlayNode::spawn(Keypair::generate_ed25519(), store, &[listen])
            .await
            .unwrap();
        (dir, node)
    }

    pub(crate) fn dial_address(node: &OverlayNode) -> Multiaddr {
        node.listen_addresses()
            .into_iter()
            .next()
            .expect("node is listening")
            .with(Protocol::P2p(node.peer_id()))
    }

    #[tokio::test]
    async fn test_spawn_reports_listen_address() {
        let (_dir, node) = test_node().await;
        let addrs = node.listen_addresses();
        assert!(!addrs.is_empty());
        assert!(addrs[0].to_string().starts_with("/ip4/127.0.0.1/tcp/"));
        node.close().await;
    }

    #[tokio::test]
    async fn test_spawn_fails_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path().join("blocks")).unwrap());
        let bogus: Multiaddr = "/dns4/example.invalid/udp/1".parse().unwrap();

        let result = OverlayNode::spawn(Keypair::generate_ed25519(), store, &[bogus]).await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
    }

    #[tokio::test]
    async fn test_connect_records_address() {
        let (_da, a) = test_node().await;
        let (_db, b) = test_node().await;

        let peer = b.connect(dial_address(&a)).await.unwrap();
        assert_eq!(peer, a.peer_id());
        assert!(!b.addresses_of(&a.peer_id()).is_empty());

        // Second connect to a connected peer succeeds immediately
        assert_eq!(b.connect(dial_address(&a)).await.unwrap(), a.peer_id());

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_connect_requires_peer_id() {
        let (_dir, node) = test_node().await;
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(matches!(
            node.connect(addr).await,
            Err(NodeError::InvalidAddress(_))
        ));
        node.close().await;
    }

    #[tokio::test]
    async fn test_request_block_between_nodes() {
        let (_da, a) = test_node().await;
        let (_db, b) = test_node().await;

        let cid = a
            .store()
            .unwrap()
            .put_data(RAW_CODEC, b"chunk of image".to_vec())
            .await
            .unwrap();
        b.connect(dial_address(&a)).await.unwrap();

        let data = b.request_block(a.peer_id(), cid).await.unwrap();
        assert_eq!(data, Some(b"chunk of image".to_vec()));

        let absent = crate::content_id::block_cid(RAW_CODEC, b"nobody has this").unwrap();
        assert_eq!(b.request_block(a.peer_id(), absent).await.unwrap(), None);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_stream_handler_registration_is_unique() {
        let (_dir, node) = test_node().await;
        let protocol = StreamProtocol::new("/chainkit/test/0.1.0");

        node.set_stream_handler(protocol.clone(), |_, _| async {})
            .await
            .unwrap();
        assert!(matches!(
            node.set_stream_handler(protocol, |_, _| async {}).await,
            Err(NodeError::HandlerExists(_))
        ));
        node.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_block_store() {
        let (dir, node) = test_node().await;
        let survivor = node.clone();
        node.close().await;

        assert!(matches!(survivor.store(), Err(StorageError::Closed)));
        // RocksDB lock is free again even though a handle is still alive
        BlockStore::open(dir.path().join("blocks")).unwrap();
    }

    #[tokio::test]
    async fn test_dropping_last_handle_releases_store() {
        let (dir, node) = test_node().await;
        drop(node);

        // No close(): dropping the handle alone must free the database
        BlockStore::open(dir.path().join("blocks")).unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let (_dir, node) = test_node().await;
        node.close().await;

        let cid = crate::content_id::block_cid(RAW_CODEC, b"x").unwrap();
        assert!(matches!(node.provide(&cid).await, Err(NodeError::Shutdown)));
    }
}
