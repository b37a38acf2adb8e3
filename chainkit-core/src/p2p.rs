//! P2P networking layer using rust-libp2p
//!
//! TCP transport with Noise encryption and Yamux multiplexing, carrying
//! Kademlia (provider records), Identify, Ping, the block exchange and raw
//! application streams.

use libp2p::identity::Keypair;
use libp2p::{identify, kad, noise, ping, tcp, yamux, StreamProtocol, Swarm, SwarmBuilder};
use std::time::Duration;
use thiserror::Error;

use crate::blockexc::{self, BlockExcBehaviour};

/// Kademlia protocol shared with the public IPFS DHT
pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/kad/1.0.0");

const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";

const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),
}

#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct Behaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub block_exchange: BlockExcBehaviour,
    pub streams: libp2p_stream::Behaviour,
}

impl Behaviour {
    fn new(keypair: &Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();

        let mut kad_config = kad::Config::new(KAD_PROTOCOL);
        kad_config.set_query_timeout(Duration::from_secs(30));
        let store = kad::store::MemoryStore::new(peer_id);
        let mut kademlia = kad::Behaviour::with_config(peer_id, store, kad_config);
        // Serve provider records even before an external address is confirmed
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), keypair.public())
                .with_agent_version(format!("chainkit/{}", env!("CARGO_PKG_VERSION"))),
        );

        Self {
            kademlia,
            identify,
            ping: ping::Behaviour::new(ping::Config::new()),
            block_exchange: blockexc::behaviour(),
            streams: libp2p_stream::Behaviour::new(),
        }
    }
}

/// Create a swarm for the given identity
pub fn create_swarm(keypair: Keypair) -> Result<Swarm<Behaviour>, P2PError> {
    let behaviour = Behaviour::new(&keypair);

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|_| behaviour)
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    tracing::info!("Local peer ID: {}", swarm.local_peer_id());
    Ok(swarm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::Multiaddr;

    #[tokio::test]
    async fn test_create_swarm_uses_identity() {
        let keypair = Keypair::generate_ed25519();
        let expected = keypair.public().to_peer_id();

        let swarm = create_swarm(keypair).unwrap();
        assert_eq!(*swarm.local_peer_id(), expected);
    }

    #[tokio::test]
    async fn test_swarm_can_listen() {
        let mut swarm = create_swarm(Keypair::generate_ed25519()).unwrap();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/0".parse().unwrap();
        assert!(swarm.listen_on(addr).is_ok());
    }
}
