//! Chainkit Core
//!
//! Peer discovery and network bundle distribution for chainkit: a libp2p
//! overlay node, content-addressed bundle storage, DHT announce/find and the
//! peer info exchange, tied together by [`DiscoveryServer`].

pub mod blockexc;
pub mod bootstrap;
pub mod config;
pub mod content;
pub mod content_id;
pub mod node;
pub mod p2p;
pub mod peer_info;
pub mod providers;
pub mod readiness;
pub mod repo;
pub mod server;
pub mod storage;

pub use bootstrap::{BootstrapConnector, BootstrapError, DEFAULT_BOOTSTRAP_PEERS};
pub use config::{Action, Config, ConfigError, DiscoveryConfig, ProjectPaths};
pub use content::{ContentError, ImageStream, NetworkInfo, Resolver};
pub use content_id::CidError;
pub use node::{NodeError, OverlayNode, ProviderStream};
pub use p2p::{create_swarm, Behaviour, P2PError};
pub use peer_info::{PeerExchangeError, PeerInfo};
pub use providers::{PeerStream, ProviderError, ProviderRegistry};
pub use readiness::Readiness;
pub use repo::{Repo, RepoError};
pub use server::{DiscoveryError, DiscoveryServer};
pub use storage::{Block, BlockStore, StorageError};

// Re-export Cid for external use
pub use cid::Cid;
