//! Discovery server
//!
//! Owns the node lifecycle: repository lock, block store, overlay node and
//! bootstrap task. Everything else is delegated to the content resolver and
//! the provider registry once the server is online.

use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bootstrap::BootstrapConnector;
use crate::config::DiscoveryConfig;
use crate::content::{self, ContentError, NetworkInfo, Resolver};
use crate::node::OverlayNode;
use crate::peer_info::PeerInfo;
use crate::providers::{PeerStream, ProviderError, ProviderRegistry};
use crate::readiness::Readiness;
use crate::repo::{self, Repo};
use crate::storage::BlockStore;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery node already running at {0:?}")]
    AlreadyRunning(PathBuf),

    #[error("Failed to initialize discovery node: {0}")]
    Initialization(String),

    #[error("Discovery node not started")]
    NotStarted,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Content(#[from] ContentError),
}

fn init_err(e: impl std::fmt::Display) -> DiscoveryError {
    DiscoveryError::Initialization(e.to_string())
}

struct Online {
    // Held for the lock; released on drop
    _repo: Repo,
    node: OverlayNode,
    ready: Readiness,
    registry: ProviderRegistry,
    resolver: Resolver,
    bootstrap: JoinHandle<()>,
}

pub struct DiscoveryServer {
    config: DiscoveryConfig,
    online: Option<Online>,
}

impl DiscoveryServer {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            online: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn is_running(&self) -> bool {
        self.online.is_some()
    }

    /// Bring the node online. Returns once it is listening; bootstrap
    /// continues in the background.
    pub async fn start(&mut self) -> Result<(), DiscoveryError> {
        let root = self.config.root.clone();
        if self.online.is_some() || repo::locked_by_other_process(&root).map_err(init_err)? {
            return Err(DiscoveryError::AlreadyRunning(root));
        }

        let plugins = repo::load_plugins(&root).map_err(init_err)?;
        let mut bootstrap_peers = self.config.bootstrap_peers.clone();
        for plugin in &plugins {
            info!(plugin = %plugin.name, "Loaded plugin");
            bootstrap_peers.extend(plugin.bootstrap.iter().cloned());
        }

        if !repo::is_initialized(&root) {
            repo::init(&root).map_err(init_err)?;
        }
        let mut repo = Repo::open(&root).map_err(|e| match e {
            repo::RepoError::Locked(path) => DiscoveryError::AlreadyRunning(path),
            other => init_err(other),
        })?;

        let port = self.config.port;
        let listen = vec![
            format!("/ip4/0.0.0.0/tcp/{port}"),
            format!("/ip6/::/tcp/{port}"),
        ];
        repo.set_swarm_addresses(&listen).map_err(init_err)?;
        let listen_addrs = listen
            .iter()
            .map(|a| a.parse::<Multiaddr>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(init_err)?;

        let keypair = repo.keypair().map_err(init_err)?;
        let store = Arc::new(BlockStore::open(repo.blocks_dir()).map_err(init_err)?);
        let node = OverlayNode::spawn(keypair, store, &listen_addrs)
            .await
            .map_err(init_err)?;

        let ready = Readiness::new();
        let bootstrap = BootstrapConnector::new(bootstrap_peers).spawn(node.clone(), ready.clone());

        info!(
            peer_id = %node.peer_id(),
            "Discovery node started at {:?}", root
        );
        self.online = Some(Online {
            _repo: repo,
            registry: ProviderRegistry::new(node.clone(), ready.clone()),
            resolver: Resolver::new(node.clone(), ready.clone()),
            node,
            ready,
            bootstrap,
        });
        Ok(())
    }

    /// Shut the node down and release the repository.
    ///
    /// Values handed out earlier (a `NetworkInfo` image stream, a
    /// `PeerStream`) do not keep the repository open; reading from them
    /// afterwards yields errors.
    pub async fn stop(&mut self) -> Result<(), DiscoveryError> {
        let mut online = self.online.take().ok_or(DiscoveryError::NotStarted)?;

        // Wait for the task to drop its node handle
        online.bootstrap.abort();
        let _ = (&mut online.bootstrap).await;
        online.node.close().await;
        info!("Discovery node at {:?} stopped", self.config.root);
        Ok(())
    }

    fn online(&self) -> Result<&Online, DiscoveryError> {
        self.online.as_ref().ok_or(DiscoveryError::NotStarted)
    }

    pub fn peer_id(&self) -> Result<PeerId, DiscoveryError> {
        Ok(self.online()?.node.peer_id())
    }

    pub fn listen_addresses(&self) -> Result<Vec<Multiaddr>, DiscoveryError> {
        Ok(self.online()?.node.listen_addresses())
    }

    /// Wait until bootstrap has finished
    pub async fn wait_ready(&self) -> Result<(), DiscoveryError> {
        self.online()?.ready.wait().await;
        Ok(())
    }

    /// Store a network bundle locally, returning its network identifier
    pub async fn publish(
        &self,
        manifest: &Path,
        genesis: &Path,
        image: &Path,
    ) -> Result<Cid, DiscoveryError> {
        let online = self.online()?;
        let store = online.node.store().map_err(ContentError::from)?;
        Ok(content::publish(&store, manifest, genesis, image).await?)
    }

    /// Advertise `network_id` and serve `info` to peers that ask
    pub async fn announce(&self, network_id: &str, info: PeerInfo) -> Result<(), DiscoveryError> {
        Ok(self.online()?.registry.announce(network_id, info).await?)
    }

    /// Fetch the bundle of `network_id`
    pub async fn join(&self, network_id: &str) -> Result<NetworkInfo, DiscoveryError> {
        Ok(self.online()?.resolver.resolve(network_id).await?)
    }

    /// Stream the peer info of nodes serving `network_id`
    pub async fn peers(&self, network_id: &str) -> Result<PeerStream, DiscoveryError> {
        Ok(self.online()?.registry.find_peers(network_id).await?)
    }
}

impl Drop for DiscoveryServer {
    fn drop(&mut self) {
        if let Some(online) = self.online.take() {
            warn!("Discovery server dropped while running, shutting down");
            online.bootstrap.abort();
            online.node.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &Path) -> DiscoveryConfig {
        DiscoveryConfig {
            root: root.to_path_buf(),
            port: 0,
            bootstrap_peers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = DiscoveryServer::new(config(dir.path()));

        assert!(matches!(server.peer_id(), Err(DiscoveryError::NotStarted)));
        assert!(matches!(
            server.join("anything").await,
            Err(DiscoveryError::NotStarted)
        ));
        assert!(matches!(server.stop().await, Err(DiscoveryError::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_stop_restart_keeps_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = DiscoveryServer::new(config(dir.path()));

        server.start().await.unwrap();
        let first = server.peer_id().unwrap();
        assert!(matches!(
            server.start().await,
            Err(DiscoveryError::AlreadyRunning(_))
        ));
        server.wait_ready().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());

        server.start().await.unwrap();
        assert_eq!(server.peer_id().unwrap(), first);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_without_stop_frees_root() {
        let dir = tempfile::tempdir().unwrap();

        let mut server = DiscoveryServer::new(config(dir.path()));
        server.start().await.unwrap();
        drop(server);

        let mut server = DiscoveryServer::new(config(dir.path()));
        server.start().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_plugins_extend_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::write(
            plugins.join("lan.toml"),
            "name = \"lan\"\nbootstrap = [\"not-an-address\"]\n",
        )
        .unwrap();

        let mut server = DiscoveryServer::new(config(dir.path()));
        server.start().await.unwrap();
        // The bad plugin entry is only a warning
        server.wait_ready().await.unwrap();
        server.stop().await.unwrap();
    }
}
