//! On-disk node repository
//!
//! Layout of a discovery root:
//!
//! ```text
//! <root>/config      JSON identity and swarm addresses
//! <root>/repo.lock   advisory lock held while a node is running
//! <root>/blocks/     RocksDB block store
//! <root>/plugins/    optional *.toml plugin fragments
//! ```

use base64::Engine;
use libp2p::identity::Keypair;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config";
const LOCK_FILE: &str = "repo.lock";
const BLOCKS_DIR: &str = "blocks";
const PLUGINS_DIR: &str = "plugins";

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Another instance is already accessing {0:?}")]
    Locked(PathBuf),

    #[error("Repository at {0:?} is not initialized")]
    NotInitialized(PathBuf),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid repository config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid identity: {0}")]
    Identity(String),

    #[error("Invalid plugin {path:?}: {source}")]
    Plugin {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

type Result<T> = std::result::Result<T, RepoError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RepoError + '_ {
    move |source| RepoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RepoConfig {
    pub identity: Identity,
    pub addresses: Addresses,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "PeerID")]
    pub peer_id: String,
    /// Base64 of the protobuf-encoded keypair
    #[serde(rename = "PrivKey")]
    pub priv_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Addresses {
    #[serde(default)]
    pub swarm: Vec<String>,
}

/// A plugin fragment from `<root>/plugins/*.toml`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Plugin {
    pub name: String,
    /// Extra bootstrap peers contributed by this plugin
    #[serde(default)]
    pub bootstrap: Vec<String>,
}

/// Whether `root` has been initialized with an identity
pub fn is_initialized(root: &Path) -> bool {
    root.join(CONFIG_FILE).is_file()
}

/// Whether some other holder (process or live repo handle) has the lock
pub fn locked_by_other_process(root: &Path) -> Result<bool> {
    let path = root.join(LOCK_FILE);
    if !path.exists() {
        return Ok(false);
    }

    let file = File::open(&path).map_err(io_err(&path))?;
    match file.try_lock() {
        Ok(()) => Ok(false),
        Err(TryLockError::WouldBlock) => Ok(true),
        Err(TryLockError::Error(e)) => Err(io_err(&path)(e)),
    }
}

/// Create `root` and write a fresh identity into it
pub fn init(root: &Path) -> Result<RepoConfig> {
    fs::create_dir_all(root).map_err(io_err(root))?;

    let keypair = Keypair::generate_ed25519();
    let encoded = keypair
        .to_protobuf_encoding()
        .map_err(|e| RepoError::Identity(e.to_string()))?;

    let config = RepoConfig {
        identity: Identity {
            peer_id: keypair.public().to_peer_id().to_string(),
            priv_key: base64::engine::general_purpose::STANDARD.encode(encoded),
        },
        addresses: Addresses::default(),
    };
    write_config(root, &config)?;

    info!(
        peer_id = %config.identity.peer_id,
        "Initialized node repository at {:?}", root
    );
    Ok(config)
}

/// Load plugin fragments, sorted by file name. A missing directory is fine.
pub fn load_plugins(root: &Path) -> Result<Vec<Plugin>> {
    let dir = root.join(PLUGINS_DIR);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
        .map_err(io_err(&dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut plugins = Vec::with_capacity(paths.len());
    for path in paths {
        let content = fs::read_to_string(&path).map_err(io_err(&path))?;
        let plugin: Plugin = toml::from_str(&content).map_err(|source| RepoError::Plugin {
            path: path.clone(),
            source,
        })?;
        debug!(plugin = %plugin.name, "Loaded plugin from {:?}", path);
        plugins.push(plugin);
    }

    Ok(plugins)
}

fn write_config(root: &Path, config: &RepoConfig) -> Result<()> {
    let path = root.join(CONFIG_FILE);
    let json = serde_json::to_vec_pretty(config)?;
    fs::write(&path, json).map_err(io_err(&path))
}

/// An opened repository. Holds the advisory lock until dropped.
#[derive(Debug)]
pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
    _lock: File,
}

impl Repo {
    /// Open an initialized repository, taking its lock
    pub fn open(root: &Path) -> Result<Self> {
        if !is_initialized(root) {
            return Err(RepoError::NotInitialized(root.to_path_buf()));
        }

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(io_err(&lock_path))?;
        match lock.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(RepoError::Locked(root.to_path_buf())),
            Err(TryLockError::Error(e)) => return Err(io_err(&lock_path)(e)),
        }

        let config_path = root.join(CONFIG_FILE);
        let raw = fs::read(&config_path).map_err(io_err(&config_path))?;
        let config: RepoConfig = serde_json::from_slice(&raw)?;

        Ok(Self {
            root: root.to_path_buf(),
            config,
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.root.join(BLOCKS_DIR)
    }

    /// Decode the node keypair
    pub fn keypair(&self) -> Result<Keypair> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.config.identity.priv_key)
            .map_err(|e| RepoError::Identity(e.to_string()))?;
        Keypair::from_protobuf_encoding(&bytes).map_err(|e| RepoError::Identity(e.to_string()))
    }

    /// Persist the swarm listen addresses
    pub fn set_swarm_addresses(&mut self, addrs: &[String]) -> Result<()> {
        self.config.addresses.swarm = addrs.to_vec();
        write_config(&self.root, &self.config)
    }
}
