//! Configuration management for chainkit
//!
//! Handles CLI argument parsing, config file loading, defaults and the
//! on-disk layout of a project.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::bootstrap::default_bootstrap_peers;
use crate::content_id::parse_network_id;

pub const DEFAULT_LISTEN_PORT: u16 = 4001;
pub const DEFAULT_P2P_PORT: u16 = 26656;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "chainkit")]
#[command(about = "Publish, discover and join blockchain networks", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Discovery node directory (defaults to the project's state/discovery)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// TCP port for the discovery node, 0 for any
    #[arg(long, global = true)]
    pub listen_port: Option<u16>,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Bootstrap node multiaddr (can be specified multiple times)
    #[arg(long, global = true)]
    pub bootstrap_node: Vec<String>,

    /// Directory holding joined networks
    #[arg(long, global = true)]
    pub networks_dir: Option<PathBuf>,

    /// TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Publish a project's network bundle and serve it until interrupted
    Announce {
        /// Project directory containing chainkit.yml and state/
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Consensus node ID handed to joining peers
        #[arg(long)]
        node_id: String,

        /// Consensus P2P port handed to joining peers
        #[arg(long, default_value_t = DEFAULT_P2P_PORT)]
        p2p_port: u16,
    },

    /// Fetch a network's bundle into the networks directory
    Join {
        network_id: String,
    },

    /// List peers serving a network
    Peers {
        network_id: String,
    },
}

/// What the binary was asked to do
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Announce {
        project: PathBuf,
        node_id: String,
        p2p_port: u16,
    },
    Join {
        network_id: String,
    },
    Peers {
        network_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub listen_port: u16,
    pub log_level: String,
    pub bootstrap_nodes: Vec<String>,
    pub networks_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Config {
            data_dir: None,
            listen_port: DEFAULT_LISTEN_PORT,
            log_level: "info".to_string(),
            bootstrap_nodes: default_bootstrap_peers(),
            networks_dir: home.join(".chainkit").join("networks"),
        }
    }
}

impl Config {
    /// Create config from CLI arguments, layered over the config file if given
    pub fn from_cli() -> Result<(Self, Action), ConfigError> {
        Self::from_parsed(Cli::parse())
    }

    pub fn from_parsed(cli: Cli) -> Result<(Self, Action), ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        if let Some(dir) = cli.data_dir {
            config.data_dir = Some(dir);
        }
        if let Some(port) = cli.listen_port {
            config.listen_port = port;
        }
        if let Some(level) = cli.log_level {
            config.log_level = level;
        }
        if let Some(dir) = cli.networks_dir {
            config.networks_dir = dir;
        }
        config.bootstrap_nodes.extend(cli.bootstrap_node);

        let action = match cli.command {
            Commands::Announce {
                project,
                node_id,
                p2p_port,
            } => {
                if node_id.trim().is_empty() {
                    return Err(ConfigError::Invalid("--node-id must not be empty".into()));
                }
                Action::Announce {
                    project,
                    node_id,
                    p2p_port,
                }
            }
            Commands::Join { network_id } => Action::Join { network_id },
            Commands::Peers { network_id } => Action::Peers { network_id },
        };

        Ok((config, action))
    }

    /// Load config from TOML file; missing fields take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Project directory of a joined network. Only valid network ids are
    /// accepted, and the directory is named by their canonical form.
    pub fn network_project(&self, network_id: &str) -> Result<ProjectPaths, ConfigError> {
        let cid = parse_network_id(network_id).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(ProjectPaths::new(self.networks_dir.join(cid.to_string())))
    }

    /// Discovery settings for `project`
    pub fn discovery(&self, project: &ProjectPaths) -> DiscoveryConfig {
        DiscoveryConfig {
            root: self
                .data_dir
                .clone()
                .unwrap_or_else(|| project.discovery_dir()),
            port: self.listen_port,
            bootstrap_peers: self.bootstrap_nodes.clone(),
        }
    }
}

/// Settings handed to a discovery server
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    pub root: PathBuf,
    pub port: u16,
    pub bootstrap_peers: Vec<String>,
}

impl DiscoveryConfig {
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Self {
        Self {
            root: root.into(),
            port,
            bootstrap_peers: default_bootstrap_peers(),
        }
    }

    pub fn with_bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.bootstrap_peers = peers;
        self
    }
}

/// File layout of a project
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectPaths {
    root: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state_dir().join("data")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.state_dir().join("config")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("chainkit.yml")
    }

    pub fn genesis_path(&self) -> PathBuf {
        self.config_dir().join("genesis.json")
    }

    pub fn image_path(&self) -> PathBuf {
        self.state_dir().join("image.tar")
    }

    pub fn discovery_dir(&self) -> PathBuf {
        self.state_dir().join("discovery")
    }
}
