//! Network bundle publishing and resolution
//!
//! A bundle is three artifacts (`manifest`, `genesis`, `image`) stored as
//! content-addressed blocks:
//!
//! ```text
//! root     dag-json  {"links": {"genesis": cid, "image": cid, "manifest": cid}}
//! artifact dag-json  {"size": n, "chunks": [cid, ...]}
//! chunk    raw       up to CHUNK_SIZE bytes
//! ```
//!
//! The root CID is the network identifier. Resolution reads the local store
//! first and falls back to providers of the root found through the DHT.

use bytes::Bytes;
use cid::Cid;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::content_id::{parse_network_id, DAG_JSON_CODEC, RAW_CODEC};
use crate::node::OverlayNode;
use crate::readiness::Readiness;
use crate::storage::{Block, BlockStore, StorageError};

/// Maximum chunk size for artifact data
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Providers asked for a missing block
pub const PROVIDER_LIMIT: usize = 10;

pub const FIND_PROVIDERS_TIMEOUT: Duration = Duration::from_secs(10);

pub const MANIFEST: &str = "manifest";
pub const GENESIS: &str = "genesis";
pub const IMAGE: &str = "image";

#[derive(Error, Debug)]
pub enum ContentError {
    #[error("Failed to publish {artifact}: {reason}")]
    PublishFailure { artifact: String, reason: String },

    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Invalid network id {0:?}")]
    InvalidNetworkId(String),

    #[error("Malformed {artifact} block: {reason}")]
    Corrupt { artifact: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BundleRoot {
    links: BundleLinks,
}

// Fields in key order so the encoding is stable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct BundleLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    genesis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    manifest: Option<String>,
}

impl BundleLinks {
    fn get(&self, artifact: &str) -> Option<&str> {
        match artifact {
            GENESIS => self.genesis.as_deref(),
            IMAGE => self.image.as_deref(),
            MANIFEST => self.manifest.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ArtifactIndex {
    size: u64,
    chunks: Vec<String>,
}

/// Store the three artifacts and return the network identifier
pub async fn publish(
    store: &BlockStore,
    manifest: &Path,
    genesis: &Path,
    image: &Path,
) -> Result<Cid, ContentError> {
    let manifest = store_artifact(store, MANIFEST, manifest).await?;
    let genesis = store_artifact(store, GENESIS, genesis).await?;
    let image = store_artifact(store, IMAGE, image).await?;

    let root = BundleRoot {
        links: BundleLinks {
            genesis: Some(genesis.to_string()),
            image: Some(image.to_string()),
            manifest: Some(manifest.to_string()),
        },
    };
    let cid = put_json(store, "bundle", &root).await?;

    info!(network_id = %cid, "Published network bundle");
    Ok(cid)
}

async fn store_artifact(store: &BlockStore, artifact: &str, path: &Path) -> Result<Cid, ContentError> {
    let failure = |reason: String| ContentError::PublishFailure {
        artifact: artifact.to_string(),
        reason,
    };

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| failure(format!("{}: {}", path.display(), e)))?;

    let mut index = ArtifactIndex {
        size: 0,
        chunks: Vec::new(),
    };
    loop {
        let mut chunk = Vec::with_capacity(CHUNK_SIZE);
        let n = (&mut file)
            .take(CHUNK_SIZE as u64)
            .read_to_end(&mut chunk)
            .await
            .map_err(|e| failure(format!("{}: {}", path.display(), e)))?;
        if n == 0 {
            break;
        }

        let cid = store
            .put_data(RAW_CODEC, chunk)
            .await
            .map_err(|e| failure(e.to_string()))?;
        index.size += n as u64;
        index.chunks.push(cid.to_string());
    }

    debug!(
        "Stored {} ({} bytes, {} chunks)",
        artifact,
        index.size,
        index.chunks.len()
    );
    put_json(store, artifact, &index).await
}

async fn put_json<T: Serialize>(store: &BlockStore, artifact: &str, value: &T) -> Result<Cid, ContentError> {
    let failure = |reason: String| ContentError::PublishFailure {
        artifact: artifact.to_string(),
        reason,
    };
    let data = serde_json::to_vec(value).map_err(|e| failure(e.to_string()))?;
    store
        .put_data(DAG_JSON_CODEC, data)
        .await
        .map_err(|e| failure(e.to_string()))
}

/// Lazily fetched image bytes
pub type ImageStream = BoxStream<'static, io::Result<Bytes>>;

/// A resolved network bundle
pub struct NetworkInfo {
    pub manifest: Vec<u8>,
    pub genesis: Vec<u8>,
    pub image: ImageStream,
}

impl fmt::Debug for NetworkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkInfo")
            .field("manifest", &format_args!("{} bytes", self.manifest.len()))
            .field("genesis", &format_args!("{} bytes", self.genesis.len()))
            .field("image", &"<stream>")
            .finish()
    }
}

impl NetworkInfo {
    pub async fn write_manifest<W: AsyncWrite + Unpin>(&self, dst: &mut W) -> io::Result<()> {
        dst.write_all(&self.manifest).await?;
        dst.flush().await
    }

    pub async fn write_genesis<W: AsyncWrite + Unpin>(&self, dst: &mut W) -> io::Result<()> {
        dst.write_all(&self.genesis).await?;
        dst.flush().await
    }

    /// Drain the image stream into `dst`, returning the bytes written
    pub async fn write_image<W: AsyncWrite + Unpin>(&mut self, dst: &mut W) -> io::Result<u64> {
        let mut written = 0u64;
        while let Some(chunk) = self.image.next().await {
            let chunk = chunk?;
            dst.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        dst.flush().await?;
        Ok(written)
    }
}

/// Fetches blocks of one bundle, locally or from the bundle's providers
#[derive(Clone)]
struct BlockFetcher {
    node: OverlayNode,
    ready: Readiness,
    root: Cid,
    providers: Arc<OnceCell<Vec<PeerId>>>,
}

impl BlockFetcher {
    async fn fetch(&self, cid: &Cid) -> Result<Option<Vec<u8>>, StorageError> {
        // Store handles are taken per use so a stopped node can close it
        if let Some(block) = self.node.store()?.try_get(cid).await? {
            return Ok(Some(block.data));
        }

        for peer in self.providers().await {
            match self.node.request_block(*peer, *cid).await {
                Ok(Some(data)) => match Block::from_cid_and_data(*cid, data) {
                    Ok(block) => {
                        debug!(%peer, "Fetched block {}", cid);
                        self.node.store()?.put(block.clone()).await?;
                        return Ok(Some(block.data));
                    }
                    Err(e) => warn!(%peer, "Discarding bad block {}: {}", cid, e),
                },
                Ok(None) => debug!(%peer, "Provider does not have {}", cid),
                Err(e) => debug!(%peer, "Block request for {} failed: {}", cid, e),
            }
        }
        Ok(None)
    }

    /// Providers of the root, looked up once per resolution
    async fn providers(&self) -> &[PeerId] {
        self.providers
            .get_or_init(|| async {
                self.ready.wait().await;

                let mut found = Vec::new();
                let mut stream = match self.node.find_providers(&self.root, PROVIDER_LIMIT).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Provider lookup for {} failed: {}", self.root, e);
                        return found;
                    }
                };

                let local = self.node.peer_id();
                let collect = async {
                    while let Some(peer) = stream.next().await {
                        if peer != local {
                            found.push(peer);
                        }
                    }
                };
                if tokio::time::timeout(FIND_PROVIDERS_TIMEOUT, collect).await.is_err() {
                    debug!("Provider lookup for {} timed out", self.root);
                }

                debug!("Found {} providers for {}", found.len(), self.root);
                found
            })
            .await
    }

    async fn fetch_json<T: for<'de> Deserialize<'de>>(
        &self,
        cid: &Cid,
        artifact: &str,
    ) -> Result<T, ContentError> {
        let data = self
            .fetch(cid)
            .await?
            .ok_or_else(|| ContentError::NotFound(artifact.to_string()))?;
        serde_json::from_slice(&data).map_err(|e| ContentError::Corrupt {
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })
    }

    async fn fetch_index(&self, links: &BundleLinks, artifact: &str) -> Result<ArtifactIndex, ContentError> {
        let link = links
            .get(artifact)
            .ok_or_else(|| ContentError::NotFound(artifact.to_string()))?;
        let cid = link.parse::<Cid>().map_err(|e| ContentError::Corrupt {
            artifact: artifact.to_string(),
            reason: e.to_string(),
        })?;
        self.fetch_json(&cid, artifact).await
    }

    fn chunk_cids(index: &ArtifactIndex, artifact: &str) -> Result<Vec<Cid>, ContentError> {
        index
            .chunks
            .iter()
            .map(|c| {
                c.parse::<Cid>().map_err(|e| ContentError::Corrupt {
                    artifact: artifact.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn fetch_artifact(&self, links: &BundleLinks, artifact: &str) -> Result<Vec<u8>, ContentError> {
        let index = self.fetch_index(links, artifact).await?;
        // `size` is untrusted until the chunks add up to it
        let bound = index.chunks.len().saturating_mul(CHUNK_SIZE);
        let mut data = Vec::with_capacity(bound.min(index.size.try_into().unwrap_or(usize::MAX)));
        for cid in Self::chunk_cids(&index, artifact)? {
            let chunk = self
                .fetch(&cid)
                .await?
                .ok_or_else(|| ContentError::NotFound(artifact.to_string()))?;
            data.extend_from_slice(&chunk);
        }

        if data.len() as u64 != index.size {
            return Err(ContentError::Corrupt {
                artifact: artifact.to_string(),
                reason: format!("expected {} bytes, got {}", index.size, data.len()),
            });
        }
        Ok(data)
    }

    fn image_stream(self, chunks: Vec<Cid>) -> ImageStream {
        stream::iter(chunks)
            .then(move |cid| {
                let fetcher = self.clone();
                async move {
                    match fetcher.fetch(&cid).await {
                        Ok(Some(data)) => Ok(Bytes::from(data)),
                        Ok(None) => Err(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("image chunk {} not found", cid),
                        )),
                        Err(e) => Err(io::Error::other(e)),
                    }
                }
            })
            .boxed()
    }
}

/// Turns network identifiers back into bundles
#[derive(Clone)]
pub struct Resolver {
    node: OverlayNode,
    ready: Readiness,
}

impl Resolver {
    pub fn new(node: OverlayNode, ready: Readiness) -> Self {
        Self { node, ready }
    }

    /// Resolve `network_id`. The image chunks are fetched as the stream is read.
    pub async fn resolve(&self, network_id: &str) -> Result<NetworkInfo, ContentError> {
        let root = parse_network_id(network_id)
            .map_err(|_| ContentError::InvalidNetworkId(network_id.to_string()))?;

        let fetcher = BlockFetcher {
            node: self.node.clone(),
            ready: self.ready.clone(),
            root,
            providers: Arc::new(OnceCell::new()),
        };

        let bundle: BundleRoot = fetcher.fetch_json(&root, network_id.trim()).await?;
        let manifest = fetcher.fetch_artifact(&bundle.links, MANIFEST).await?;
        let genesis = fetcher.fetch_artifact(&bundle.links, GENESIS).await?;

        let image_index = fetcher.fetch_index(&bundle.links, IMAGE).await?;
        let chunks = BlockFetcher::chunk_cids(&image_index, IMAGE)?;

        info!(
            network_id = %root,
            image_size = image_index.size,
            "Resolved network bundle"
        );
        Ok(NetworkInfo {
            manifest,
            genesis,
            image: fetcher.image_stream(chunks),
        })
    }
}
