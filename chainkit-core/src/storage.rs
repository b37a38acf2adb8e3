//! RocksDB-backed persistent block storage
//!
//! CID-indexed store for the blocks of published bundles. Blocks are
//! verified against their CID on the way in, so anything read back out is
//! known-good.

use cid::Cid;
use rocksdb::{Options, DB};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::content_id::{block_cid, verify_block, CidError};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("CID verification failed: {0}")]
    VerificationFailed(#[from] CidError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rocksdb::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Block store closed")]
    Closed,
}

/// A block with its CID and data
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    /// Create a new block from data, computing its CID under `codec`
    pub fn new(codec: u64, data: Vec<u8>) -> Result<Self, CidError> {
        let cid = block_cid(codec, &data)?;
        Ok(Self { cid, data })
    }

    /// Create a block from data and verify it matches the expected CID
    pub fn from_cid_and_data(cid: Cid, data: Vec<u8>) -> Result<Self, CidError> {
        verify_block(&data, &cid)?;
        Ok(Self { cid, data })
    }
}

/// RocksDB-backed persistent block storage with CID-based indexing
pub struct BlockStore {
    db: Arc<DB>,
}

impl BlockStore {
    /// Open (or create) a block store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Point lookups (CID -> block) dominate
        opts.optimize_for_point_lookup(64);

        // Images are usually compressed already
        opts.set_compression_type(rocksdb::DBCompressionType::None);

        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(2);

        let db = DB::open(&opts, path.as_ref())?;

        info!("Opened block store at {:?}", path.as_ref());
        Ok(Self { db: Arc::new(db) })
    }

    /// Store a block, verifying its CID. Storing an existing block is a no-op.
    pub async fn put(&self, block: Block) -> Result<(), StorageError> {
        verify_block(&block.data, &block.cid)?;

        let db = Arc::clone(&self.db);
        let key = block.cid.to_bytes();
        let size = block.data.len();
        let cid = block.cid;

        let inserted = tokio::task::spawn_blocking(move || {
            if db.get_pinned(&key)?.is_some() {
                return Ok::<bool, StorageError>(false);
            }
            db.put(&key, &block.data)?;
            Ok(true)
        })
        .await
        .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??;

        if inserted {
            debug!("Stored block {}, size: {} bytes", cid, size);
        }
        Ok(())
    }

    /// Store raw data under `codec`, returning its CID
    pub async fn put_data(&self, codec: u64, data: Vec<u8>) -> Result<Cid, StorageError> {
        let block = Block::new(codec, data)?;
        let cid = block.cid;
        self.put(block).await?;
        Ok(cid)
    }

    /// Retrieve a block by CID
    pub async fn get(&self, cid: &Cid) -> Result<Block, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        let data = tokio::task::spawn_blocking(move || db.get(&key))
            .await
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??
            .ok_or_else(|| StorageError::BlockNotFound(cid.to_string()))?;

        Ok(Block { cid: *cid, data })
    }

    /// Retrieve a block, mapping "not found" to `None`
    pub async fn try_get(&self, cid: &Cid) -> Result<Option<Block>, StorageError> {
        match self.get(cid).await {
            Ok(block) => Ok(Some(block)),
            Err(StorageError::BlockNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check if a block exists
    pub async fn has(&self, cid: &Cid) -> Result<bool, StorageError> {
        let db = Arc::clone(&self.db);
        let key = cid.to_bytes();

        let found = tokio::task::spawn_blocking(move || db.get_pinned(&key).map(|v| v.is_some()))
            .await
            .map_err(|e| StorageError::IoError(std::io::Error::other(e.to_string())))??;
        Ok(found)
    }
}
