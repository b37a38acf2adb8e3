//! Content identifiers for published network bundles
//!
//! Every block is named by a CIDv1 over its sha2-256 digest. Chunks of
//! artifact bytes use the raw codec; the structural blocks (artifact index
//! and bundle root) are JSON and use the dag-json codec.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// sha2-256 multihash code
/// See: https://github.com/multiformats/multicodec/blob/master/table.csv
const SHA2_256_CODE: u64 = 0x12;

/// Codec for raw artifact chunks
pub const RAW_CODEC: u64 = 0x55;

/// Codec for JSON structural blocks
pub const DAG_JSON_CODEC: u64 = 0x0129;

#[derive(Debug, Error)]
pub enum CidError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// Compute the sha2-256 digest of data
pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Compute the CID of a block with the given codec
pub fn block_cid(codec: u64, data: &[u8]) -> Result<Cid, CidError> {
    let digest = sha256_digest(data);
    let mh = Multihash::<64>::wrap(SHA2_256_CODE, &digest)
        .map_err(|e| CidError::Multihash(format!("Failed to create multihash: {}", e)))?;
    Ok(Cid::new_v1(codec, mh))
}

/// Check that data hashes to the given CID (codec taken from the CID itself)
pub fn verify_block(data: &[u8], cid: &Cid) -> Result<(), CidError> {
    let computed = block_cid(cid.codec(), data)?;
    if &computed != cid {
        return Err(CidError::HashMismatch {
            expected: cid.to_string(),
            actual: computed.to_string(),
        });
    }
    Ok(())
}

/// Parse a network identifier into the CID of its bundle root
pub fn parse_network_id(network_id: &str) -> Result<Cid, CidError> {
    network_id
        .trim()
        .parse::<Cid>()
        .map_err(|e| CidError::InvalidCid(format!("{}: {}", network_id, e)))
}

/// DHT key under which providers of a CID are registered (the multihash bytes)
pub fn provider_key(cid: &Cid) -> Vec<u8> {
    cid.hash().to_bytes()
}
