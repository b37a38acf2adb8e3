//! Block exchange protocol
//!
//! Protocol ID: /chainkit/blockexc/0.1.0
//!
//! One request names one block by CID; the response carries the block bytes
//! (base64 in JSON) or `null` when the peer does not have it.

use base64::Engine;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::StreamProtocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PROTOCOL_ID: StreamProtocol = StreamProtocol::new("/chainkit/blockexc/0.1.0");

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type BlockExcBehaviour = request_response::json::Behaviour<BlockRequest, BlockResponse>;
pub type BlockExcEvent = request_response::Event<BlockRequest, BlockResponse>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub cid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    pub data: Option<String>,
}

impl BlockResponse {
    pub fn found(data: &[u8]) -> Self {
        Self {
            data: Some(base64::engine::general_purpose::STANDARD.encode(data)),
        }
    }

    pub fn missing() -> Self {
        Self { data: None }
    }

    /// Decode the carried block, if any
    pub fn into_data(self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.data
            .map(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded))
            .transpose()
    }
}

pub fn behaviour() -> BlockExcBehaviour {
    request_response::json::Behaviour::new(
        [(PROTOCOL_ID, ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(REQUEST_TIMEOUT),
    )
}
