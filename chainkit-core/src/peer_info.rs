//! Peer info exchange protocol
//!
//! Protocol ID: /chainkit/0.1.0
//!
//! The announcing side writes exactly one JSON object as soon as it accepts
//! a stream and then closes it. The requesting side sends nothing: opening
//! the stream is the request. Any incompatible change to the record gets a
//! new protocol ID rather than a negotiated format.

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::node::{NodeError, OverlayNode};

pub const PROTOCOL: StreamProtocol = StreamProtocol::new("/chainkit/0.1.0");

/// Upper bound on a single encoded record
const MAX_PEER_INFO_SIZE: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum PeerExchangeError {
    #[error("Failed to open stream: {0}")]
    Open(#[from] NodeError),

    #[error("Stream IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode peer info: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode peer info: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Consensus-layer endpoint of a running network node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub ips: Vec<String>,
    pub tendermint_p2p_port: u16,
}

// Writers that encode an empty list as `null` are still accepted
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl PeerInfo {
    pub fn new(node_id: impl Into<String>, tendermint_p2p_port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            ips: Vec::new(),
            tendermint_p2p_port,
        }
    }

    /// Append the IPv4 addresses found in `addrs`, skipping ones already listed
    pub fn observe_addresses<'a>(&mut self, addrs: impl IntoIterator<Item = &'a Multiaddr>) {
        for addr in addrs {
            for proto in addr.iter() {
                if let Protocol::Ip4(ip) = proto {
                    let ip = ip.to_string();
                    if !self.ips.contains(&ip) {
                        self.ips.push(ip);
                    }
                }
            }
        }
    }
}

/// Write one record and close the writer
pub async fn write_peer_info<W>(mut writer: W, info: &PeerInfo) -> Result<(), PeerExchangeError>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(info).map_err(PeerExchangeError::Encode)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.close().await?;
    Ok(())
}

/// Read one record until the writer closes
pub async fn read_peer_info<R>(reader: R) -> Result<PeerInfo, PeerExchangeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader.take(MAX_PEER_INFO_SIZE).read_to_end(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(PeerExchangeError::Decode)
}

/// Ask `peer` for its record
pub async fn request(node: &OverlayNode, peer: PeerId) -> Result<PeerInfo, PeerExchangeError> {
    let stream = node.open_stream(peer, PROTOCOL).await?;
    read_peer_info(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[test]
    fn test_wire_shape() {
        let info = PeerInfo {
            node_id: "a1b2".to_string(),
            ips: vec!["10.0.0.1".to_string()],
            tendermint_p2p_port: 26656,
        };
        let json: serde_json::Value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "node_id": "a1b2",
                "ips": ["10.0.0.1"],
                "tendermint_p2p_port": 26656
            })
        );
    }

    #[test]
    fn test_null_or_missing_ips() {
        let info: PeerInfo =
            serde_json::from_str(r#"{"node_id":"n","ips":null,"tendermint_p2p_port":1}"#).unwrap();
        assert!(info.ips.is_empty());

        let info: PeerInfo =
            serde_json::from_str(r#"{"node_id":"n","tendermint_p2p_port":1}"#).unwrap();
        assert!(info.ips.is_empty());
    }

    #[test]
    fn test_observe_addresses_keeps_ipv4_only() {
        let mut info = PeerInfo::new("n", 26656);
        info.ips.push("192.168.1.5".to_string());

        let addrs: Vec<Multiaddr> = vec![
            "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
            "/ip6/::1/tcp/4001".parse().unwrap(),
            "/ip4/192.168.1.5/tcp/4001".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/5001".parse().unwrap(),
            "/dns4/example.com/tcp/4001".parse().unwrap(),
        ];
        info.observe_addresses(&addrs);

        assert_eq!(info.ips, vec!["192.168.1.5", "127.0.0.1"]);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let info = PeerInfo {
            node_id: "f00d".to_string(),
            ips: vec![],
            tendermint_p2p_port: 26656,
        };

        let mut wire = Vec::new();
        write_peer_info(&mut wire, &info).await.unwrap();
        assert_eq!(wire.last(), Some(&b'\n'));

        let decoded = read_peer_info(Cursor::new(wire)).await.unwrap();
        assert_eq!(decoded, info);
    }

    #[tokio::test]
    async fn test_malformed_reply() {
        let result = read_peer_info(Cursor::new(b"{\"node_id\": 42".to_vec())).await;
        assert!(matches!(result, Err(PeerExchangeError::Decode(_))));

        let result = read_peer_info(Cursor::new(Vec::new())).await;
        assert!(matches!(result, Err(PeerExchangeError::Decode(_))));
    }

    #[tokio::test]
    async fn test_oversized_reply_is_rejected() {
        let mut huge = b"{\"node_id\":\"".to_vec();
        huge.extend(std::iter::repeat(b'a').take(MAX_PEER_INFO_SIZE as usize));
        huge.extend(b"\",\"tendermint_p2p_port\":1}");

        let result = read_peer_info(Cursor::new(huge)).await;
        assert!(matches!(result, Err(PeerExchangeError::Decode(_))));
    }
}
