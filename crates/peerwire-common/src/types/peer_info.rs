//! Peer metadata handed to the metering layer once the protocol handshake
//! completes.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::node_id::NodeId;

/// Which side initiated the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Accepted from a remote dialer
    Inbound,
    /// Dialed by the local node
    Outbound,
}

impl Direction {
    pub fn is_inbound(&self) -> bool {
        matches!(self, Direction::Inbound)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Network-level facts about a connected peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Local endpoint of the connection
    pub local_address: Option<SocketAddr>,
    /// Remote endpoint of the connection
    pub remote_address: SocketAddr,
    /// Whether the remote side dialed us
    pub inbound: bool,
    /// Whether the peer is on the trusted list
    pub trusted: bool,
    /// Whether the peer was configured statically
    #[serde(rename = "static")]
    pub static_node: bool,
}

/// Human-readable metadata about a connected peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Unique node identifier
    pub id: NodeId,
    /// Client name, including type, version, OS and custom data
    pub name: String,
    /// Canonical node descriptor (node URL)
    pub enode: String,
    /// Capabilities advertised during the protocol handshake
    pub caps: Vec<String>,
    /// Network endpoints and flags
    pub network: NetworkInfo,
    /// Sub-protocol specific metadata, opaque to the metering layer
    #[serde(default)]
    pub protocols: HashMap<String, serde_json::Value>,
}

impl PeerInfo {
    /// Create peer info with the required fields; flags default to false
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        remote_address: SocketAddr,
        direction: Direction,
    ) -> Self {
        let enode = format!("enode://{}@{}", id, remote_address);
        Self {
            id,
            name: name.into(),
            enode,
            caps: Vec::new(),
            network: NetworkInfo {
                local_address: None,
                remote_address,
                inbound: direction.is_inbound(),
                trusted: false,
                static_node: false,
            },
            protocols: HashMap::new(),
        }
    }

    /// Set advertised capabilities
    pub fn with_caps(mut self, caps: Vec<String>) -> Self {
        self.caps = caps;
        self
    }

    /// Set the local endpoint
    pub fn with_local_address(mut self, addr: SocketAddr) -> Self {
        self.network.local_address = Some(addr);
        self
    }

    /// Attach metadata for one sub-protocol
    pub fn with_protocol(mut self, name: impl Into<String>, meta: serde_json::Value) -> Self {
        self.protocols.insert(name.into(), meta);
        self
    }
}
