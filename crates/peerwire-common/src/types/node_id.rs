//! NodeId - 32-byte identifier a peer proves during the encryption handshake

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of a node identifier in bytes
pub const NODE_ID_LEN: usize = 32;

/// Errors raised while parsing a hex node identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeIdError {
    #[error("Invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Unique node identifier
///
/// Rendered as 64 lowercase hex characters, which is also the form used in
/// per-peer meter keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Wrap raw identifier bytes
    pub const fn new(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build an identifier from a byte slice of exactly [`NODE_ID_LEN`] bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, NodeIdError> {
        let arr: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| NodeIdError::InvalidLength {
            expected: NODE_ID_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Short form for log lines (first 8 hex characters)
    pub fn terminal_string(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.terminal_string())
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| NodeIdError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_full_hex() {
        let id = NodeId::new([0xab; NODE_ID_LEN]);
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert!(s.chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn test_parse_accepts_prefix() {
        let id = NodeId::random();
        let parsed: NodeId = format!("0x{}", id).parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_parse_rejects_short_input() {
        let err = "abcd".parse::<NodeId>().unwrap_err();
        assert_eq!(
            err,
            NodeIdError::InvalidLength {
                expected: 32,
                actual: 2
            }
        );
        assert!("zz".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_serde_uses_hex_string() {
        let id = NodeId::new([1; NODE_ID_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_debug_is_abbreviated() {
        let id = NodeId::new([0x0f; NODE_ID_LEN]);
        assert_eq!(format!("{:?}", id), "NodeId(0f0f0f0f)");
    }
}
