//! # Peerwire Common
//!
//! Shared types and errors for the Peerwire peer-connection metering layer.
//!
//! - [`NodeId`]: 32-byte peer identifier established by the encryption handshake
//! - [`PeerInfo`]: peer metadata reported once the protocol handshake completes
//! - [`Direction`]: inbound or outbound connection
//! - [`PeerwireError`]: unified error type

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{PeerwireError, Result};
pub use types::{
    node_id::{NodeId, NodeIdError, NODE_ID_LEN},
    peer_info::{Direction, NetworkInfo, PeerInfo},
};

/// Peerwire version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of peers individually metered at once
pub const DEFAULT_METERED_PEER_LIMIT: usize = 1024;
