//! Core data types shared across the Peerwire crates

pub mod node_id;
pub mod peer_info;
