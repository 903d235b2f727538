//! # Peerwire Metering
//!
//! Traffic accounting and lifecycle observability for peer connections.
//!
//! A [`PeerMetering`] instance is built once per process and wraps raw
//! streams into [`PeerConn`]s. Every read and write on a metered connection
//! is marked on the aggregate ingress/egress meters; peers admitted under the
//! tracked-peer ceiling also get their own meter pair, labelled
//! `"<addr>/<node id>"` in the `inbound-traffic/` and `outbound-traffic/`
//! counter vectors. All meters are prometheus counters. Lifecycle
//! transitions are published as [`MeteredPeerEvent`]s to any number of
//! subscribers.
//!
//! ```
//! use std::sync::Arc;
//! use peerwire_common::{Direction, NodeId};
//! use peerwire_metering::{MeteringConfig, MeteredPeerEventType, PeerMetering};
//!
//! let metering = Arc::new(PeerMetering::new(&MeteringConfig::default()).unwrap());
//! let mut events = metering.subscribe();
//!
//! let (stream, _remote) = tokio::io::duplex(64);
//! let conn = metering.wrap(stream, Direction::Inbound, "10.0.0.1:30303".parse().ok());
//! conn.enc_handshake_done(NodeId::random());
//! drop(conn);
//!
//! let kinds: Vec<_> = events.drain().into_iter().map(|e| e.kind).collect();
//! assert_eq!(
//!     kinds,
//!     vec![
//!         MeteredPeerEventType::EncryptionHandshakeSucceeded,
//!         MeteredPeerEventType::ProtocolHandshakeFailed,
//!     ]
//! );
//! ```

pub mod config;
pub mod conn;
pub mod events;
pub mod meter;
pub mod peers;
pub mod registry;

pub use config::MeteringConfig;
pub use conn::{ConnHooks, MeteredConn, PeerConn};
pub use events::{
    MeteredPeerEvent, MeteredPeerEventType, PeerEventFeed, PeerEventSubscription,
    ProtocolMetadata,
};
pub use meter::Meter;
pub use peers::{
    peer_meter_key, PeerMetering, METRICS_INBOUND_CONNECTS, METRICS_INBOUND_TRAFFIC,
    METRICS_OUTBOUND_CONNECTS, METRICS_OUTBOUND_TRAFFIC,
};
pub use registry::{MeterRegistry, PeerMeterVec, PEER_LABEL};
