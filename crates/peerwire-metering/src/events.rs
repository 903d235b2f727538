//! Peer lifecycle events
//!
//! Every metered connection reports its transitions (encryption handshake,
//! protocol handshake, message handling, disconnect) as immutable
//! [`MeteredPeerEvent`] records on a [`PeerEventFeed`]. The feed is a bounded
//! broadcast channel: publishing never blocks, and a subscriber that falls
//! behind loses its oldest events instead of stalling the connection.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use peerwire_common::{NodeId, PeerInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// Sub-protocol metadata keyed by protocol name, opaque to the metering layer
pub type ProtocolMetadata = HashMap<String, serde_json::Value>;

/// Kind of transition reported by a metered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeteredPeerEventType {
    /// The peer completed the encryption handshake
    EncryptionHandshakeSucceeded,
    /// The peer failed the encryption handshake or disconnected before it
    EncryptionHandshakeFailed,
    /// The peer completed the protocol handshake
    ProtocolHandshakeSucceeded,
    /// The peer failed the protocol handshake, disconnected before it, or
    /// was never individually metered
    ProtocolHandshakeFailed,
    /// Sub-protocol message handling started
    MessageHandlingStarted,
    /// A fully metered peer disconnected
    PeerDisconnected,
}

impl MeteredPeerEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EncryptionHandshakeSucceeded => "encryption-handshake-succeeded",
            Self::EncryptionHandshakeFailed => "encryption-handshake-failed",
            Self::ProtocolHandshakeSucceeded => "protocol-handshake-succeeded",
            Self::ProtocolHandshakeFailed => "protocol-handshake-failed",
            Self::MessageHandlingStarted => "message-handling-started",
            Self::PeerDisconnected => "peer-disconnected",
        }
    }

    /// Whether this kind ends a connection's event sequence
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::EncryptionHandshakeFailed | Self::ProtocolHandshakeFailed | Self::PeerDisconnected
        )
    }
}

impl fmt::Display for MeteredPeerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted when a metered peer changes lifecycle state
///
/// Equality covers the kind, address, identifier and both byte counts;
/// metadata, timing and the emission timestamp are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeteredPeerEvent {
    /// Type of peer event
    #[serde(rename = "type")]
    pub kind: MeteredPeerEventType,
    /// Remote address of the peer
    pub addr: String,
    /// Unique node identifier, absent before the encryption handshake
    pub id: Option<NodeId>,
    /// Client name, including type, version, OS and custom data
    pub name: Option<String>,
    /// Node URL
    pub enode: Option<String>,
    /// Sub-protocol specific metadata
    pub protocols: Option<ProtocolMetadata>,
    /// Time between the connection and the handshake/disconnect
    pub elapsed: Option<Duration>,
    /// Ingress byte count at the moment of the event
    pub ingress: u64,
    /// Egress byte count at the moment of the event
    pub egress: u64,
    /// Full peer metadata, present on protocol handshake success
    pub peer: Option<PeerInfo>,
    /// Emission timestamp
    pub at: DateTime<Utc>,
}

impl MeteredPeerEvent {
    pub fn new(kind: MeteredPeerEventType, addr: impl Into<String>) -> Self {
        Self {
            kind,
            addr: addr.into(),
            id: None,
            name: None,
            enode: None,
            protocols: None,
            elapsed: None,
            ingress: 0,
            egress: 0,
            peer: None,
            at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Option<NodeId>) -> Self {
        self.id = id;
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn with_traffic(mut self, ingress: u64, egress: u64) -> Self {
        self.ingress = ingress;
        self.egress = egress;
        self
    }

    /// Attach display name, node descriptor and the full info record
    pub fn with_peer(mut self, info: &PeerInfo) -> Self {
        self.name = Some(info.name.clone());
        self.enode = Some(info.enode.clone());
        self.peer = Some(info.clone());
        self
    }

    pub fn with_protocols(mut self, protocols: ProtocolMetadata) -> Self {
        self.protocols = Some(protocols);
        self
    }
}

impl PartialEq for MeteredPeerEvent {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.addr == other.addr
            && self.id == other.id
            && self.ingress == other.ingress
            && self.egress == other.egress
    }
}

impl Eq for MeteredPeerEvent {}

/// Default capacity of the event broadcast channel
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Fan-out publisher for lifecycle events
#[derive(Debug, Clone)]
pub struct PeerEventFeed {
    tx: broadcast::Sender<MeteredPeerEvent>,
}

impl PeerEventFeed {
    /// Create a feed that retains up to `capacity` undelivered events per
    /// subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to every current subscriber; returns how many
    /// subscribers received it
    pub fn send(&self, event: MeteredPeerEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> PeerEventSubscription {
        PeerEventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for PeerEventFeed {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// Live handle on the lifecycle event feed
#[derive(Debug)]
pub struct PeerEventSubscription {
    rx: broadcast::Receiver<MeteredPeerEvent>,
}

impl PeerEventSubscription {
    /// Wait for the next event. Returns `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<MeteredPeerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Peer event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event, if any
    pub fn try_recv(&mut self) -> Option<MeteredPeerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Peer event subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every buffered event
    pub fn drain(&mut self) -> Vec<MeteredPeerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {}

    /// Convert into a stream that silently skips lagged gaps
    pub fn into_stream(self) -> impl Stream<Item = MeteredPeerEvent> {
        BroadcastStream::new(self.rx).filter_map(|res| res.ok())
    }
}
