//! Process-wide peer metering state
//!
//! [`PeerMetering`] is built once per process and shared by reference with
//! every wrapped connection. It owns the aggregate connect/traffic meters,
//! the per-peer registries, the tracked-peer counter with its ceiling, and
//! the lifecycle event feed.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use peerwire_common::{Direction, NodeId, Result};
use tracing::{debug, info, warn};

use crate::config::MeteringConfig;
use crate::conn::{MeteredConn, PeerConn};
use crate::events::{PeerEventFeed, PeerEventSubscription};
use crate::meter::Meter;
use crate::registry::{MeterRegistry, PeerMeterVec};

/// Name for the registered inbound connects meter
pub const METRICS_INBOUND_CONNECTS: &str = "inbound-connects";
/// Name for the registered inbound traffic meter
pub const METRICS_INBOUND_TRAFFIC: &str = "inbound-traffic";
/// Name for the registered outbound connects meter
pub const METRICS_OUTBOUND_CONNECTS: &str = "outbound-connects";
/// Name for the registered outbound traffic meter
pub const METRICS_OUTBOUND_TRAFFIC: &str = "outbound-traffic";

/// Composite key of a peer's traffic meters
pub fn peer_meter_key(addr: &str, id: &NodeId) -> String {
    format!("{}/{}", addr, id)
}

/// Per-peer meter pair handed to a tracked connection
#[derive(Debug, Clone)]
pub(crate) struct PeerMeters {
    pub key: String,
    pub ingress: Meter,
    pub egress: Meter,
}

/// Shared metering state for all peer connections
pub struct PeerMetering {
    enabled: bool,
    limit: usize,

    ingress_connects: Meter,
    ingress_traffic: Meter,
    egress_connects: Meter,
    egress_traffic: Meter,

    registry: MeterRegistry,
    ephemeral: prometheus::Registry,
    peer_ingress: PeerMeterVec,
    peer_egress: PeerMeterVec,

    /// Peers currently holding a per-peer meter pair
    metered_peers: AtomicUsize,
    /// Admissions turned away at the ceiling
    rejected: AtomicU64,

    feed: PeerEventFeed,
}

impl PeerMetering {
    /// Build the metering state from configuration
    pub fn new(config: &MeteringConfig) -> Result<Self> {
        config.validate()?;

        let mut registry = MeterRegistry::new();
        let ingress_connects =
            registry.register(METRICS_INBOUND_CONNECTS, "Inbound peer connections metered")?;
        let ingress_traffic =
            registry.register(METRICS_INBOUND_TRAFFIC, "Bytes read from metered peers")?;
        let egress_connects =
            registry.register(METRICS_OUTBOUND_CONNECTS, "Outbound peer connections metered")?;
        let egress_traffic =
            registry.register(METRICS_OUTBOUND_TRAFFIC, "Bytes written to metered peers")?;

        let ephemeral = prometheus::Registry::new();
        let peer_ingress = PeerMeterVec::new(
            format!("{}/", METRICS_INBOUND_TRAFFIC),
            "Bytes read from each tracked peer",
            &ephemeral,
        )?;
        let peer_egress = PeerMeterVec::new(
            format!("{}/", METRICS_OUTBOUND_TRAFFIC),
            "Bytes written to each tracked peer",
            &ephemeral,
        )?;

        info!(
            enabled = config.enabled,
            metered_peer_limit = config.metered_peer_limit,
            "Peer metering initialized"
        );

        Ok(Self {
            enabled: config.enabled,
            limit: config.metered_peer_limit,
            ingress_connects,
            ingress_traffic,
            egress_connects,
            egress_traffic,
            registry,
            ephemeral,
            peer_ingress,
            peer_egress,
            metered_peers: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            feed: PeerEventFeed::new(config.event_buffer),
        })
    }

    /// Wrap a raw connection with traffic metering.
    ///
    /// If metering is disabled or the address is missing or unspecified the
    /// stream comes back as [`PeerConn::Plain`] with no side effects.
    pub fn wrap<S>(self: &Arc<Self>, stream: S, direction: Direction, addr: Option<SocketAddr>) -> PeerConn<S> {
        if !self.enabled {
            return PeerConn::Plain(stream);
        }
        let addr = match addr {
            Some(addr) if !addr.ip().is_unspecified() => addr,
            _ => {
                info!(?addr, "Peer address is unspecified, not metering");
                return PeerConn::Plain(stream);
            }
        };
        match direction {
            Direction::Inbound => self.ingress_connects.mark(1),
            Direction::Outbound => self.egress_connects.mark(1),
        }
        debug!(addr = %addr, %direction, "Metering peer connection");
        PeerConn::Metered(MeteredConn::new(stream, addr, self.clone()))
    }

    /// Subscribe to peer lifecycle events. When metering is disabled the
    /// subscription is valid but never yields anything.
    pub fn subscribe(&self) -> PeerEventSubscription {
        self.feed.subscribe()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn metered_peer_limit(&self) -> usize {
        self.limit
    }

    /// Peers currently metered individually
    pub fn metered_peer_count(&self) -> usize {
        self.metered_peers.load(Ordering::Acquire)
    }

    /// Number of times the ceiling turned a peer away
    pub fn rejected_peers(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn inbound_connects(&self) -> &Meter {
        &self.ingress_connects
    }

    pub fn outbound_connects(&self) -> &Meter {
        &self.egress_connects
    }

    pub fn ingress_traffic(&self) -> &Meter {
        &self.ingress_traffic
    }

    pub fn egress_traffic(&self) -> &Meter {
        &self.egress_traffic
    }

    /// Per-peer ingress meters, keyed `"<addr>/<id>"`
    pub fn peer_ingress(&self) -> &PeerMeterVec {
        &self.peer_ingress
    }

    /// Per-peer egress meters, keyed `"<addr>/<id>"`
    pub fn peer_egress(&self) -> &PeerMeterVec {
        &self.peer_egress
    }

    /// Prometheus registry holding the four aggregate meters
    pub fn registry(&self) -> &prometheus::Registry {
        self.registry.registry()
    }

    /// Prometheus registry holding the per-peer meter vectors
    pub fn ephemeral_registry(&self) -> &prometheus::Registry {
        &self.ephemeral
    }

    /// Counts of the four aggregate meters
    pub fn aggregate_snapshot(&self) -> BTreeMap<String, u64> {
        self.registry.snapshot()
    }

    /// Counts of every per-peer meter, keys carrying their direction prefix
    pub fn peer_snapshot(&self) -> BTreeMap<String, u64> {
        let mut snapshot = BTreeMap::new();
        for vec in [&self.peer_ingress, &self.peer_egress] {
            for (key, count) in vec.snapshot() {
                snapshot.insert(format!("{}{}", vec.prefix(), key), count);
            }
        }
        snapshot
    }

    pub(crate) fn feed(&self) -> &PeerEventFeed {
        &self.feed
    }

    pub(crate) fn mark_ingress(&self, n: u64) {
        self.ingress_traffic.mark(n);
    }

    pub(crate) fn mark_egress(&self, n: u64) {
        self.egress_traffic.mark(n);
    }

    /// Try to reserve a tracked-peer slot and register the peer's meters.
    ///
    /// The slot is taken with an increment and handed back if the new count
    /// is at or above the ceiling, so at most `limit - 1` peers are tracked.
    pub(crate) fn admit(&self, addr: &str, id: &NodeId) -> Option<PeerMeters> {
        let previous = self.metered_peers.fetch_add(1, Ordering::AcqRel);
        if previous + 1 >= self.limit {
            self.metered_peers.fetch_sub(1, Ordering::AcqRel);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                addr,
                limit = self.limit,
                "Metered peer count reached the limit"
            );
            return None;
        }
        let key = peer_meter_key(addr, id);
        let meters = PeerMeters {
            ingress: self.peer_ingress.get_or_register(&key),
            egress: self.peer_egress.get_or_register(&key),
            key,
        };
        debug!(key = %meters.key, "Registered peer traffic meters");
        Some(meters)
    }

    /// Give back a tracked-peer slot and drop the peer's meters
    pub(crate) fn release(&self, meters: &PeerMeters) {
        self.metered_peers.fetch_sub(1, Ordering::AcqRel);
        self.peer_ingress.unregister(&meters.key);
        self.peer_egress.unregister(&meters.key);
        debug!(key = %meters.key, "Unregistered peer traffic meters");
    }
}

impl fmt::Debug for PeerMetering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerMetering")
            .field("enabled", &self.enabled)
            .field("limit", &self.limit)
            .field("metered_peers", &self.metered_peer_count())
            .field("aggregates", &self.registry)
            .finish_non_exhaustive()
    }
}
