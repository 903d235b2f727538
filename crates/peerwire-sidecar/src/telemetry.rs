//! Lifecycle event logging and periodic traffic reports

use std::sync::Arc;
use std::time::Duration;

use peerwire_metering::{MeteredPeerEvent, MeteredPeerEventType, PeerMetering};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Log one lifecycle event at a level matching its outcome
pub fn log_event(event: &MeteredPeerEvent) {
    let id = event.id.map(|id| id.terminal_string()).unwrap_or_default();
    let elapsed_ms = event.elapsed.map(|d| d.as_millis() as u64).unwrap_or_default();
    match event.kind {
        MeteredPeerEventType::EncryptionHandshakeFailed
        | MeteredPeerEventType::ProtocolHandshakeFailed => {
            warn!(kind = %event.kind, addr = %event.addr, id = %id, elapsed_ms, "Peer dropped during handshake");
        }
        MeteredPeerEventType::PeerDisconnected => {
            info!(
                addr = %event.addr,
                id = %id,
                ingress = event.ingress,
                egress = event.egress,
                elapsed_ms,
                "Peer disconnected"
            );
        }
        _ => {
            info!(kind = %event.kind, addr = %event.addr, id = %id, name = ?event.name, "Peer lifecycle event");
        }
    }
    if let Ok(json) = serde_json::to_string(event) {
        debug!(event = %json, "Peer event payload");
    }
}

/// Subscribe to the lifecycle feed and log every event until the feed closes
pub fn spawn_event_logger(metering: &PeerMetering) -> JoinHandle<()> {
    let mut events = metering.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
        debug!("Peer event feed closed");
    })
}

/// Periodically log aggregate traffic and tracked-peer counts
pub fn spawn_stats_reporter(metering: Arc<PeerMetering>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(
                inbound_connects = metering.inbound_connects().count(),
                outbound_connects = metering.outbound_connects().count(),
                ingress_bytes = metering.ingress_traffic().count(),
                egress_bytes = metering.egress_traffic().count(),
                metered_peers = metering.metered_peer_count(),
                rejected_peers = metering.rejected_peers(),
                "Traffic report"
            );
        }
    })
}
