//! Metered TCP relay
//!
//! Accepts peers, meters their traffic and relays it to a fixed upstream.
//! A peer identifies itself by sending its 32-byte node id as the first
//! bytes on the wire; the relay then dials upstream and reports the peer as
//! added once that succeeds.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use peerwire_common::{Direction, NodeId, PeerInfo, NODE_ID_LEN};
use peerwire_metering::{PeerConn, PeerMetering};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, instrument, warn};

use crate::config::SidecarConfig;

/// Client name reported for relayed peers
pub const RELAY_PEER_NAME: &str = "peerwire-relay";

/// Relay server
pub struct Relay {
    config: SidecarConfig,
    metering: Arc<PeerMetering>,
}

impl Relay {
    pub fn new(config: SidecarConfig, metering: Arc<PeerMetering>) -> Self {
        Self { config, metering }
    }

    /// Bind the configured listen address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        info!(addr = %listener.local_addr()?, upstream = %self.config.upstream_addr, "Peerwire relay listening");
        Ok(listener)
    }

    /// Accept peers forever
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        loop {
            let (stream, remote) = listener.accept().await.context("Accept failed")?;
            let metering = self.metering.clone();
            let upstream = self.config.upstream_addr.clone();
            tokio::spawn(async move {
                serve_peer(metering, stream, remote, upstream, timeout).await;
            });
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}

async fn read_node_id(conn: &mut PeerConn<TcpStream>) -> std::io::Result<NodeId> {
    let mut buf = [0u8; NODE_ID_LEN];
    conn.read_exact(&mut buf).await?;
    Ok(NodeId::new(buf))
}

#[instrument(skip(metering, stream, upstream_addr, timeout))]
async fn serve_peer(
    metering: Arc<PeerMetering>,
    stream: TcpStream,
    remote: SocketAddr,
    upstream_addr: String,
    timeout: Duration,
) {
    let local = stream.local_addr().ok();
    let mut conn = metering.wrap(stream, Direction::Inbound, Some(remote));

    let id = match tokio::time::timeout(timeout, read_node_id(&mut conn)).await {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            debug!(error = %e, "Peer did not present a node id");
            let _ = conn.close().await;
            return;
        }
        Err(_) => {
            debug!("Node id handshake timed out");
            let _ = conn.close().await;
            return;
        }
    };
    conn.enc_handshake_done(id);

    let mut upstream = match TcpStream::connect(&upstream_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(upstream = %upstream_addr, error = %e, "Upstream dial failed");
            let _ = conn.close().await;
            return;
        }
    };

    let mut info = PeerInfo::new(id, RELAY_PEER_NAME, remote, Direction::Inbound)
        .with_protocol("relay", serde_json::json!({ "upstream": upstream_addr }));
    if let Some(local) = local {
        info = info.with_local_address(local);
    }
    conn.peer_added(&info);
    conn.message_handling_started(info.protocols.clone());

    match tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
        Ok((to_upstream, to_peer)) => {
            debug!(to_upstream, to_peer, "Relay finished");
        }
        Err(e) => {
            debug!(error = %e, "Relay aborted");
        }
    }
    if let Err(e) = conn.close().await {
        debug!(error = %e, "Close failed");
    }
}
