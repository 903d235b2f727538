//! Metered peer connections
//!
//! [`MeteredConn`] wraps a raw byte stream, marks every read and write on
//! the aggregate traffic meters (and on the peer's own meters once it is
//! tracked), and reports the connection's lifecycle on the event feed.
//! Exactly one terminal event is emitted per connection, chosen by how far
//! it progressed: encryption handshake failed, protocol handshake failed, or
//! peer disconnected.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use peerwire_common::{NodeId, PeerInfo};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

use crate::events::{MeteredPeerEvent, MeteredPeerEventType, ProtocolMetadata};
use crate::peers::{PeerMeters, PeerMetering};

/// Mutable per-connection state, guarded by one lock per connection
#[derive(Debug, Default)]
struct ConnState {
    /// Set by the encryption handshake, never cleared afterwards
    id: Option<NodeId>,
    /// Present iff the peer holds a tracked-peer slot
    meters: Option<PeerMeters>,
    /// Admission is attempted at most once per connection
    admission_attempted: bool,
}

/// State shared between the stream wrapper and its hook handles
#[derive(Debug)]
struct ConnShared {
    addr: SocketAddr,
    addr_str: String,
    connected: Instant,
    state: RwLock<ConnState>,
    finished: AtomicBool,
    metering: Arc<PeerMetering>,
}

impl ConnShared {
    fn elapsed(&self) -> Duration {
        self.connected.elapsed()
    }

    fn emit(&self, event: MeteredPeerEvent) {
        self.metering.feed().send(event);
    }

    fn record_read(&self, n: u64) {
        self.metering.mark_ingress(n);
        let state = self.state.read();
        if let Some(meters) = &state.meters {
            meters.ingress.mark(n);
        }
    }

    fn record_write(&self, n: u64) {
        self.metering.mark_egress(n);
        let state = self.state.read();
        if let Some(meters) = &state.meters {
            meters.egress.mark(n);
        }
    }

    // Hooks check `finished` and emit while holding the state lock, and
    // `finish` sets it under the write lock, so nothing follows the terminal
    // event.

    fn enc_handshake_done(&self, id: NodeId) {
        let mut state = self.state.write();
        if self.finished.load(Ordering::Acquire) {
            debug!(addr = %self.addr, "Encryption handshake reported after close, ignoring");
            return;
        }
        if let Some(existing) = state.id {
            debug!(addr = %self.addr, id = %existing, "Encryption handshake already recorded");
            return;
        }
        state.id = Some(id);
        self.emit(
            MeteredPeerEvent::new(MeteredPeerEventType::EncryptionHandshakeSucceeded, &self.addr_str)
                .with_id(Some(id))
                .with_elapsed(self.elapsed()),
        );
    }

    fn peer_added(&self, info: &PeerInfo) {
        let mut state = self.state.write();
        if self.finished.load(Ordering::Acquire) {
            debug!(addr = %self.addr, "Peer added after close, ignoring");
            return;
        }
        let reported_id = if state.admission_attempted {
            // Untracked peers stay anonymous in their events
            state.meters.as_ref().and(state.id)
        } else {
            state.admission_attempted = true;
            match state.id {
                None => {
                    warn!(addr = %self.addr, "Peer added before encryption handshake");
                    None
                }
                Some(id) => match self.metering.admit(&self.addr_str, &id) {
                    Some(meters) => {
                        state.meters = Some(meters);
                        Some(id)
                    }
                    None => None,
                },
            }
        };
        self.emit(
            MeteredPeerEvent::new(MeteredPeerEventType::ProtocolHandshakeSucceeded, &self.addr_str)
                .with_id(reported_id)
                .with_peer(info),
        );
    }

    fn message_handling_started(&self, protocols: ProtocolMetadata) {
        let state = self.state.read();
        if self.finished.load(Ordering::Acquire) {
            debug!(addr = %self.addr, "Message handling reported after close, ignoring");
            return;
        }
        self.emit(
            MeteredPeerEvent::new(MeteredPeerEventType::MessageHandlingStarted, &self.addr_str)
                .with_id(state.id)
                .with_protocols(protocols),
        );
    }

    /// Terminal bookkeeping; runs once no matter how often it is called
    fn finish(&self) {
        let state = self.state.write();
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(id) = state.id else {
            // Closed before or during the encryption handshake
            drop(state);
            self.emit(
                MeteredPeerEvent::new(MeteredPeerEventType::EncryptionHandshakeFailed, &self.addr_str)
                    .with_elapsed(self.elapsed()),
            );
            return;
        };
        let Some(meters) = state.meters.clone() else {
            // Closed before or during the protocol handshake, or never tracked
            drop(state);
            self.emit(
                MeteredPeerEvent::new(MeteredPeerEventType::ProtocolHandshakeFailed, &self.addr_str)
                    .with_id(Some(id)),
            );
            return;
        };
        let (ingress, egress) = (meters.ingress.count(), meters.egress.count());
        drop(state);

        self.metering.release(&meters);

        self.emit(
            MeteredPeerEvent::new(MeteredPeerEventType::PeerDisconnected, &self.addr_str)
                .with_id(Some(id))
                .with_traffic(ingress, egress)
                .with_elapsed(self.elapsed()),
        );
    }
}

/// A raw stream wrapped with traffic metering and lifecycle reporting.
///
/// Dropping the connection without [`MeteredConn::close`] still runs the
/// terminal bookkeeping, so a tracked peer's meters are always released.
#[derive(Debug)]
pub struct MeteredConn<S> {
    // Fields drop in order: the stream is gone before the terminal event.
    inner: S,
    shared: FinishOnDrop,
}

/// Runs the terminal bookkeeping when the owning connection is dropped
#[derive(Debug)]
struct FinishOnDrop(Arc<ConnShared>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl<S> MeteredConn<S> {
    pub(crate) fn new(inner: S, addr: SocketAddr, metering: Arc<PeerMetering>) -> Self {
        Self {
            inner,
            shared: FinishOnDrop(Arc::new(ConnShared {
                addr,
                addr_str: addr.to_string(),
                connected: Instant::now(),
                state: RwLock::new(ConnState::default()),
                finished: AtomicBool::new(false),
                metering,
            })),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.0.addr
    }

    /// Peer identifier, once the encryption handshake completed
    pub fn peer_id(&self) -> Option<NodeId> {
        self.shared.0.state.read().id
    }

    /// Whether the peer holds a per-peer meter pair
    pub fn is_tracked(&self) -> bool {
        self.shared.0.state.read().meters.is_some()
    }

    /// Time since the connection was wrapped
    pub fn elapsed(&self) -> Duration {
        self.shared.0.elapsed()
    }

    pub fn hooks(&self) -> ConnHooks {
        ConnHooks {
            shared: Some(self.shared.0.clone()),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn enc_handshake_done(&self, id: NodeId) {
        self.shared.0.enc_handshake_done(id);
    }

    pub fn peer_added(&self, info: &PeerInfo) {
        self.shared.0.peer_added(info);
    }

    pub fn message_handling_started(&self, protocols: ProtocolMetadata) {
        self.shared.0.message_handling_started(protocols);
    }
}

impl<S: AsyncWrite + Unpin> MeteredConn<S> {
    /// Shut the stream down, then emit the terminal event and release any
    /// per-peer meters. The shutdown result is returned unchanged.
    pub async fn close(mut self) -> io::Result<()> {
        let res = self.inner.shutdown().await;
        self.shared.0.finish();
        res
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.shared.0.record_read((buf.filled().len() - before) as u64);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            this.shared.0.record_write(n as u64);
        }
        res
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = res {
            this.shared.0.record_write(n as u64);
        }
        res
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Cloneable handle for driving lifecycle transitions from the handshake
/// layer while another task owns the stream. Inert for plain connections.
#[derive(Debug, Clone, Default)]
pub struct ConnHooks {
    shared: Option<Arc<ConnShared>>,
}

impl ConnHooks {
    /// Called after the connection passes the encryption handshake
    pub fn enc_handshake_done(&self, id: NodeId) {
        if let Some(shared) = &self.shared {
            shared.enc_handshake_done(id);
        }
    }

    /// Called after the connection passes the protocol handshake
    pub fn peer_added(&self, info: &PeerInfo) {
        if let Some(shared) = &self.shared {
            shared.peer_added(info);
        }
    }

    /// Called once the sub-protocols start handling messages
    pub fn message_handling_started(&self, protocols: ProtocolMetadata) {
        if let Some(shared) = &self.shared {
            shared.message_handling_started(protocols);
        }
    }

    pub fn is_metered(&self) -> bool {
        self.shared.is_some()
    }
}

/// A connection returned by [`PeerMetering::wrap`]: metered, or the raw
/// stream untouched when metering does not apply.
#[derive(Debug)]
pub enum PeerConn<S> {
    Plain(S),
    Metered(MeteredConn<S>),
}

impl<S> PeerConn<S> {
    pub fn is_metered(&self) -> bool {
        matches!(self, PeerConn::Metered(_))
    }

    pub fn hooks(&self) -> ConnHooks {
        match self {
            PeerConn::Plain(_) => ConnHooks::default(),
            PeerConn::Metered(conn) => conn.hooks(),
        }
    }

    pub fn as_metered(&self) -> Option<&MeteredConn<S>> {
        match self {
            PeerConn::Plain(_) => None,
            PeerConn::Metered(conn) => Some(conn),
        }
    }

    pub fn get_ref(&self) -> &S {
        match self {
            PeerConn::Plain(s) => s,
            PeerConn::Metered(conn) => conn.get_ref(),
        }
    }

    pub fn enc_handshake_done(&self, id: NodeId) {
        if let PeerConn::Metered(conn) = self {
            conn.enc_handshake_done(id);
        }
    }

    pub fn peer_added(&self, info: &PeerInfo) {
        if let PeerConn::Metered(conn) = self {
            conn.peer_added(info);
        }
    }

    pub fn message_handling_started(&self, protocols: ProtocolMetadata) {
        if let PeerConn::Metered(conn) = self {
            conn.message_handling_started(protocols);
        }
    }
}

impl<S: AsyncWrite + Unpin> PeerConn<S> {
    pub async fn close(self) -> io::Result<()> {
        match self {
            PeerConn::Plain(mut s) => s.shutdown().await,
            PeerConn::Metered(conn) => conn.close().await,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeerConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerConn::Plain(s) => Pin::new(s).poll_read(cx, buf),
            PeerConn::Metered(conn) => Pin::new(conn).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeerConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PeerConn::Plain(s) => Pin::new(s).poll_write(cx, buf),
            PeerConn::Metered(conn) => Pin::new(conn).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PeerConn::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            PeerConn::Metered(conn) => Pin::new(conn).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            PeerConn::Plain(s) => s.is_write_vectored(),
            PeerConn::Metered(conn) => conn.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerConn::Plain(s) => Pin::new(s).poll_flush(cx),
            PeerConn::Metered(conn) => Pin::new(conn).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PeerConn::Plain(s) => Pin::new(s).poll_shutdown(cx),
            PeerConn::Metered(conn) => Pin::new(conn).poll_shutdown(cx),
        }
    }
}
