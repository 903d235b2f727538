//! End-to-end lifecycle tests for metered peer connections

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use peerwire_common::{Direction, NodeId, PeerInfo};
use peerwire_metering::{
    peer_meter_key, MeteredPeerEvent, MeteredPeerEventType, MeteringConfig, PeerMetering,
};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

fn metering() -> Arc<PeerMetering> {
    Arc::new(PeerMetering::new(&MeteringConfig::default()).unwrap())
}

fn peer_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([10, 1, 2, 3], port))
}

fn info(id: NodeId, addr: SocketAddr) -> PeerInfo {
    PeerInfo::new(id, "peerwire/v0.1.0/linux", addr, Direction::Inbound)
        .with_caps(vec!["eth/68".into(), "snap/1".into()])
}

fn kinds(events: &[MeteredPeerEvent]) -> Vec<MeteredPeerEventType> {
    events.iter().map(|e| e.kind).collect()
}

/// Stream whose every operation fails with the same error
struct BrokenStream;

impl AsyncRead for BrokenStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")))
    }
}

impl AsyncWrite for BrokenStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "not connected")))
    }
}

#[tokio::test]
async fn test_encryption_handshake_failure() {
    let metering = metering();
    let mut events = metering.subscribe();

    let (local, _remote) = duplex(256);
    let conn = metering.wrap(local, Direction::Inbound, Some(peer_addr(30303)));
    conn.close().await.unwrap();

    let events = events.drain();
    assert_eq!(kinds(&events), vec![MeteredPeerEventType::EncryptionHandshakeFailed]);
    assert_eq!(events[0].addr, "10.1.2.3:30303");
    assert_eq!(events[0].id, None);
    assert!(events[0].elapsed.is_some());
    assert_eq!(metering.metered_peer_count(), 0);
    assert!(metering.peer_snapshot().is_empty());
}

#[tokio::test]
async fn test_tracked_peer_full_lifecycle() {
    let metering = metering();
    let mut events = metering.subscribe();
    let addr = peer_addr(30303);
    let id = NodeId::new([0x42; 32]);

    let (local, mut remote) = duplex(1024);
    let mut conn = metering.wrap(local, Direction::Outbound, Some(addr));

    conn.enc_handshake_done(id);
    conn.peer_added(&info(id, addr));
    assert!(conn.as_metered().unwrap().is_tracked());
    assert_eq!(metering.metered_peer_count(), 1);

    remote.write_all(&[7u8; 100]).await.unwrap();
    let mut buf = [0u8; 100];
    conn.read_exact(&mut buf).await.unwrap();
    conn.write_all(&[9u8; 50]).await.unwrap();

    let key = peer_meter_key("10.1.2.3:30303", &id);
    assert_eq!(metering.peer_ingress().get(&key), Some(100));
    assert_eq!(metering.peer_egress().get(&key), Some(50));

    conn.close().await.unwrap();

    let events = events.drain();
    assert_eq!(
        kinds(&events),
        vec![
            MeteredPeerEventType::EncryptionHandshakeSucceeded,
            MeteredPeerEventType::ProtocolHandshakeSucceeded,
            MeteredPeerEventType::PeerDisconnected,
        ]
    );
    assert_eq!(events[0].id, Some(id));
    assert!(events[0].elapsed.is_some());
    assert_eq!(events[1].id, Some(id));
    assert_eq!(events[1].name.as_deref(), Some("peerwire/v0.1.0/linux"));
    assert_eq!(
        events[1].enode.as_deref(),
        Some(format!("enode://{}@10.1.2.3:30303", id).as_str())
    );
    assert_eq!(
        events[2],
        MeteredPeerEvent::new(MeteredPeerEventType::PeerDisconnected, "10.1.2.3:30303")
            .with_id(Some(id))
            .with_traffic(100, 50)
    );

    assert_eq!(metering.ingress_traffic().count(), 100);
    assert_eq!(metering.egress_traffic().count(), 50);
    assert_eq!(metering.outbound_connects().count(), 1);
    assert!(metering.peer_ingress().get(&key).is_none());
    assert!(metering.peer_egress().get(&key).is_none());
    assert_eq!(metering.metered_peer_count(), 0);
}

#[tokio::test]
async fn test_message_handling_started_carries_protocols() {
    let metering = metering();
    let mut events = metering.subscribe();
    let addr = peer_addr(30304);
    let id = NodeId::new([0x11; 32]);

    let (local, _remote) = duplex(64);
    let conn = metering.wrap(local, Direction::Inbound, Some(addr));
    let hooks = conn.hooks();
    hooks.enc_handshake_done(id);
    hooks.peer_added(&info(id, addr));

    let mut protocols = HashMap::new();
    protocols.insert("eth".to_string(), serde_json::json!({ "version": 68 }));
    hooks.message_handling_started(protocols);
    conn.close().await.unwrap();

    let events = events.drain();
    assert_eq!(
        kinds(&events),
        vec![
            MeteredPeerEventType::EncryptionHandshakeSucceeded,
            MeteredPeerEventType::ProtocolHandshakeSucceeded,
            MeteredPeerEventType::MessageHandlingStarted,
            MeteredPeerEventType::PeerDisconnected,
        ]
    );
    let protocols = events[2].protocols.as_ref().unwrap();
    assert_eq!(protocols["eth"]["version"], 68);
    assert_eq!(events[2].id, Some(id));
}

#[tokio::test]
async fn test_protocol_handshake_failure_keeps_identifier() {
    let metering = metering();
    let mut events = metering.subscribe();
    let id = NodeId::new([0x21; 32]);

    let (local, _remote) = duplex(64);
    let conn = metering.wrap(local, Direction::Inbound, Some(peer_addr(1)));
    conn.enc_handshake_done(id);
    conn.close().await.unwrap();

    let events = events.drain();
    assert_eq!(
        kinds(&events),
        vec![
            MeteredPeerEventType::EncryptionHandshakeSucceeded,
            MeteredPeerEventType::ProtocolHandshakeFailed,
        ]
    );
    assert_eq!(events[1].id, Some(id));
    assert_eq!(metering.metered_peer_count(), 0);
}

#[tokio::test]
async fn test_peer_limit_reached() {
    let metering = metering();
    assert_eq!(metering.metered_peer_limit(), 1024);

    // The ceiling itself is never reached: 1023 peers fill every slot
    let mut tracked = Vec::new();
    for port in 0..1023u16 {
        let addr = peer_addr(port + 1);
        let id = NodeId::random();
        let (local, _remote) = duplex(64);
        let conn = metering.wrap(local, Direction::Inbound, Some(addr));
        conn.enc_handshake_done(id);
        conn.peer_added(&info(id, addr));
        tracked.push(conn);
    }
    assert_eq!(metering.metered_peer_count(), 1023);
    assert_eq!(metering.rejected_peers(), 0);

    let mut events = metering.subscribe();
    let addr = peer_addr(5000);
    let id = NodeId::new([0xee; 32]);
    let (local, mut remote) = duplex(64);
    let mut conn = metering.wrap(local, Direction::Inbound, Some(addr));
    conn.enc_handshake_done(id);
    conn.peer_added(&info(id, addr));

    assert!(!conn.as_metered().unwrap().is_tracked());
    assert_eq!(metering.metered_peer_count(), 1023);
    assert_eq!(metering.rejected_peers(), 1);
    let key = peer_meter_key(&addr.to_string(), &id);
    assert!(metering.peer_ingress().get(&key).is_none());
    assert!(metering.peer_egress().get(&key).is_none());
    assert_eq!(metering.peer_ingress().len(), 1023);

    // Aggregate metering continues for the capped peer
    let before = metering.ingress_traffic().count();
    remote.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(metering.ingress_traffic().count(), before + 5);

    conn.close().await.unwrap();
    let events = events.drain();
    assert_eq!(
        kinds(&events),
        vec![
            MeteredPeerEventType::EncryptionHandshakeSucceeded,
            MeteredPeerEventType::ProtocolHandshakeSucceeded,
            MeteredPeerEventType::ProtocolHandshakeFailed,
        ]
    );
    // Capped peers are reported without their identifier on admission
    assert_eq!(events[1].id, None);
    assert_eq!(events[1].addr, "10.1.2.3:5000");
    assert_eq!(events[2].id, Some(id));
    assert_eq!(metering.metered_peer_count(), 1023);

    drop(tracked);
    assert_eq!(metering.metered_peer_count(), 0);
    assert!(metering.peer_snapshot().is_empty());
}

#[tokio::test]
async fn test_disabled_metering_is_transparent() {
    let metering = Arc::new(PeerMetering::new(&MeteringConfig::disabled()).unwrap());
    let mut events = metering.subscribe();

    let (local, mut remote) = duplex(64);
    let mut conn = metering.wrap(local, Direction::Inbound, Some(peer_addr(30303)));
    assert!(!conn.is_metered());

    conn.enc_handshake_done(NodeId::random());
    remote.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(conn.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"ping");
    assert_eq!(conn.write(b"pong").await.unwrap(), 4);
    conn.close().await.unwrap();

    assert!(events.drain().is_empty());
    assert_eq!(metering.ingress_traffic().count(), 0);
    assert_eq!(metering.egress_traffic().count(), 0);
    assert_eq!(metering.inbound_connects().count(), 0);
}

#[tokio::test]
async fn test_io_errors_pass_through_unchanged() {
    let metering = metering();
    let mut events = metering.subscribe();
    let id = NodeId::new([0x33; 32]);
    let addr = peer_addr(7);

    let mut conn = metering.wrap(BrokenStream, Direction::Inbound, Some(addr));
    conn.enc_handshake_done(id);
    conn.peer_added(&info(id, addr));

    let mut buf = [0u8; 8];
    let err = conn.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    let err = conn.write(b"data").await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    assert_eq!(metering.ingress_traffic().count(), 0);
    assert_eq!(metering.egress_traffic().count(), 0);

    // Bookkeeping still happens when the underlying close fails
    let err = conn.close().await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    let events = events.drain();
    assert_eq!(events.last().unwrap().kind, MeteredPeerEventType::PeerDisconnected);
    assert_eq!(metering.metered_peer_count(), 0);
    assert!(metering.peer_ingress().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_sum_aggregate_traffic() {
    let metering = Arc::new(PeerMetering::new(&MeteringConfig::default().with_peer_limit(8)).unwrap());
    let mut events = metering.subscribe();

    let mut handles = Vec::new();
    for i in 0..32u16 {
        let metering = metering.clone();
        handles.push(tokio::spawn(async move {
            let addr = peer_addr(10_000 + i);
            let id = NodeId::random();
            let (local, mut remote) = duplex(4096);
            let mut conn = metering.wrap(local, Direction::Inbound, Some(addr));
            conn.enc_handshake_done(id);
            conn.peer_added(&info(id, addr));

            let payload = vec![i as u8; 100 + i as usize];
            remote.write_all(&payload).await.unwrap();
            let mut buf = vec![0u8; payload.len()];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&payload[..10]).await.unwrap();
            conn.close().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let expected_in: u64 = (0..32u64).map(|i| 100 + i).sum();
    assert_eq!(metering.ingress_traffic().count(), expected_in);
    assert_eq!(metering.egress_traffic().count(), 32 * 10);
    assert_eq!(metering.metered_peer_count(), 0);
    assert!(metering.peer_snapshot().is_empty());

    let events = events.drain();
    let terminal = events.iter().filter(|e| e.kind.is_terminal()).count();
    assert_eq!(terminal, 32);
    let disconnected = events
        .iter()
        .filter(|e| e.kind == MeteredPeerEventType::PeerDisconnected)
        .count();
    assert!(disconnected >= 7);
}
