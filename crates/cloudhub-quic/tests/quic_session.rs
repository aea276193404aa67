//! QUIC stream session tests
//!
//! Plays the edge side of the stream protocol over an in-memory pipe: register,
//! expect the acknowledgement, then exchange envelopes with a running session.

use std::sync::Arc;
use std::time::Duration;

use cloudhub_core::frame::{read_prefixed_frame, write_prefixed_frame, DEFAULT_MAX_FRAME_BYTES};
use cloudhub_core::{
    Control, Envelope, Frame, KeepaliveConfig, NodeId, Operation, PeerInfo, QueueConfig,
    SessionConfig, TransportKind,
};
use cloudhub_quic::{read_registration, QuicTransport};
use cloudhub_runtime::{CloseReason, QueueRegistry, Session};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

async fn next_frame(reader: &mut ReadHalf<DuplexStream>) -> Frame {
    tokio::time::timeout(WAIT, read_prefixed_frame(reader, DEFAULT_MAX_FRAME_BYTES))
        .await
        .expect("timed out waiting for a frame")
        .expect("unreadable frame")
        .expect("stream ended")
}

#[tokio::test]
async fn registration_is_acknowledged_before_queued_envelopes() {
    let registry = Arc::new(QueueRegistry::new(
        QueueConfig::with_capacity(16),
        SessionConfig::default(),
    ));
    let node_id = NodeId::new("edge-quic").unwrap();
    let queued =
        Envelope::to_node("cloud", &node_id, Operation::Update, "twin", vec![7]).with_id("queued");
    registry.publish(queued).unwrap();

    let (hub_side, edge_side) = tokio::io::duplex(64 * 1024);
    let (mut hub_read, hub_write) = tokio::io::split(hub_side);
    let (mut edge_read, mut edge_write) = tokio::io::split(edge_side);

    let register = Frame::control(Control::Register {
        node_id: "edge-quic".to_string(),
    });
    write_prefixed_frame(&mut edge_write, &register, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();

    let registered = read_registration(&mut hub_read, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();
    assert_eq!(registered, node_id);

    let peer = PeerInfo::new(registered, TransportKind::Quic, None);
    let transport = QuicTransport::new(hub_read, hub_write, peer, DEFAULT_MAX_FRAME_BYTES);
    let root = CancellationToken::new();
    let session = Session::new(
        Box::new(transport),
        SessionConfig::default(),
        KeepaliveConfig::default(),
        &root,
    );
    let session_id = session.handle().id();
    let task = tokio::spawn(session.run(registry.clone()));

    assert_eq!(
        next_frame(&mut edge_read).await,
        Frame::control(Control::Registered { session_id })
    );
    match next_frame(&mut edge_read).await {
        Frame::Message { envelope } => assert_eq!(envelope.id().as_str(), "queued"),
        other => panic!("expected the queued envelope, got {:?}", other),
    }

    let upstream = Frame::message(Envelope::to_cloud(
        "edge-quic",
        Operation::Response,
        "twin",
        vec![1],
    ));
    write_prefixed_frame(&mut edge_write, &upstream, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();
    let inbound = tokio::time::timeout(WAIT, registry.get(&node_id).unwrap().recv_inbound())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound.payload(), &[1]);

    // Finishing the stream ends the session like a peer close
    edge_write.shutdown().await.unwrap();
    let reason = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(reason, CloseReason::PeerClosed);
    assert_eq!(registry.connected_nodes(), 0);
}
