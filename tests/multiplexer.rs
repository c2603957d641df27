#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Dispatcher behavior: flow control, refusal, id hygiene, and failure
//! fan-out, each against a scripted peer on an in-memory duplex channel.

use std::time::Duration;

use bridge_protocol::core::banner::{Banner, Feature, FeatureSet};
use bridge_protocol::core::packet::{Command, Packet};
use bridge_protocol::error::BridgeError;
use bridge_protocol::protocol::{dispatcher, DispatcherHandle, SessionInfo};
use bridge_protocol::transport::Connection;
use tokio::io::DuplexStream;
use tokio::time::timeout;

const SHORT: Duration = Duration::from_millis(100);
const LONG: Duration = Duration::from_secs(5);

fn session(delayed_ack: bool) -> SessionInfo {
    let remote = if delayed_ack {
        vec![Feature::DelayedAck]
    } else {
        vec![]
    };
    SessionInfo {
        banner: Banner::parse(b"device::ro.product.name=test;"),
        features: FeatureSet::negotiate(&remote, &["delayed_ack".to_string()]),
        max_payload: 4096,
        version: 0x0100_0001,
    }
}

fn start(delayed_ack: bool) -> (DispatcherHandle, Connection<DuplexStream>) {
    let (client, peer) = tokio::io::duplex(256 * 1024);
    let handle = dispatcher::start(Connection::new(client), session(delayed_ack));
    (handle, Connection::new(peer))
}

/// Accept the next open request, assigning `remote_id` to the peer side.
async fn accept_open(peer: &mut Connection<DuplexStream>, remote_id: u32) -> u32 {
    let open = peer.recv().await.unwrap();
    assert_eq!(open.command, Command::Open);
    let local_id = open.arg0;
    peer.send(Packet::bare(Command::Okay, remote_id, local_id))
        .await
        .unwrap();
    local_id
}

#[tokio::test]
async fn refused_open_reports_connection_refused() {
    let (handle, mut peer) = start(false);

    let open_task = tokio::spawn(async move { handle.open("shell:nope").await });

    let open = peer.recv().await.unwrap();
    assert_eq!(open.command, Command::Open);
    peer.send(Packet::bare(Command::Close, 0, open.arg0))
        .await
        .unwrap();

    let err = open_task.await.unwrap().unwrap_err();
    match err {
        BridgeError::ConnectionRefused(service) => assert_eq!(service, "shell:nope"),
        other => panic!("expected refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn one_packet_window_blocks_second_write() {
    let (handle, mut peer) = start(false);

    let mut stream = {
        let open = tokio::spawn({
            let handle = handle.clone();
            async move { handle.open("sync:").await.unwrap() }
        });
        accept_open(&mut peer, 7).await;
        open.await.unwrap()
    };
    let local_id = stream.local_id();

    stream.write(&b"first"[..]).await.unwrap();
    let first = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(first.command, Command::Write);
    assert_eq!(&first.payload[..], b"first");
    assert_eq!(first.arg0, local_id);
    assert_eq!(first.arg1, 7);

    // Second write must stay queued until the first is acknowledged.
    let write_task = tokio::spawn(async move {
        stream.write(&b"second"[..]).await.unwrap();
        stream
    });
    assert!(
        timeout(SHORT, peer.recv()).await.is_err(),
        "second write leaked past the one-packet window"
    );

    peer.send(Packet::bare(Command::Okay, 7, local_id)).await.unwrap();
    let second = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(&second.payload[..], b"second");
    write_task.await.unwrap();
}

#[tokio::test]
async fn delayed_ack_window_pipelines_within_credit() {
    let (handle, mut peer) = start(true);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("sync:").await.unwrap() }
    });
    let open = peer.recv().await.unwrap();
    let local_id = open.arg0;
    // Accept with an initial window of 10 bytes.
    peer.send(Packet::new(
        Command::Okay,
        7,
        local_id,
        10u32.to_le_bytes().to_vec(),
    ))
    .await
    .unwrap();
    let mut stream = open_task.await.unwrap();

    // Two writes of 5 bytes ride the window back to back, no ack needed.
    stream.write(&b"aaaaa"[..]).await.unwrap();
    stream.write(&b"bbbbb"[..]).await.unwrap();
    assert_eq!(&peer.recv().await.unwrap().payload[..], b"aaaaa");
    assert_eq!(&peer.recv().await.unwrap().payload[..], b"bbbbb");

    // Window exhausted: the third write waits for credit.
    let write_task = tokio::spawn(async move {
        stream.write(&b"ccccc"[..]).await.unwrap();
        stream
    });
    assert!(timeout(SHORT, peer.recv()).await.is_err());

    peer.send(Packet::new(
        Command::Okay,
        7,
        local_id,
        5u32.to_le_bytes().to_vec(),
    ))
    .await
    .unwrap();
    let third = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(&third.payload[..], b"ccccc");
    write_task.await.unwrap();
}

#[tokio::test]
async fn inbound_write_is_credited_with_byte_count_under_delayed_ack() {
    let (handle, mut peer) = start(true);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("sync:").await.unwrap() }
    });
    let open = peer.recv().await.unwrap();
    let local_id = open.arg0;
    peer.send(Packet::new(
        Command::Okay,
        7,
        local_id,
        1024u32.to_le_bytes().to_vec(),
    ))
    .await
    .unwrap();
    let mut stream = open_task.await.unwrap();

    peer.send(Packet::new(Command::Write, 7, local_id, vec![9u8; 100]))
        .await
        .unwrap();
    let ack = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(ack.command, Command::Okay);
    assert_eq!(&ack.payload[..], &100u32.to_le_bytes()[..]);

    assert_eq!(stream.read().await.unwrap().unwrap().len(), 100);
}

#[tokio::test]
async fn peer_close_with_slow_reader_delivers_whole_backlog() {
    let (handle, mut peer) = start(false);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("sync:").await.unwrap() }
    });
    let local_id = accept_open(&mut peer, 7).await;
    let mut stream = open_task.await.unwrap();

    // More chunks than the consumer buffer holds, then an immediate close,
    // all before the consumer reads anything.
    for i in 0..12u8 {
        peer.send(Packet::new(Command::Write, 7, local_id, vec![i; 4]))
            .await
            .unwrap();
    }
    peer.send(Packet::bare(Command::Close, 7, local_id)).await.unwrap();

    // Every chunk the peer sent before closing arrives, in order, followed
    // by the clean end of the stream.
    let mut received = Vec::new();
    while let Some(chunk) = stream.read().await.unwrap() {
        assert_eq!(chunk.len(), 4);
        received.push(chunk[0]);
    }
    assert_eq!(received, (0..12u8).collect::<Vec<_>>());

    // Writes after the drain fail rather than hang.
    assert!(stream.write(&b"late"[..]).await.is_err());
}

#[tokio::test]
async fn delayed_ack_bare_acceptance_grants_standard_window() {
    let (handle, mut peer) = start(true);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("sync:").await.unwrap() }
    });
    // Acceptance without an explicit window advertisement.
    let local_id = accept_open(&mut peer, 7).await;
    let mut stream = open_task.await.unwrap();

    // More than one max-payload chunk flows without any acknowledgment:
    // the standard initial window is far larger than max_payload.
    stream.write(vec![1u8; 4096]).await.unwrap();
    stream.write(vec![2u8; 4096]).await.unwrap();
    let first = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    let second = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(&first.payload[..], &[1u8; 4096][..]);
    assert_eq!(&second.payload[..], &[2u8; 4096][..]);
    assert_eq!(second.arg0, local_id);
}

#[tokio::test]
async fn abandoned_open_is_torn_down_without_peer_answer() {
    let (handle, mut peer) = start(false);

    // Drop the open future before the peer reacts at all.
    assert!(timeout(SHORT, handle.open("shell:slow")).await.is_err());

    let open = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(open.command, Command::Open);
    let id = open.arg0;

    // With no answer from the peer, the abandoned request is still torn
    // down and its id freed.
    let close = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(close.command, Command::Close);
    assert_eq!(close.arg0, id);
    assert_eq!(close.arg1, 0);

    // A late acceptance for the reaped id is ignored; new opens proceed.
    peer.send(Packet::bare(Command::Okay, 9, id)).await.unwrap();
    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("shell:next").await.unwrap() }
    });
    let second = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(second.command, Command::Open);
    assert_ne!(second.arg0, id);
    peer.send(Packet::bare(Command::Okay, 9, second.arg0)).await.unwrap();
    open_task.await.unwrap();
}

#[tokio::test]
async fn stale_packets_for_closed_id_are_ignored() {
    let (handle, mut peer) = start(false);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("shell:a").await.unwrap() }
    });
    let first_id = accept_open(&mut peer, 7).await;
    let mut first = open_task.await.unwrap();

    first.close();
    let close = peer.recv().await.unwrap();
    assert_eq!(close.command, Command::Close);
    assert_eq!(close.arg0, first_id);

    // Open a second stream, then fire trailing packets for the dead id.
    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("shell:b").await.unwrap() }
    });
    let second_id = accept_open(&mut peer, 8).await;
    let mut second = open_task.await.unwrap();
    assert_ne!(second_id, first_id);

    peer.send(Packet::new(Command::Write, 7, first_id, &b"stale"[..]))
        .await
        .unwrap();
    peer.send(Packet::bare(Command::Okay, 7, first_id)).await.unwrap();

    // Nothing reaches the new stream, and the dispatcher stays alive.
    assert!(timeout(SHORT, second.read()).await.is_err());
    peer.send(Packet::new(Command::Write, 8, second_id, &b"fresh"[..]))
        .await
        .unwrap();
    assert_eq!(&second.read().await.unwrap().unwrap()[..], b"fresh");
}

#[tokio::test]
async fn dropping_handle_emits_close() {
    let (handle, mut peer) = start(false);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("shell:drop").await.unwrap() }
    });
    let local_id = accept_open(&mut peer, 7).await;
    let stream = open_task.await.unwrap();

    drop(stream);
    let close = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(close.command, Command::Close);
    assert_eq!(close.arg0, local_id);
    assert_eq!(close.arg1, 7);
}

#[tokio::test]
async fn connection_loss_fails_every_stream() {
    let (handle, peer) = start(false);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("shell:x").await.unwrap() }
    });
    let mut peer = peer;
    let local_id = accept_open(&mut peer, 7).await;
    let mut stream = open_task.await.unwrap();
    assert_ne!(local_id, 0);

    drop(peer);

    let err = stream.read().await.unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionClosed), "{err:?}");
    assert!(stream.write(&b"x"[..]).await.is_err());

    // The dispatcher is terminally closed: no new streams.
    assert!(handle.open("shell:y").await.is_err());
    assert!(handle.is_closed());
}

#[tokio::test]
async fn backpressure_defers_acknowledgment_until_consumer_reads() {
    let (handle, mut peer) = start(false);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("sync:").await.unwrap() }
    });
    let local_id = accept_open(&mut peer, 7).await;
    let mut stream = open_task.await.unwrap();

    // Flood past the consumer buffer without reading. The buffer holds 8
    // chunks; the ninth must sit unacknowledged.
    for i in 0..9u8 {
        peer.send(Packet::new(Command::Write, 7, local_id, vec![i; 10]))
            .await
            .unwrap();
    }
    let mut acks = 0;
    while timeout(SHORT, peer.recv()).await.is_ok() {
        acks += 1;
    }
    assert_eq!(acks, 8, "ninth chunk acknowledged before consumer had room");

    // Reading releases the withheld acknowledgment.
    assert_eq!(&stream.read().await.unwrap().unwrap()[..], &[0u8; 10][..]);
    let ack = timeout(LONG, peer.recv()).await.unwrap().unwrap();
    assert_eq!(ack.command, Command::Okay);

    // All nine chunks arrive, in order.
    for i in 1..9u8 {
        assert_eq!(&stream.read().await.unwrap().unwrap()[..], &[i; 10][..]);
    }
}

#[tokio::test]
async fn oversized_write_is_chunked_to_max_payload() {
    let (handle, mut peer) = start(false);

    let open_task = tokio::spawn({
        let handle = handle.clone();
        async move { handle.open("sync:").await.unwrap() }
    });
    let local_id = accept_open(&mut peer, 7).await;
    let mut stream = open_task.await.unwrap();

    // 4096 max payload; 10000 bytes split into 4096 + 4096 + 1808.
    let write_task = tokio::spawn(async move {
        stream.write(vec![3u8; 10000]).await.unwrap();
        stream
    });

    let mut sizes = Vec::new();
    for _ in 0..3 {
        let write = timeout(LONG, peer.recv()).await.unwrap().unwrap();
        assert_eq!(write.command, Command::Write);
        sizes.push(write.payload.len());
        peer.send(Packet::bare(Command::Okay, 7, local_id)).await.unwrap();
    }
    assert_eq!(sizes, vec![4096, 4096, 1808]);
    write_task.await.unwrap();
}
