#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end handshake tests against a scripted peer on an in-memory
//! duplex channel.

use bridge_protocol::auth::{Credential, KeyStore};
use bridge_protocol::config::{BridgeConfig, VERSION};
use bridge_protocol::core::banner::Feature;
use bridge_protocol::core::packet::{
    Command, Packet, AUTH_RSA_PUBLIC_KEY, AUTH_SIGNATURE, AUTH_TOKEN,
};
use bridge_protocol::error::BridgeError;
use bridge_protocol::protocol::{dispatcher, establish};
use bridge_protocol::transport::Connection;
use tokio::io::DuplexStream;

const DEVICE_BANNER: &[u8] =
    b"device::ro.product.name=NovaPro;ro.product.model=NovaPro;ro.product.device=NovaPro;features=shell_v2,cmd";

fn test_config(key_dir: &std::path::Path) -> BridgeConfig {
    BridgeConfig::default_with_overrides(|c| {
        c.transport.address = "test:0".into();
        c.auth.key_dir = key_dir.to_path_buf();
    })
}

fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
    let (client, peer) = tokio::io::duplex(256 * 1024);
    (Connection::new(client), Connection::new(peer))
}

#[tokio::test]
async fn direct_connect_without_auth() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = KeyStore::open(dir.path(), "t@h").unwrap();
    let (mut client, mut peer) = pair();

    let client_task = tokio::spawn(async move {
        let session = establish(&mut client, &config, &store).await.unwrap();
        (client, session)
    });

    // =================== Peer: accept immediately ===================
    let connect = peer.recv().await.unwrap();
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(connect.arg0, VERSION);
    assert!(connect.payload.starts_with(b"host::features="));
    assert_eq!(*connect.payload.last().unwrap(), 0);

    peer.send(Packet::new(Command::Connect, VERSION, 4096, DEVICE_BANNER))
        .await
        .unwrap();

    let (_client, session) = client_task.await.unwrap();
    assert_eq!(session.banner.product, "NovaPro");
    assert_eq!(session.banner.model, "NovaPro");
    assert_eq!(session.banner.device, "NovaPro");
    assert!(session.features.contains(&Feature::ShellV2));
    assert!(!session.features.delayed_ack());
    // Remote offered a smaller ceiling; it wins.
    assert_eq!(session.max_payload, 4096);
    // Both sides at the current version: legacy checksum skipped.
    assert!(!session.validate_checksum());
}

#[tokio::test]
async fn full_scenario_two_credentials_then_stream() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = KeyStore::open(dir.path(), "t@h").unwrap();

    // Two stored credentials; the peer rejects the first signature.
    store.persist(&Credential::generate("t@h").unwrap()).unwrap();
    store.persist(&Credential::generate("t@h").unwrap()).unwrap();

    let (mut client, mut peer) = pair();
    let client_config = config.clone();
    let client_task = tokio::spawn(async move {
        let session = establish(&mut client, &client_config, &store)
            .await
            .unwrap();
        (client, session)
    });

    // =================== Step 1: challenge ===================
    let connect = peer.recv().await.unwrap();
    assert_eq!(connect.command, Command::Connect);
    let challenge = [0x5au8; 20];
    peer.send(Packet::new(Command::Auth, AUTH_TOKEN, 0, challenge.to_vec()))
        .await
        .unwrap();

    // =================== Step 2: reject credential A ===================
    let first = peer.recv().await.unwrap();
    assert_eq!(first.command, Command::Auth);
    assert_eq!(first.arg0, AUTH_SIGNATURE);
    assert_eq!(first.payload.len(), 256);
    let challenge2 = [0xa5u8; 20];
    peer.send(Packet::new(Command::Auth, AUTH_TOKEN, 0, challenge2.to_vec()))
        .await
        .unwrap();

    // =================== Step 3: accept credential B ===================
    let second = peer.recv().await.unwrap();
    assert_eq!(second.command, Command::Auth);
    assert_eq!(second.arg0, AUTH_SIGNATURE);
    assert_ne!(first.payload, second.payload, "distinct keys, distinct signatures");
    peer.send(Packet::new(Command::Connect, VERSION, 0, DEVICE_BANNER))
        .await
        .unwrap();

    let (client, session) = client_task.await.unwrap();
    assert_eq!(session.banner.product, "NovaPro");
    assert!(session.features.contains(&Feature::ShellV2));

    // =================== Step 4: open a stream, receive, close ===================
    let handle = dispatcher::start(client, session);
    let open_task = tokio::spawn(async move {
        let mut stream = handle.open("shell:echo hi").await.unwrap();
        let chunk = stream.read().await.unwrap().expect("one chunk");
        assert_eq!(&chunk[..], b"hi\n");
        assert!(stream.read().await.unwrap().is_none(), "clean end of stream");
        handle
    });

    let open = peer.recv().await.unwrap();
    assert_eq!(open.command, Command::Open);
    assert_eq!(&open.payload[..], b"shell:echo hi\0");
    let local_id = open.arg0;
    assert_ne!(local_id, 0);

    peer.send(Packet::bare(Command::Okay, 7, local_id)).await.unwrap();
    peer.send(Packet::new(Command::Write, 7, local_id, &b"hi\n"[..]))
        .await
        .unwrap();

    // The dispatcher credits the write back once the buffer absorbed it.
    let okay = peer.recv().await.unwrap();
    assert_eq!(okay.command, Command::Okay);
    assert_eq!(okay.arg0, local_id);
    assert_eq!(okay.arg1, 7);

    peer.send(Packet::bare(Command::Close, 7, local_id)).await.unwrap();

    open_task.await.unwrap();
}

#[tokio::test]
async fn exhausted_credentials_offer_fresh_key() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = KeyStore::open(dir.path(), "fresh@host").unwrap();
    let (mut client, mut peer) = pair();

    let client_task = tokio::spawn(async move {
        establish(&mut client, &config, &store).await
    });

    let _connect = peer.recv().await.unwrap();
    peer.send(Packet::new(Command::Auth, AUTH_TOKEN, 0, vec![1u8; 20]))
        .await
        .unwrap();

    // Empty store: the client must offer a freshly generated public key.
    let offer = peer.recv().await.unwrap();
    assert_eq!(offer.command, Command::Auth);
    assert_eq!(offer.arg0, AUTH_RSA_PUBLIC_KEY);
    assert_eq!(*offer.payload.last().unwrap(), 0);
    let text = std::str::from_utf8(&offer.payload[..offer.payload.len() - 1]).unwrap();
    let (_blob, name) = text.split_once(' ').unwrap();
    assert_eq!(name, "fresh@host");

    // The key was persisted once the offer went out.
    let stored = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("pem")
        })
        .count();
    assert_eq!(stored, 1);

    // User approves on the device: connect arrives.
    peer.send(Packet::new(Command::Connect, VERSION, 0, DEVICE_BANNER))
        .await
        .unwrap();
    let session = client_task.await.unwrap().unwrap();
    assert_eq!(session.banner.product, "NovaPro");
}

#[tokio::test]
async fn declined_key_offer_exhausts_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = KeyStore::open(dir.path(), "t@h").unwrap();
    let (mut client, mut peer) = pair();

    let client_task = tokio::spawn(async move {
        establish(&mut client, &config, &store).await
    });

    let _connect = peer.recv().await.unwrap();
    peer.send(Packet::new(Command::Auth, AUTH_TOKEN, 0, vec![2u8; 20]))
        .await
        .unwrap();

    let offer = peer.recv().await.unwrap();
    assert_eq!(offer.arg0, AUTH_RSA_PUBLIC_KEY);

    // A further challenge after the offer means the user declined.
    peer.send(Packet::new(Command::Auth, AUTH_TOKEN, 0, vec![3u8; 20]))
        .await
        .unwrap();

    let err = client_task.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::AuthExhausted(_)), "{err:?}");
}

#[tokio::test]
async fn unexpected_command_fails_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = KeyStore::open(dir.path(), "t@h").unwrap();
    let (mut client, mut peer) = pair();

    let client_task = tokio::spawn(async move {
        establish(&mut client, &config, &store).await
    });

    let _connect = peer.recv().await.unwrap();
    peer.send(Packet::new(Command::Write, 1, 2, &b"nope"[..]))
        .await
        .unwrap();

    let err = client_task.await.unwrap().unwrap_err();
    assert!(
        matches!(err, BridgeError::ProtocolViolation { command: "WRTE", .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn remote_version_below_floor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = KeyStore::open(dir.path(), "t@h").unwrap();
    let (mut client, mut peer) = pair();

    let client_task = tokio::spawn(async move {
        establish(&mut client, &config, &store).await
    });

    let _connect = peer.recv().await.unwrap();
    peer.send(Packet::new(Command::Connect, 0x00ff_0000, 0, DEVICE_BANNER))
        .await
        .unwrap();

    let err = client_task.await.unwrap().unwrap_err();
    assert!(
        matches!(err, BridgeError::UnsupportedVersion(0x00ff_0000)),
        "{err:?}"
    );
}

#[tokio::test]
async fn older_remote_version_enables_checksum_validation() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = KeyStore::open(dir.path(), "t@h").unwrap();
    let (mut client, mut peer) = pair();

    let client_task = tokio::spawn(async move {
        establish(&mut client, &config, &store).await.unwrap()
    });

    let _connect = peer.recv().await.unwrap();
    peer.send(Packet::new(Command::Connect, 0x0100_0000, 0, DEVICE_BANNER))
        .await
        .unwrap();

    let session = client_task.await.unwrap();
    assert_eq!(session.version, 0x0100_0000);
    assert!(session.validate_checksum());
}
