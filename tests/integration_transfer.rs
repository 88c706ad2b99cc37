// End-to-end transfers through the real stack: engines on both ends, a
// live rendezvous in the middle, QUIC or relay carrying the bytes.

use std::time::Duration;

use relay_core::{ConnectionType, Engine, EngineConfig, Event, TransferState};
use relay_integration_tests::{
    EVENT_TIMEOUT, random_file, start_default_server, start_server, wait_for_event,
};
use relay_proto::CHUNK_SIZE;
use relay_server::ServerConfig;

fn engines(url: &str, force_relay: bool) -> (Engine, relay_core::EventReceiver, Engine, relay_core::EventReceiver) {
    let (sender, sender_events) = Engine::new(EngineConfig {
        signal_server_url: url.to_string(),
        force_relay,
    });
    let (receiver, receiver_events) = Engine::new(EngineConfig {
        signal_server_url: url.to_string(),
        force_relay,
    });
    (sender, sender_events, receiver, receiver_events)
}

/// Drive one whole transfer and return the receiver's save directory.
async fn transfer_roundtrip(force_relay: bool, payload_len: usize) {
    let (url, _registry) = start_default_server().await;
    let (sender, mut sender_events, receiver, mut receiver_events) = engines(&url, force_relay);

    let src_dir = tempfile::tempdir().unwrap();
    let src = random_file(src_dir.path(), "payload.bin", payload_len);
    let save_dir = tempfile::tempdir().unwrap();

    let started = sender.start_send(vec![src.clone()], None).await.unwrap();
    let session = receiver
        .start_receive(&started.code, save_dir.path().to_path_buf(), None)
        .await
        .unwrap();

    // The receiver surfaces the offer; accept it
    let offer = wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::FileOffer { .. })
    })
    .await
    .expect("offer event");
    assert_eq!(offer.0, session);
    receiver.accept_transfer(session, true).await.unwrap();

    // Both sides finish
    wait_for_event(&mut sender_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::TransferComplete { .. })
    })
    .await
    .expect("sender completion");
    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::TransferComplete { .. })
    })
    .await
    .expect("receiver completion");

    // Byte-identical delivery
    let sent = std::fs::read(&src).unwrap();
    let received = std::fs::read(save_dir.path().join("payload.bin")).unwrap();
    assert_eq!(sent.len(), received.len());
    assert_eq!(sent, received);
}

#[tokio::test(flavor = "multi_thread")]
async fn direct_transfer_delivers_identical_bytes() {
    transfer_roundtrip(false, 1024 * 1024).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_transfer_delivers_identical_bytes() {
    transfer_roundtrip(true, 4 * 1024 * 1024).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn chunk_boundary_sizes_roundtrip() {
    // Exactly N chunks, N chunks plus one byte, and the empty file
    for len in [0, 1, CHUNK_SIZE, 2 * CHUNK_SIZE, 2 * CHUNK_SIZE + 1] {
        transfer_roundtrip(false, len).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_type_reported_before_progress() {
    let (url, _registry) = start_default_server().await;
    let (sender, mut sender_events, receiver, mut receiver_events) = engines(&url, false);

    let src_dir = tempfile::tempdir().unwrap();
    let src = random_file(src_dir.path(), "payload.bin", 1024 * 1024);
    let save_dir = tempfile::tempdir().unwrap();

    let started = sender.start_send(vec![src], None).await.unwrap();
    let session = receiver
        .start_receive(&started.code, save_dir.path().to_path_buf(), None)
        .await
        .unwrap();

    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::FileOffer { .. })
    })
    .await
    .expect("offer event");
    receiver.accept_transfer(session, true).await.unwrap();

    // Scan the sender's ordered event stream: the transport decision must
    // land before any throughput report
    let mut saw_connection_type = false;
    let ordered = tokio::time::timeout(EVENT_TIMEOUT, async {
        while let Some((_, event)) = sender_events.recv().await {
            match event {
                Event::ConnectionTypeChanged { connection } => {
                    assert_eq!(connection, ConnectionType::Direct);
                    saw_connection_type = true;
                }
                Event::TransferProgress { .. } => return saw_connection_type,
                Event::TransferComplete { .. } => return saw_connection_type,
                _ => {}
            }
        }
        false
    })
    .await
    .expect("event stream ended early");
    assert!(ordered, "progress before the transport decision");
}

#[tokio::test(flavor = "multi_thread")]
async fn folder_transfer_recreates_structure() {
    let (url, _registry) = start_default_server().await;
    let (sender, _sender_events, receiver, mut receiver_events) = engines(&url, false);

    let src_dir = tempfile::tempdir().unwrap();
    let root = src_dir.path().join("album");
    std::fs::create_dir_all(root.join("raw")).unwrap();
    random_file(&root, "a.jpg", 2048);
    random_file(&root.join("raw"), "b.raw", 4096);

    let save_dir = tempfile::tempdir().unwrap();
    let started = sender.start_send(vec![root.clone()], None).await.unwrap();
    let session = receiver
        .start_receive(&started.code, save_dir.path().to_path_buf(), None)
        .await
        .unwrap();

    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::FileOffer { .. })
    })
    .await
    .expect("offer event");
    receiver.accept_transfer(session, true).await.unwrap();

    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::TransferComplete { .. })
    })
    .await
    .expect("receiver completion");

    assert_eq!(
        std::fs::read(root.join("a.jpg")).unwrap(),
        std::fs::read(save_dir.path().join("album/a.jpg")).unwrap()
    );
    assert_eq!(
        std::fs::read(root.join("raw/b.raw")).unwrap(),
        std::fs::read(save_dir.path().join("album/raw/b.raw")).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn declined_offer_surfaces_peer_rejection() {
    let (url, _registry) = start_default_server().await;
    let (sender, mut sender_events, receiver, mut receiver_events) = engines(&url, false);

    let src_dir = tempfile::tempdir().unwrap();
    let src = random_file(src_dir.path(), "unwanted.bin", 8192);
    let save_dir = tempfile::tempdir().unwrap();

    let started = sender.start_send(vec![src], None).await.unwrap();
    let session = receiver
        .start_receive(&started.code, save_dir.path().to_path_buf(), None)
        .await
        .unwrap();

    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::FileOffer { .. })
    })
    .await
    .expect("offer event");
    receiver.accept_transfer(session, false).await.unwrap();

    let (_, error) = wait_for_event(&mut sender_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::Error { .. })
    })
    .await
    .expect("sender error event");
    let Event::Error { message } = error else {
        unreachable!()
    };
    assert!(message.contains("declined"), "{message}");

    // Nothing was written on the receiving side
    assert_eq!(std::fs::read_dir(save_dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_mid_transfer_removes_partial_file() {
    // Throttle the relay so the transfer is still mid-file when the
    // cancel lands
    let (url, _registry) = start_server(ServerConfig {
        relay_rate_limit: 512 * 1024,
        ..ServerConfig::default()
    })
    .await;
    let (sender, mut sender_events, receiver, mut receiver_events) = engines(&url, true);

    let src_dir = tempfile::tempdir().unwrap();
    let src = random_file(src_dir.path(), "big.bin", 8 * 1024 * 1024);
    let save_dir = tempfile::tempdir().unwrap();

    let started = sender.start_send(vec![src], None).await.unwrap();
    let session = receiver
        .start_receive(&started.code, save_dir.path().to_path_buf(), None)
        .await
        .unwrap();

    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::FileOffer { .. })
    })
    .await
    .expect("offer event");
    receiver.accept_transfer(session, true).await.unwrap();

    // Wait until bytes are actually moving, then pull the plug
    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(e, Event::TransferProgress { .. })
    })
    .await
    .expect("progress event");
    sender
        .cancel_transfer(started.session_id)
        .await
        .unwrap();

    wait_for_event(&mut sender_events, EVENT_TIMEOUT, |e| {
        matches!(
            e,
            Event::StateChanged {
                state: TransferState::Cancelled
            }
        )
    })
    .await
    .expect("sender cancelled");
    wait_for_event(&mut receiver_events, EVENT_TIMEOUT, |e| {
        matches!(
            e,
            Event::StateChanged {
                state: TransferState::Cancelled
            }
        )
    })
    .await
    .expect("receiver cancelled");

    // The partial output is gone
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!save_dir.path().join("big.bin").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_code_fails_without_writing_to_disk() {
    // Peers that paired on the rendezvous but disagree on the code derive
    // different keys; the fingerprint exchange is where that dies
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use relay_crypto::{ChunkCipher, PakeExchange, PakeRole};
    use relay_proto::{PeerInfo, Role, SignalMessage};
    use relay_transport::SignalingClient;

    let (url, _registry) = start_default_server().await;

    let run_side = |url: String, role: Role, code: &'static str| async move {
        let mut signaling = SignalingClient::connect(&url, "7-guitar-palace")
            .await
            .unwrap();
        signaling
            .send(&SignalMessage::Register {
                role,
                peer_info: Some(PeerInfo {
                    local_ip: "127.0.0.1".parse().unwrap(),
                    local_port: 40000,
                }),
            })
            .await
            .unwrap();

        // peer_joined
        loop {
            if let SignalMessage::PeerJoined { .. } =
                signaling.recv_timeout(Duration::from_secs(10)).await.unwrap()
            {
                break;
            }
        }

        let pake_role = match role {
            Role::Sender => PakeRole::Sender,
            Role::Receiver => PakeRole::Receiver,
        };
        let (pake, outbound) = PakeExchange::start(pake_role, code);
        signaling
            .send(&SignalMessage::Spake2 {
                payload: BASE64.encode(&outbound),
            })
            .await
            .unwrap();

        let peer_pake = loop {
            if let SignalMessage::Spake2 { payload } =
                signaling.recv_timeout(Duration::from_secs(10)).await.unwrap()
            {
                break BASE64.decode(payload).unwrap();
            }
        };
        let key = pake.finish(&peer_pake).unwrap();

        // Encrypted fingerprint exchange: the peer's frame must not open
        let (nonce, sealed) = ChunkCipher::seal_detached(&key, &[0x42; 32]).unwrap();
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&sealed);
        signaling
            .send(&SignalMessage::CertFingerprint {
                payload: BASE64.encode(&payload),
            })
            .await
            .unwrap();

        let raw = loop {
            if let SignalMessage::CertFingerprint { payload } =
                signaling.recv_timeout(Duration::from_secs(10)).await.unwrap()
            {
                break BASE64.decode(payload).unwrap();
            }
        };
        let peer_nonce: [u8; 12] = raw[..12].try_into().unwrap();
        ChunkCipher::open_detached(&key, &peer_nonce, &raw[12..])
    };

    let sender = tokio::spawn(run_side(url.clone(), Role::Sender, "7-guitar-palace"));
    let receiver = tokio::spawn(run_side(url, Role::Receiver, "7-guitar-castle"));

    let sender_outcome = sender.await.unwrap();
    let receiver_outcome = receiver.await.unwrap();

    // Both sides detect the mismatch; no plaintext ever moved
    assert!(sender_outcome.is_err());
    assert!(receiver_outcome.is_err());
}
