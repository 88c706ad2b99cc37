// Property tests for the wire codec and the chunk cipher.

use proptest::prelude::*;
use uuid::Uuid;

use relay_crypto::{ChunkCipher, PakeExchange, PakeRole};
use relay_proto::{CHUNK_SIZE, FileDescriptor, PeerMessage, TransferCode};

fn session_key() -> relay_crypto::SessionKey {
    let (a, msg_a) = PakeExchange::start(PakeRole::Sender, "0-acorn-amber");
    let (b, msg_b) = PakeExchange::start(PakeRole::Receiver, "0-acorn-amber");
    let key = a.finish(&msg_b).unwrap();
    let _ = b.finish(&msg_a).unwrap();
    key
}

fn arb_descriptor() -> impl Strategy<Value = FileDescriptor> {
    (
        "[a-z]{1,16}\\.[a-z]{1,4}",
        any::<u64>(),
        proptest::option::of("[a-z]{1,8}(/[a-z]{1,8}){0,3}"),
    )
        .prop_map(|(name, size, relative_path)| FileDescriptor {
            name,
            size,
            relative_path,
        })
}

fn arb_message() -> impl Strategy<Value = PeerMessage> {
    prop_oneof![
        (
            any::<[u8; 16]>(),
            proptest::collection::vec(arb_descriptor(), 0..4)
        )
            .prop_map(|(id, files)| PeerMessage::FileOffer {
                session_id: Uuid::from_bytes(id),
                files,
            }),
        Just(PeerMessage::FileAccept),
        Just(PeerMessage::FileDecline),
        (
            any::<u16>(),
            any::<u32>(),
            any::<[u8; 12]>(),
            proptest::collection::vec(any::<u8>(), 0..2048)
        )
            .prop_map(|(file_index, chunk_index, nonce, ciphertext)| {
                PeerMessage::FileChunk {
                    file_index,
                    chunk_index,
                    nonce,
                    ciphertext,
                }
            }),
        (any::<u16>(), any::<[u8; 32]>()).prop_map(|(file_index, sha256)| {
            PeerMessage::FileComplete { file_index, sha256 }
        }),
        any::<u16>().prop_map(|file_index| PeerMessage::FileVerified { file_index }),
        Just(PeerMessage::TransferComplete),
        "[ -~]{0,64}".prop_map(|reason| PeerMessage::Cancel { reason }),
        Just(PeerMessage::Ping),
        Just(PeerMessage::Pong),
    ]
}

proptest! {
    #[test]
    fn every_message_roundtrips(message in arb_message()) {
        let frame = message.encode().unwrap();
        let decoded = PeerMessage::decode(&frame).unwrap();
        prop_assert_eq!(decoded, message);
    }

    #[test]
    fn truncation_never_panics(message in arb_message(), cut in 0usize..64) {
        let frame = message.encode().unwrap();
        let cut = cut.min(frame.len());
        // Any prefix either decodes to the original or errors cleanly
        let _ = PeerMessage::decode(&frame[..frame.len() - cut]);
    }

    #[test]
    fn generated_codes_always_parse(seed in any::<u64>()) {
        let _ = seed; // entropy comes from the generator itself
        let code = TransferCode::generate();
        prop_assert!(TransferCode::parse(code.as_str()).is_ok());
    }
}

#[test]
fn chunk_boundaries_seal_and_reassemble() {
    let key = session_key();

    // Exactly N chunks, N chunks plus a 1-byte tail, and the empty file
    for (len, expected_chunks, last_len) in [
        (0, 0, None),
        (1, 1, Some(1)),
        (CHUNK_SIZE, 1, Some(CHUNK_SIZE)),
        (2 * CHUNK_SIZE, 2, Some(CHUNK_SIZE)),
        (2 * CHUNK_SIZE + 1, 3, Some(1)),
    ] {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut sealer = ChunkCipher::with_prefix(&key, [9, 9, 9, 9]);
        let opener = ChunkCipher::new(&key);

        let mut reassembled = Vec::new();
        let mut chunks = 0usize;
        let mut last = None;
        for chunk in data.chunks(CHUNK_SIZE) {
            let (nonce, ciphertext) = sealer.seal(chunk).unwrap();
            // Ciphertext is plaintext plus the 16-byte tag
            assert_eq!(ciphertext.len(), chunk.len() + 16);
            reassembled.extend(opener.open(&nonce, &ciphertext).unwrap());
            chunks += 1;
            last = Some(chunk.len());
        }

        assert_eq!(chunks, expected_chunks, "len {len}");
        assert_eq!(last, last_len, "len {len}");
        assert_eq!(reassembled, data, "len {len}");
    }
}

#[test]
fn nonces_carry_prefix_then_counter() {
    let key = session_key();
    let mut cipher = ChunkCipher::with_prefix(&key, [1, 2, 3, 4]);

    for expected in 0u64..256 {
        let (nonce, _) = cipher.seal(b"payload").unwrap();
        assert_eq!(&nonce[..4], &[1, 2, 3, 4]);
        assert_eq!(u64::from_be_bytes(nonce[4..].try_into().unwrap()), expected);
    }
}

#[test]
fn sealed_chunks_only_open_with_the_right_key() {
    let key = session_key();
    let mut cipher = ChunkCipher::new(&key);
    let (nonce, ciphertext) = cipher.seal(&vec![7u8; CHUNK_SIZE]).unwrap();

    // Same key works
    let opener = ChunkCipher::new(&key);
    assert_eq!(
        opener.open(&nonce, &ciphertext).unwrap(),
        vec![7u8; CHUNK_SIZE]
    );

    // A divergent key (different code) does not
    let (a, _msg_a) = PakeExchange::start(PakeRole::Sender, "1-bell-coin");
    let (_b, msg_b) = PakeExchange::start(PakeRole::Receiver, "1-bell-coin");
    let other_key = a.finish(&msg_b).unwrap();
    let wrong = ChunkCipher::new(&other_key);
    assert!(wrong.open(&nonce, &ciphertext).is_err());
}
