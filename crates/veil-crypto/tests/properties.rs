//! End-to-end properties, run against every engine compiled in.

use std::collections::BTreeSet;

use veil_crypto::{
    Account, CryptoConfig, CryptoContext, CryptoError, Engine, InboundGroupSession, MessageType,
    OutboundGroupSession, PickleKey, PublishedKeyDirectory, Session,
};

fn engines() -> Vec<Engine> {
    let mut engines = vec![Engine::software().unwrap()];
    #[cfg(feature = "native")]
    engines.push(Engine::native().unwrap());
    engines
}

/// Bob opens a session to Alice over one of her published keys and Alice
/// answers the handshake. Returns (alice, bob) sessions.
fn paired(engine: &Engine) -> (Session, Session) {
    let alice = Account::new(engine).unwrap();
    let bob = Account::new(engine).unwrap();
    alice.generate_one_time_keys(1).unwrap();
    let directory = PublishedKeyDirectory::new(alice.identity_keys());
    directory.publish(&alice);
    let claimed = directory.claim().unwrap();

    let bob_session = Session::create_outbound(
        &bob,
        &claimed.identity_keys.curve25519,
        &claimed.one_time_key.public_key,
    )
    .unwrap();
    let first = bob_session.encrypt(b"handshake").unwrap();
    let (alice_session, plaintext) =
        Session::create_inbound(&alice, &bob.identity_keys().curve25519, &first).unwrap();
    assert_eq!(plaintext, b"handshake");
    (alice_session, bob_session)
}

#[test]
fn alice_and_bob_scenario() {
    for engine in engines() {
        let alice = Account::new(&engine).unwrap();
        let bob = Account::new(&engine).unwrap();

        alice.generate_one_time_keys(5).unwrap();
        assert_eq!(alice.one_time_keys().len(), 5);
        let directory = PublishedKeyDirectory::new(alice.identity_keys());
        assert_eq!(directory.publish(&alice), 5);
        assert!(alice.one_time_keys().is_empty());

        directory.claim().unwrap();
        directory.claim().unwrap();
        let third = directory.claim().unwrap();
        assert!(!third.is_fallback);

        let bob_session = Session::create_outbound(
            &bob,
            &third.identity_keys.curve25519,
            &third.one_time_key.public_key,
        )
        .unwrap();
        let hello = bob_session.encrypt(b"hello").unwrap();
        assert_eq!(hello.message_type, MessageType::PreKey);

        let (alice_session, plaintext) =
            Session::create_inbound(&alice, &bob.identity_keys().curve25519, &hello).unwrap();
        assert_eq!(plaintext, b"hello", "{}", engine.kind());
        assert_eq!(alice_session.session_id(), bob_session.session_id());

        let hi = alice_session.encrypt(b"hi").unwrap();
        assert_eq!(hi.message_type, MessageType::Normal);
        assert_eq!(bob_session.decrypt(&hi).unwrap(), b"hi");
    }
}

#[test]
fn fifty_interleaved_messages_round_trip() {
    for engine in engines() {
        let (alice, bob) = paired(&engine);
        for i in 0..50 {
            // Bursts of three in one direction, then a switch.
            let (sender, receiver) = if (i / 3) % 2 == 0 {
                (&alice, &bob)
            } else {
                (&bob, &alice)
            };
            let plaintext = format!("message {i} on {}", engine.kind());
            let message = sender.encrypt(plaintext.as_bytes()).unwrap();
            assert_eq!(receiver.decrypt(&message).unwrap(), plaintext.as_bytes());
        }
    }
}

#[test]
fn framing_follows_first_received_message() {
    for engine in engines() {
        let alice = Account::new(&engine).unwrap();
        let bob = Account::new(&engine).unwrap();
        alice.generate_one_time_keys(1).unwrap();
        let (_, otk) = alice.one_time_keys().into_iter().next().unwrap();

        let bob_session =
            Session::create_outbound(&bob, &alice.identity_keys().curve25519, &otk).unwrap();
        assert!(!bob_session.has_received_message());

        // Every message before a reply arrives carries the handshake.
        let first = bob_session.encrypt(b"one").unwrap();
        let second = bob_session.encrypt(b"two").unwrap();
        assert_eq!(first.message_type, MessageType::PreKey);
        assert_eq!(second.message_type, MessageType::PreKey);

        let (alice_session, _) =
            Session::create_inbound(&alice, &bob.identity_keys().curve25519, &first).unwrap();
        assert!(alice_session.matches_prekey_message(&second));
        assert_eq!(alice_session.decrypt(&second).unwrap(), b"two");
        assert_eq!(
            alice_session.encrypt(b"reply").unwrap().message_type,
            MessageType::Normal
        );

        let reply = alice_session.encrypt(b"reply").unwrap();
        bob_session.decrypt(&reply).unwrap();
        assert!(bob_session.has_received_message());
        for _ in 0..5 {
            assert_eq!(
                bob_session.encrypt(b"after").unwrap().message_type,
                MessageType::Normal
            );
        }
    }
}

#[test]
fn failed_decrypt_leaves_session_usable() {
    for engine in engines() {
        let (alice, bob) = paired(&engine);
        let mut message = alice.encrypt(b"intact").unwrap();
        let last = message.body.len() - 1;
        message.body[last] ^= 0x01;
        assert!(matches!(
            bob.decrypt(&message),
            Err(CryptoError::Decryption(_))
        ));
        message.body[last] ^= 0x01;
        assert_eq!(bob.decrypt(&message).unwrap(), b"intact");
    }
}

#[test]
fn one_time_keys_are_unique_and_publication_survives_pickling() {
    for engine in engines() {
        let account = Account::new(&engine).unwrap();
        account.generate_one_time_keys(20).unwrap();
        account.generate_one_time_keys(20).unwrap();

        let keys = account.one_time_keys();
        assert_eq!(keys.len(), 40);
        let ids: BTreeSet<_> = keys.keys().cloned().collect();
        let publics: BTreeSet<_> = keys.values().cloned().collect();
        assert_eq!(ids.len(), 40);
        assert_eq!(publics.len(), 40);

        account.mark_keys_as_published();
        assert!(account.one_time_keys().is_empty());

        let key = PickleKey::generate().unwrap();
        let blob = account.pickle(&key).unwrap();
        let restored = Account::unpickle(&engine, &blob, &key).unwrap();
        assert!(restored.one_time_keys().is_empty());
        assert_eq!(restored.identity_keys(), account.identity_keys());

        restored.generate_one_time_keys(5).unwrap();
        for id in restored.one_time_keys().keys() {
            assert!(!ids.contains(id), "key id {id} reused after unpickling");
        }
    }
}

#[test]
fn sessions_survive_pickling() {
    for engine in engines() {
        let (alice, bob) = paired(&engine);
        let key = PickleKey::derive("correct horse", b"saltsaltsaltsalt", 1_000).unwrap();

        let restored = Session::unpickle(&engine, &bob.pickle(&key).unwrap(), &key).unwrap();
        let message = alice.encrypt(b"after restore").unwrap();
        assert_eq!(restored.decrypt(&message).unwrap(), b"after restore");

        let wrong = PickleKey::generate().unwrap();
        assert!(matches!(
            Session::unpickle(&engine, &alice.pickle(&key).unwrap(), &wrong),
            Err(CryptoError::CorruptState(_))
        ));
    }
}

#[test]
fn group_indices_are_monotonic() {
    for engine in engines() {
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let inbound =
            InboundGroupSession::import(&engine, &outbound.export_session_key().unwrap()).unwrap();

        let messages: Vec<_> = (0..10)
            .map(|i| outbound.encrypt(format!("group {i}").as_bytes()).unwrap())
            .collect();
        let indices: Vec<u32> = messages.iter().map(|m| m.message_index).collect();
        assert_eq!(indices, (0..10).collect::<Vec<u32>>());
        assert_eq!(outbound.message_index(), 10);

        for (i, message) in messages.iter().enumerate() {
            let decrypted = inbound.decrypt(message).unwrap();
            assert_eq!(decrypted.message_index as usize, i);
            assert_eq!(decrypted.plaintext, format!("group {i}").as_bytes());
        }

        // A member who joins late only sees history from index 4 on.
        let partial = inbound.export_at(4).unwrap().unwrap();
        let late = InboundGroupSession::import(&engine, &partial).unwrap();
        assert_eq!(late.first_known_index(), 4);
        for message in &messages[..4] {
            assert!(matches!(
                late.decrypt(message),
                Err(CryptoError::Decryption(_))
            ));
        }
        for message in &messages[4..] {
            assert_eq!(
                late.decrypt(message).unwrap().message_index,
                message.message_index
            );
        }
        assert!(late.export_at(3).unwrap().is_none());
        assert_eq!(late.first_known_index(), 4);
    }
}

#[test]
fn group_key_shared_mid_stream_starts_at_current_index() {
    for engine in engines() {
        let outbound = OutboundGroupSession::new(&engine).unwrap();
        let early = outbound.encrypt(b"before").unwrap();
        let key = outbound.export_session_key().unwrap();
        assert_eq!(key.message_index, 1);

        let blob = key.to_blob().unwrap();
        let inbound = InboundGroupSession::import(
            &engine,
            &veil_crypto::ExportedGroupKey::from_blob(&blob).unwrap(),
        )
        .unwrap();
        assert_eq!(inbound.first_known_index(), 1);
        assert!(inbound.decrypt(&early).is_err());
        let later = outbound.encrypt(b"after").unwrap();
        assert_eq!(inbound.decrypt(&later).unwrap().plaintext, b"after");
    }
}

fn context() -> CryptoContext {
    CryptoContext::in_memory(CryptoConfig {
        force_fallback: true,
        pbkdf2_iterations: 1_000,
        initial_one_time_keys: 5,
        ..CryptoConfig::default()
    })
}

#[tokio::test]
async fn device_mismatch_requires_reset() {
    let context = context();
    let user = "@u:example.org";

    let first = context
        .initialize_identity(user, "A", None, Some("secret"))
        .await
        .unwrap();
    assert!(!first.has_mismatch);
    assert!(first.identity.is_some());

    let second = context
        .initialize_identity(user, "B", None, Some("secret"))
        .await
        .unwrap();
    assert!(second.has_mismatch);
    assert!(second.identity.is_none());
    assert_eq!(second.conflicting_device_id.as_deref(), Some("A"));

    // The record of A is untouched by the refused attempt.
    let again = context
        .initialize_identity(user, "A", None, Some("secret"))
        .await
        .unwrap();
    assert!(!again.identity.unwrap().created);

    assert!(context.clear_persisted_identity(user).unwrap());
    let third = context
        .initialize_identity(user, "B", None, Some("secret"))
        .await
        .unwrap();
    assert!(!third.has_mismatch);
    let identity = third.identity.unwrap();
    assert!(identity.created);
    assert_eq!(identity.device.device_id, "B");
}

#[tokio::test]
async fn fallback_context_supports_full_scenario() {
    let context = context();
    let engine = context.initialize().await.unwrap();
    assert!(context.is_backend_available());
    assert!(!context.is_native_active());

    let (alice, bob) = paired(&engine);
    let message = bob.encrypt(b"fallback").unwrap();
    assert_eq!(alice.decrypt(&message).unwrap(), b"fallback");
}

#[cfg(feature = "native")]
#[test]
fn backends_do_not_read_each_others_pickles() {
    let software = Engine::software().unwrap();
    let native = Engine::native().unwrap();
    let key = PickleKey::generate().unwrap();

    let blob = Account::new(&software).unwrap().pickle(&key).unwrap();
    assert!(matches!(
        Account::unpickle(&native, &blob, &key),
        Err(CryptoError::BackendMismatch { .. })
    ));
}
