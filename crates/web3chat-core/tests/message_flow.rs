//! End-to-end message flow over both backends: wallet identity, session,
//! encryption, persistence and live delivery, with no mocking of the crypto.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use web3chat_core::{
    BackendConfig, ChatError, IdentityProvider, MessageStore, Messenger, RetryPolicy, StaticWallet,
    StoreConfig, StoreState, WalletIdentityProvider,
};
use web3chat_crypto::{CryptoError, KeyPair};

fn sqlite_config(dir: &tempfile::TempDir) -> StoreConfig {
    StoreConfig {
        backend: BackendConfig::Sqlite {
            path: dir.path().join("chat.db").to_string_lossy().into_owned(),
        },
        retry: RetryPolicy::immediate(3),
    }
}

fn memory_config() -> StoreConfig {
    StoreConfig {
        backend: BackendConfig::Memory,
        retry: RetryPolicy::immediate(3),
    }
}

async fn two_party_exchange(config: &StoreConfig) {
    let store = Arc::new(MessageStore::from_config(config).expect("store opens"));
    let alice_keys = KeyPair::from_seed(&[7u8; 32]).unwrap();
    let bob_keys = KeyPair::generate().unwrap();
    let alice = Messenger::new("0xAAA", alice_keys, Arc::clone(&store));
    let bob = Messenger::new("0xBBB", bob_keys, Arc::clone(&store));
    alice.connect().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bob.add_contact("0xaaa", *alice.public_key());
    let _watch = bob
        .watch(move |m| {
            let _ = tx.send(m);
        })
        .unwrap();

    alice.send("0xbbb", bob.public_key(), "gm").await.unwrap();
    bob.send("0xaaa", alice.public_key(), "gm, ser").await.unwrap();

    let live = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("live delivery")
        .expect("channel open")
        .expect("live envelope decrypts");
    assert_eq!(live.plaintext, "gm");

    for (me, peer) in [(&alice, &bob), (&bob, &alice)] {
        let texts: Vec<String> = me
            .conversation(peer.identity().as_str(), peer.public_key())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.unwrap().plaintext)
            .collect();
        assert_eq!(texts, vec!["gm", "gm, ser"]);
    }

    // The backend only ever holds ciphertext.
    for envelope in store.query("0xaaa").await.unwrap() {
        assert!(envelope.ciphertext != "gm" && envelope.ciphertext != "gm, ser");
    }

    store.close();
}

// ── Both backends ────────────────────────────────────────────────────

#[tokio::test]
async fn exchange_over_memory_backend() {
    two_party_exchange(&memory_config()).await;
}

#[tokio::test]
async fn exchange_over_sqlite_backend() {
    let dir = tempfile::TempDir::new().unwrap();
    two_party_exchange(&sqlite_config(&dir)).await;
}

// ── Persistence ──────────────────────────────────────────────────────

#[tokio::test]
async fn sqlite_history_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = sqlite_config(&dir);
    let bob_keys = KeyPair::from_seed(&[2u8; 32]).unwrap();
    let bob_public = *bob_keys.public_key();

    let sent_id = {
        let store = Arc::new(MessageStore::from_config(&config).unwrap());
        let alice = Messenger::new("0xa", KeyPair::from_seed(&[1u8; 32]).unwrap(), store.clone());
        alice.connect().await.unwrap();
        let sent = alice.send("0xb", &bob_public, "persisted").await.unwrap();
        store.close();
        sent.id
    };

    let store = Arc::new(MessageStore::from_config(&config).unwrap());
    let bob = Messenger::new("0xb", bob_keys, store.clone());
    bob.connect().await.unwrap();
    let alice_public = *KeyPair::from_seed(&[1u8; 32]).unwrap().public_key();

    let history = bob.conversation("0xa", &alice_public).await.unwrap();
    assert_eq!(history.len(), 1);
    let message = history[0].as_ref().unwrap();
    assert_eq!(message.id, sent_id);
    assert_eq!(message.plaintext, "persisted");
    assert!(!message.read);

    assert!(bob.mark_read(&sent_id).await.unwrap().read);
}

// ── Failure surfaces ─────────────────────────────────────────────────

#[tokio::test]
async fn tampered_ciphertext_is_an_error_not_empty_text() {
    let store = Arc::new(MessageStore::from_config(&memory_config()).unwrap());
    let alice = Messenger::new("0xa", KeyPair::generate().unwrap(), store.clone());
    let bob = Messenger::new("0xb", KeyPair::generate().unwrap(), store.clone());
    alice.connect().await.unwrap();

    let mut envelope = alice.send("0xb", bob.public_key(), "secret").await.unwrap();
    let mut bytes = envelope.ciphertext.into_bytes();
    let last = bytes.len() - 3;
    bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
    envelope.ciphertext = String::from_utf8(bytes).unwrap();

    let err = bob.open(&envelope, alice.public_key()).unwrap_err();
    assert!(matches!(
        err,
        ChatError::Crypto(CryptoError::DecryptionFailure(_))
    ));
}

#[tokio::test]
async fn wrong_peer_key_fails_per_message() {
    let store = Arc::new(MessageStore::from_config(&memory_config()).unwrap());
    let alice = Messenger::new("0xa", KeyPair::generate().unwrap(), store.clone());
    let bob = Messenger::new("0xb", KeyPair::generate().unwrap(), store.clone());
    let mallory = KeyPair::generate().unwrap();
    alice.connect().await.unwrap();

    alice.send("0xb", bob.public_key(), "one").await.unwrap();
    alice.send("0xb", bob.public_key(), "two").await.unwrap();

    let history = bob.conversation("0xa", mallory.public_key()).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(Result::is_err));
}

// ── Wallet-driven lifecycle ──────────────────────────────────────────

#[tokio::test]
async fn wallet_identity_drives_store_connection() {
    let provider = WalletIdentityProvider::new();
    let store = MessageStore::from_config(&memory_config()).unwrap();

    provider
        .connect(Arc::new(StaticWallet::metamask("0xFeEd", 1)))
        .await
        .unwrap();
    let identity = provider.current_identity().unwrap();
    store.connect(identity.as_str()).await.unwrap();
    assert_eq!(store.state(), StoreState::Connected);
    assert!(store.sessions().cached(&identity).is_some());

    provider.disconnect().await.unwrap();
    assert!(provider.current_identity().is_none());
    store.disconnect().await.unwrap();
    assert_eq!(store.state(), StoreState::Disconnected);
    assert!(store.sessions().cached(&identity).is_none());
    assert_eq!(
        store.query("0xfeed").await.unwrap_err(),
        ChatError::NotConnected
    );
}
