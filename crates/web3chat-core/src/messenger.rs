//! Encrypt-on-send / decrypt-on-read facade over a [`MessageStore`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use web3chat_crypto::{decrypt, encrypt, CryptoError, KeyPair, PublicKey};

use crate::envelope::Envelope;
use crate::error::ChatError;
use crate::identity::{canonicalize, Identity};
use crate::store::{MessageStore, SubscriptionHandle};

/// An envelope whose ciphertext opened successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedMessage {
    pub id: String,
    pub sender_id: Identity,
    pub recipient_id: Identity,
    pub plaintext: String,
    pub created_at: u64,
    pub read: bool,
}

type Contacts = Arc<RwLock<HashMap<Identity, PublicKey>>>;

/// One local participant: identity, box keys and the peers' public keys
/// learned so far.
pub struct Messenger {
    identity: Identity,
    keys: KeyPair,
    store: Arc<MessageStore>,
    contacts: Contacts,
}

impl Messenger {
    pub fn new(identity: &str, keys: KeyPair, store: Arc<MessageStore>) -> Self {
        Self {
            identity: canonicalize(identity),
            keys,
            store,
            contacts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keys.public_key()
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Connect the shared store as this participant.
    pub async fn connect(&self) -> Result<(), ChatError> {
        self.store.connect(self.identity.as_str()).await
    }

    /// Remember `peer`'s public key for [`inbox`](Self::inbox) and
    /// [`watch`](Self::watch).
    pub fn add_contact(&self, peer: &str, public: PublicKey) {
        self.contacts.write().insert(canonicalize(peer), public);
    }

    pub fn contact(&self, peer: &str) -> Option<PublicKey> {
        self.contacts.read().get(&canonicalize(peer)).copied()
    }

    pub async fn send(
        &self,
        recipient: &str,
        recipient_public: &PublicKey,
        plaintext: &str,
    ) -> Result<Envelope, ChatError> {
        let ciphertext = encrypt(plaintext, recipient_public, self.keys.secret_key())?;
        self.add_contact(recipient, *recipient_public);
        self.store
            .append(self.identity.as_str(), recipient, ciphertext)
            .await
    }

    /// Decrypt one envelope exchanged with `peer_public`'s owner, in either
    /// direction.
    pub fn open(
        &self,
        envelope: &Envelope,
        peer_public: &PublicKey,
    ) -> Result<DecryptedMessage, ChatError> {
        open_envelope(envelope, peer_public, &self.keys)
    }

    /// Messages between this participant and `peer`, oldest first. Each entry
    /// decrypts independently so one corrupt envelope does not hide the rest.
    pub async fn conversation(
        &self,
        peer: &str,
        peer_public: &PublicKey,
    ) -> Result<Vec<Result<DecryptedMessage, ChatError>>, ChatError> {
        self.add_contact(peer, *peer_public);
        let envelopes = self
            .store
            .query_conversation(self.identity.as_str(), peer)
            .await?;
        Ok(envelopes
            .iter()
            .map(|e| self.open(e, peer_public))
            .collect())
    }

    /// Every message sent or received by this participant, oldest first.
    /// Envelopes from peers without a known key fail with
    /// [`CryptoError::InvalidKey`].
    pub async fn inbox(&self) -> Result<Vec<Result<DecryptedMessage, ChatError>>, ChatError> {
        let envelopes = self.store.query(self.identity.as_str()).await?;
        let contacts = self.contacts.read();
        Ok(envelopes
            .iter()
            .map(|e| open_with_contacts(e, &self.identity, &contacts, &self.keys))
            .collect())
    }

    /// Decrypt and deliver every message subsequently sent to this
    /// participant.
    pub fn watch<F>(&self, callback: F) -> Result<SubscriptionHandle, ChatError>
    where
        F: Fn(Result<DecryptedMessage, ChatError>) + Send + Sync + 'static,
    {
        let me = self.identity.clone();
        let keys = self.keys.clone();
        let contacts = Arc::clone(&self.contacts);
        self.store.subscribe(self.identity.as_str(), move |envelope| {
            let opened = open_with_contacts(&envelope, &me, &contacts.read(), &keys);
            if let Err(e) = &opened {
                tracing::warn!(id = %envelope.id, error = %e, "could not open live envelope");
            }
            callback(opened);
        })
    }

    pub async fn mark_read(&self, envelope_id: &str) -> Result<Envelope, ChatError> {
        self.store
            .mark_read(self.identity.as_str(), envelope_id)
            .await
    }
}

fn open_with_contacts(
    envelope: &Envelope,
    me: &Identity,
    contacts: &HashMap<Identity, PublicKey>,
    keys: &KeyPair,
) -> Result<DecryptedMessage, ChatError> {
    let peer = envelope.counterparty(me);
    let peer_public = contacts.get(peer).ok_or_else(|| {
        ChatError::Crypto(CryptoError::InvalidKey(format!("no public key for {peer}")))
    })?;
    open_envelope(envelope, peer_public, keys)
}

fn open_envelope(
    envelope: &Envelope,
    peer_public: &PublicKey,
    keys: &KeyPair,
) -> Result<DecryptedMessage, ChatError> {
    let plaintext = decrypt(&envelope.ciphertext, peer_public, keys.secret_key())?;
    Ok(DecryptedMessage {
        id: envelope.id.clone(),
        sender_id: envelope.sender_id.clone(),
        recipient_id: envelope.recipient_id.clone(),
        plaintext,
        created_at: envelope.created_at,
        read: envelope.read,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::RetryPolicy;
    use crate::session::SessionBridge;

    fn shared_store() -> Arc<MessageStore> {
        let backend = Arc::new(MemoryBackend::new());
        let sessions = Arc::new(SessionBridge::new(backend.clone(), RetryPolicy::immediate(3)));
        Arc::new(MessageStore::new(backend, sessions))
    }

    fn pair(seed: u8) -> KeyPair {
        KeyPair::from_seed(&[seed; 32]).unwrap()
    }

    #[tokio::test]
    async fn both_sides_read_the_conversation() {
        let store = shared_store();
        let alice = Messenger::new("0xAlice", pair(1), Arc::clone(&store));
        let bob = Messenger::new("0xBob", pair(2), Arc::clone(&store));
        alice.connect().await.unwrap();

        alice.send("0xBOB", bob.public_key(), "hi bob").await.unwrap();
        bob.send("0xalice", alice.public_key(), "hi alice").await.unwrap();

        let from_alice: Vec<String> = alice
            .conversation("0xbob", bob.public_key())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.unwrap().plaintext)
            .collect();
        let from_bob: Vec<String> = bob
            .conversation("0xalice", alice.public_key())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.unwrap().plaintext)
            .collect();
        assert_eq!(from_alice, vec!["hi bob", "hi alice"]);
        assert_eq!(from_alice, from_bob);
    }

    #[tokio::test]
    async fn inbox_reports_unknown_senders_individually() {
        let store = shared_store();
        let alice = Messenger::new("0xa", pair(1), Arc::clone(&store));
        let bob = Messenger::new("0xb", pair(2), Arc::clone(&store));
        let carol = Messenger::new("0xc", pair(3), Arc::clone(&store));
        alice.connect().await.unwrap();

        bob.send("0xa", alice.public_key(), "from bob").await.unwrap();
        carol.send("0xa", alice.public_key(), "from carol").await.unwrap();
        alice.add_contact("0xB", *bob.public_key());

        let inbox = alice.inbox().await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].as_ref().unwrap().plaintext, "from bob");
        assert!(matches!(
            inbox[1],
            Err(ChatError::Crypto(CryptoError::InvalidKey(_)))
        ));
    }

    #[tokio::test]
    async fn watch_decrypts_live_messages() {
        let store = shared_store();
        let alice = Messenger::new("0xa", pair(1), Arc::clone(&store));
        let bob = Messenger::new("0xb", pair(2), Arc::clone(&store));
        bob.connect().await.unwrap();
        bob.add_contact("0xa", *alice.public_key());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watch = bob
            .watch(move |m| {
                let _ = tx.send(m);
            })
            .unwrap();

        alice.send("0xb", bob.public_key(), "live").await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.plaintext, "live");
        assert_eq!(received.sender_id.as_str(), "0xa");
    }

    #[tokio::test]
    async fn mark_read_as_recipient() {
        let store = shared_store();
        let alice = Messenger::new("0xa", pair(1), Arc::clone(&store));
        let bob = Messenger::new("0xb", pair(2), Arc::clone(&store));
        alice.connect().await.unwrap();

        let sent = alice.send("0xb", bob.public_key(), "x").await.unwrap();
        assert_eq!(
            alice.mark_read(&sent.id).await.unwrap_err(),
            ChatError::NotRecipient
        );
        assert!(bob.mark_read(&sent.id).await.unwrap().read);
    }
}
