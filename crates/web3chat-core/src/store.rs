//! Conversation-addressed message store.
//!
//! Persists ciphertext envelopes through an [`EnvelopeBackend`], assigns
//! monotonic timestamps, and fans new envelopes out to per-participant
//! subscribers on a delivery task.

use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{self, now_ms, EnvelopeBackend, Unsubscribe};
use crate::config::StoreConfig;
use crate::conversation::ConversationId;
use crate::envelope::{Envelope, EnvelopeField, EnvelopeRecord};
use crate::error::{BackendError, ChatError};
use crate::identity::{canonicalize, Identity};
use crate::session::SessionBridge;

/// Lifecycle of a [`MessageStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Uninitialized,
    Connected,
    Disconnected,
    Closed,
}

enum Lifecycle {
    Uninitialized,
    Connected(Identity),
    Disconnected,
    Closed,
}

pub struct MessageStore {
    backend: Arc<dyn EnvelopeBackend>,
    sessions: Arc<SessionBridge>,
    lifecycle: RwLock<Lifecycle>,
    /// Last assigned timestamp. Held across the insert so timestamps follow
    /// insertion order.
    clock: tokio::sync::Mutex<u64>,
    subscriptions: Mutex<Vec<Weak<Subscription>>>,
}

impl MessageStore {
    pub fn new(backend: Arc<dyn EnvelopeBackend>, sessions: Arc<SessionBridge>) -> Self {
        Self {
            backend,
            sessions,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            clock: tokio::sync::Mutex::new(0),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Open the configured backend and build a store plus its session bridge.
    pub fn from_config(config: &StoreConfig) -> Result<Self, ChatError> {
        let backends = backend::open(&config.backend)?;
        let sessions = Arc::new(SessionBridge::new(backends.auth, config.retry.clone()));
        Ok(Self::new(backends.envelopes, sessions))
    }

    pub fn sessions(&self) -> &Arc<SessionBridge> {
        &self.sessions
    }

    pub fn state(&self) -> StoreState {
        match &*self.lifecycle.read() {
            Lifecycle::Uninitialized => StoreState::Uninitialized,
            Lifecycle::Connected(_) => StoreState::Connected,
            Lifecycle::Disconnected => StoreState::Disconnected,
            Lifecycle::Closed => StoreState::Closed,
        }
    }

    /// Establish a session for `identity` and start serving operations as it.
    pub async fn connect(&self, identity: &str) -> Result<(), ChatError> {
        if matches!(*self.lifecycle.read(), Lifecycle::Closed) {
            return Err(ChatError::Closed);
        }
        let identity = canonicalize(identity);
        let session = self.sessions.ensure_session(&identity).await?;

        // Resume the clock after whatever is already stored, so a restarted
        // process never stamps a new envelope before an old one.
        if let Some(latest) = self.backend.latest_timestamp(session.token()).await? {
            let mut last = self.clock.lock().await;
            *last = (*last).max(latest);
        }

        let mut lifecycle = self.lifecycle.write();
        if matches!(*lifecycle, Lifecycle::Closed) {
            return Err(ChatError::Closed);
        }
        tracing::info!(identity = %identity, "message store connected");
        *lifecycle = Lifecycle::Connected(identity);
        Ok(())
    }

    /// Stop serving operations and sign the session out. Subscriptions stay
    /// attached and resume delivering after the next [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<(), ChatError> {
        let identity = {
            let mut lifecycle = self.lifecycle.write();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Disconnected) {
                Lifecycle::Connected(identity) => identity,
                Lifecycle::Closed => {
                    *lifecycle = Lifecycle::Closed;
                    return Err(ChatError::Closed);
                }
                Lifecycle::Uninitialized => {
                    *lifecycle = Lifecycle::Uninitialized;
                    return Err(ChatError::NotConnected);
                }
                Lifecycle::Disconnected => return Ok(()),
            }
        };
        tracing::info!(identity = %identity, "message store disconnected");
        self.sessions.sign_out(&identity).await
    }

    /// Terminal. Tears down every subscription; later operations fail
    /// with [`ChatError::Closed`].
    pub fn close(&self) {
        *self.lifecycle.write() = Lifecycle::Closed;
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        let mut torn_down = 0usize;
        for subscription in subscriptions.iter().filter_map(Weak::upgrade) {
            subscription.shutdown();
            torn_down += 1;
        }
        tracing::info!(subscriptions = torn_down, "message store closed");
    }

    fn active_identity(&self) -> Result<Identity, ChatError> {
        match &*self.lifecycle.read() {
            Lifecycle::Connected(identity) => Ok(identity.clone()),
            Lifecycle::Closed => Err(ChatError::Closed),
            Lifecycle::Uninitialized | Lifecycle::Disconnected => Err(ChatError::NotConnected),
        }
    }

    /// Run `op` with the connected identity's session token. A stale token
    /// is replaced once and the operation retried once.
    async fn with_session<T, F, Fut>(&self, op: F) -> Result<T, ChatError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let identity = self.active_identity()?;
        let session = self.sessions.ensure_session(&identity).await?;
        match op(session.token().to_string()).await {
            Err(BackendError::StaleSession) => {
                tracing::info!(identity = %identity, "backend rejected session, re-establishing");
                self.sessions.invalidate(&identity);
                let session = self.sessions.ensure_session(&identity).await?;
                Ok(op(session.token().to_string()).await?)
            }
            result => Ok(result?),
        }
    }

    /// Persist one envelope. Failures are reported, never retried.
    pub async fn append(
        &self,
        sender: &str,
        recipient: &str,
        ciphertext: String,
    ) -> Result<Envelope, ChatError> {
        self.active_identity()?;
        let sender_id = canonicalize(sender);
        let recipient_id = canonicalize(recipient);

        let mut last = self.clock.lock().await;
        let record = EnvelopeRecord {
            sender_id,
            recipient_id,
            message: ciphertext,
            timestamp: now_ms().max(*last),
            read: false,
        };
        // Advanced before the insert is awaited: the row may still land if
        // this future is dropped mid-insert.
        *last = record.timestamp;

        let id = self
            .with_session(|token| {
                let backend = Arc::clone(&self.backend);
                let record = record.clone();
                async move { backend.insert(&token, record).await }
            })
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "append failed"))?;

        let envelope = Envelope::from_record(id, record);
        tracing::debug!(
            id = %envelope.id,
            conversation = %envelope.conversation_id(),
            "envelope appended"
        );
        Ok(envelope)
    }

    /// Every envelope `participant` sent or received, oldest first.
    pub async fn query(&self, participant: &str) -> Result<Vec<Envelope>, ChatError> {
        let participant = canonicalize(participant);
        self.with_session(|token| {
            let backend = Arc::clone(&self.backend);
            let participant = participant.clone();
            async move {
                backend
                    .query_by_either_field(
                        &token,
                        EnvelopeField::SenderId,
                        EnvelopeField::RecipientId,
                        &participant,
                    )
                    .await
            }
        })
        .await
    }

    /// Envelopes exchanged between exactly `a` and `b`, oldest first.
    pub async fn query_conversation(&self, a: &str, b: &str) -> Result<Vec<Envelope>, ChatError> {
        let conversation = ConversationId::new(&canonicalize(a), &canonicalize(b));
        let mut envelopes = self.query(a).await?;
        envelopes.retain(|e| e.conversation_id() == conversation);
        Ok(envelopes)
    }

    /// Mark an envelope read on behalf of its recipient. Idempotent.
    ///
    /// `reader` is taken on trust. The store checks it against the
    /// envelope's recipient but cannot prove the caller controls that
    /// identity: the backend session belongs to the connected identity (the
    /// relay's service identity behind the HTTP API), not to `reader`.
    /// Callers that need proof must authenticate the reader themselves.
    pub async fn mark_read(&self, reader: &str, envelope_id: &str) -> Result<Envelope, ChatError> {
        let reader = canonicalize(reader);
        let existing = self
            .with_session(|token| {
                let backend = Arc::clone(&self.backend);
                let id = envelope_id.to_string();
                async move { backend.get(&token, &id).await }
            })
            .await?
            .ok_or_else(|| ChatError::NotFound(envelope_id.to_string()))?;

        if existing.recipient_id != reader {
            return Err(ChatError::NotRecipient);
        }
        if existing.read {
            return Ok(existing);
        }

        self.with_session(|token| {
            let backend = Arc::clone(&self.backend);
            let id = envelope_id.to_string();
            async move { backend.set_read(&token, &id).await }
        })
        .await?
        .ok_or_else(|| ChatError::NotFound(envelope_id.to_string()))
    }

    /// Deliver every envelope appended from now on whose recipient is
    /// `participant`, in append order, on a spawned task.
    ///
    /// Delivery is at-least-once; callers dedup by envelope id.
    pub fn subscribe<F>(&self, participant: &str, callback: F) -> Result<SubscriptionHandle, ChatError>
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.active_identity()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ChatError::StoreUnavailable(format!("no runtime for delivery: {e}")))?;
        let participant = canonicalize(participant);

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let detach = self.backend.on_insert(
            EnvelopeField::RecipientId,
            &participant,
            Arc::new(move |envelope| {
                // Receiver gone means the subscription is shutting down.
                let _ = tx.send(envelope);
            }),
        );

        let gate = Arc::new(DeliveryGate::default());
        let task_gate = Arc::clone(&gate);
        let task_participant = participant.clone();
        let task = runtime.spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if !task_gate.deliver(|| callback(envelope)) {
                    break;
                }
            }
            tracing::trace!(participant = %task_participant, "delivery task finished");
        });

        let subscription = Arc::new(Subscription {
            participant,
            gate,
            detach: Mutex::new(Some(detach)),
            task: Mutex::new(Some(task)),
        });

        {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.retain(|s| s.strong_count() > 0);
            subscriptions.push(Arc::downgrade(&subscription));
        }
        tracing::debug!(participant = %subscription.participant, "subscribed");
        Ok(SubscriptionHandle {
            inner: subscription,
        })
    }
}

thread_local! {
    /// Delivery callbacks currently running on this thread.
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Marks the current thread as inside a delivery callback.
struct CallbackScope;

impl CallbackScope {
    fn enter() -> Self {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self
    }

    fn active() -> bool {
        CALLBACK_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for CallbackScope {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Decides whether the delivery task may run one more callback.
struct DeliveryGate {
    open: AtomicBool,
    /// Held for the duration of each callback.
    running: Mutex<()>,
}

impl Default for DeliveryGate {
    fn default() -> Self {
        Self {
            open: AtomicBool::new(true),
            running: Mutex::new(()),
        }
    }
}

impl DeliveryGate {
    /// Run `callback` unless the gate has been closed. Returns `false` once
    /// closed.
    fn deliver(&self, callback: impl FnOnce()) -> bool {
        let _running = self.running.lock();
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        let _scope = CallbackScope::enter();
        callback();
        true
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Block until a callback running on another thread returns.
    fn wait_idle(&self) {
        drop(self.running.lock());
    }
}

struct Subscription {
    participant: Identity,
    gate: Arc<DeliveryGate>,
    detach: Mutex<Option<Unsubscribe>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    fn shutdown(&self) {
        self.gate.close();
        let detach = self.detach.lock().take();
        if let Some(detach) = detach {
            detach();
            tracing::debug!(participant = %self.participant, "unsubscribed");
        }
        // A callback never waits on another callback; two subscriptions
        // unsubscribing each other from their callbacks would deadlock.
        if !CallbackScope::active() {
            self.gate.wait_idle();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Live subscription created by [`MessageStore::subscribe`]. Dropping it
/// detaches the subscription.
#[must_use = "dropping a SubscriptionHandle detaches the subscription"]
pub struct SubscriptionHandle {
    inner: Arc<Subscription>,
}

impl SubscriptionHandle {
    pub fn participant(&self) -> &Identity {
        &self.inner.participant
    }

    /// Idempotent. Once this returns the callback is never started again.
    ///
    /// Outside a delivery callback this also waits for a callback already
    /// running on another thread to return. Inside any delivery callback
    /// (this subscription's or another's) it does not wait, so subscriptions
    /// may unsubscribe themselves or each other from their callbacks; a
    /// callback of this subscription running on another thread may then
    /// still be finishing when this returns.
    pub fn unsubscribe(&self) {
        self.inner.shutdown();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("participant", &self.inner.participant)
            .finish_non_exhaustive()
    }
}
