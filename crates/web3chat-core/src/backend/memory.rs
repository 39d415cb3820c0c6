//! In-process backend.
//!
//! Suitable for tests and single-process deployments. Data is lost on exit.
//! Exposes fault-injection hooks so callers can exercise retry and failure
//! paths without a real network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;

use super::{AuthBackend, EnvelopeBackend, InsertHandler, ListenerRegistry, Unsubscribe};
use crate::envelope::{Envelope, EnvelopeField, EnvelopeRecord};
use crate::error::{AuthError, BackendError};
use crate::identity::Identity;

#[derive(Default)]
pub struct MemoryBackend {
    envelopes: RwLock<Vec<Envelope>>,
    principals: Mutex<HashMap<Identity, String>>,
    sessions: Mutex<HashMap<String, Identity>>,
    listeners: ListenerRegistry,
    registrations: AtomicUsize,
    sign_in_calls: AtomicUsize,
    failing_inserts: AtomicUsize,
    transient_sign_ins: AtomicUsize,
    auth_latency: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `sign_up` calls so far.
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Number of `sign_in` calls so far, successful or not.
    pub fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` inserts fail with [`BackendError::Unavailable`].
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` sign-ins fail with [`AuthError::Transient`].
    pub fn rate_limit_next_sign_ins(&self, n: usize) {
        self.transient_sign_ins.store(n, Ordering::SeqCst);
    }

    /// Delay every auth call, widening the window for concurrent callers.
    pub fn set_auth_latency(&self, latency: Duration) {
        *self.auth_latency.lock() = Some(latency);
    }

    /// Drop every issued token, as a backend does when credentials expire.
    pub fn expire_sessions(&self) {
        self.sessions.lock().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn authorise(&self, token: &str) -> Result<Identity, BackendError> {
        self.sessions
            .lock()
            .get(token)
            .cloned()
            .ok_or(BackendError::StaleSession)
    }

    async fn simulate_latency(&self) {
        let latency = *self.auth_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Consume one unit of an injected fault budget.
fn take_fault(budget: &AtomicUsize) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl EnvelopeBackend for MemoryBackend {
    async fn insert(&self, token: &str, record: EnvelopeRecord) -> Result<String, BackendError> {
        self.authorise(token)?;
        if take_fault(&self.failing_inserts) {
            return Err(BackendError::Unavailable("injected insert failure".into()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let envelope = Envelope::from_record(id.clone(), record);
        self.envelopes.write().push(envelope.clone());
        self.listeners.notify(&envelope);
        Ok(id)
    }

    async fn query_by_either_field(
        &self,
        token: &str,
        field1: EnvelopeField,
        field2: EnvelopeField,
        value: &Identity,
    ) -> Result<Vec<Envelope>, BackendError> {
        self.authorise(token)?;
        let mut matches: Vec<Envelope> = self
            .envelopes
            .read()
            .iter()
            .filter(|e| e.field(field1) == value || e.field(field2) == value)
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order.
        matches.sort_by_key(|e| e.created_at);
        Ok(matches)
    }

    async fn get(&self, token: &str, id: &str) -> Result<Option<Envelope>, BackendError> {
        self.authorise(token)?;
        Ok(self.envelopes.read().iter().find(|e| e.id == id).cloned())
    }

    async fn set_read(&self, token: &str, id: &str) -> Result<Option<Envelope>, BackendError> {
        self.authorise(token)?;
        let mut envelopes = self.envelopes.write();
        Ok(envelopes.iter_mut().find(|e| e.id == id).map(|e| {
            e.read = true;
            e.clone()
        }))
    }

    async fn latest_timestamp(&self, token: &str) -> Result<Option<u64>, BackendError> {
        self.authorise(token)?;
        Ok(self.envelopes.read().iter().map(|e| e.created_at).max())
    }

    fn on_insert(
        &self,
        field: EnvelopeField,
        value: &Identity,
        handler: InsertHandler,
    ) -> Unsubscribe {
        self.listeners.register(field, value.clone(), handler)
    }
}

#[async_trait]
impl AuthBackend for MemoryBackend {
    async fn sign_in(&self, principal: &Identity, credential: &str) -> Result<String, AuthError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if take_fault(&self.transient_sign_ins) {
            return Err(AuthError::Transient("rate limited".into()));
        }

        match self.principals.lock().get(principal) {
            None => return Err(AuthError::UnknownPrincipal),
            Some(stored) if stored != credential => return Err(AuthError::InvalidCredential),
            Some(_) => {}
        }

        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = hex::encode(raw);
        self.sessions.lock().insert(token.clone(), principal.clone());
        Ok(token)
    }

    async fn sign_up(&self, principal: &Identity, credential: &str) -> Result<(), AuthError> {
        self.simulate_latency().await;
        let mut principals = self.principals.lock();
        if principals.contains_key(principal) {
            return Err(AuthError::AlreadyRegistered);
        }
        principals.insert(principal.clone(), credential.to_string());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        self.sessions.lock().remove(token);
        Ok(())
    }
}
