//! Wallet identity → backend session bridge.
//!
//! Sessions are issued on first contact and cached for the life of the
//! process. Concurrent callers for one identity share a single in-flight
//! attempt, and attempts for different identities are serialised so the
//! backend never sees two registrations racing from this process.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::backend::{now_ms, AuthBackend};
use crate::config::RetryPolicy;
use crate::error::{AuthError, ChatError};
use crate::identity::Identity;

const CREDENTIAL_DOMAIN: &[u8] = b"web3chat-credential-v1:";

type Attempt = Shared<BoxFuture<'static, Result<Session, ChatError>>>;

/// A backend credential bound to one identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    identity: Identity,
    token: String,
    issued_at: u64,
}

impl Session {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Epoch milliseconds at which the backend issued the token.
    pub fn issued_at(&self) -> u64 {
        self.issued_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("issued_at", &self.issued_at)
            .finish_non_exhaustive()
    }
}

/// Backend credential for `identity`.
///
/// Derived from the identity alone, so anyone who knows a wallet address can
/// compute it. Kept for compatibility with existing deployments; it is not an
/// authentication factor.
pub fn derive_credential(identity: &Identity) -> String {
    let mut hasher = Sha256::new();
    hasher.update(CREDENTIAL_DOMAIN);
    hasher.update(identity.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

pub struct SessionBridge {
    auth: Arc<dyn AuthBackend>,
    policy: RetryPolicy,
    cache: Arc<Mutex<HashMap<Identity, Session>>>,
    in_flight: Arc<Mutex<HashMap<Identity, Attempt>>>,
    attempt_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SessionBridge {
    pub fn new(auth: Arc<dyn AuthBackend>, policy: RetryPolicy) -> Self {
        Self {
            auth,
            policy,
            cache: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            attempt_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Return the cached session for `identity`, establishing one if needed.
    pub async fn ensure_session(&self, identity: &Identity) -> Result<Session, ChatError> {
        let attempt = {
            let mut in_flight = self.in_flight.lock();
            if let Some(session) = self.cache.lock().get(identity) {
                return Ok(session.clone());
            }
            in_flight
                .entry(identity.clone())
                .or_insert_with(|| self.start_attempt(identity.clone()))
                .clone()
        };
        attempt.await
    }

    fn start_attempt(&self, identity: Identity) -> Attempt {
        let auth = Arc::clone(&self.auth);
        let policy = self.policy.clone();
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let attempt_lock = Arc::clone(&self.attempt_lock);

        async move {
            let result = {
                let _serialised = attempt_lock.lock().await;
                establish(auth.as_ref(), &policy, &identity).await
            };

            let mut in_flight = in_flight.lock();
            if let Ok(session) = &result {
                cache.lock().insert(identity.clone(), session.clone());
            }
            in_flight.remove(&identity);
            result
        }
        .boxed()
        .shared()
    }

    /// Cached session, if any. Never contacts the backend.
    pub fn cached(&self, identity: &Identity) -> Option<Session> {
        self.cache.lock().get(identity).cloned()
    }

    /// Forget the cached session after the backend reported it stale.
    pub fn invalidate(&self, identity: &Identity) {
        if self.cache.lock().remove(identity).is_some() {
            tracing::debug!(identity = %identity, "session invalidated");
        }
    }

    /// Drop the cached session and revoke its token at the backend.
    pub async fn sign_out(&self, identity: &Identity) -> Result<(), ChatError> {
        let session = self.cache.lock().remove(identity);
        if let Some(session) = session {
            self.auth
                .sign_out(&session.token)
                .await
                .map_err(|e| ChatError::AuthUnavailable(e.to_string()))?;
            tracing::info!(identity = %identity, "signed out");
        }
        Ok(())
    }
}

/// Sign in, registering once on "unknown principal", retrying transient
/// failures with bounded exponential backoff.
async fn establish(
    auth: &dyn AuthBackend,
    policy: &RetryPolicy,
    identity: &Identity,
) -> Result<Session, ChatError> {
    let credential = derive_credential(identity);
    let max_attempts = policy.max_attempts.max(1);
    let mut registered = false;
    let mut failures = 0u32;

    loop {
        let transient = match auth.sign_in(identity, &credential).await {
            Ok(token) => {
                tracing::debug!(identity = %identity, "session established");
                return Ok(Session {
                    identity: identity.clone(),
                    token,
                    issued_at: now_ms(),
                });
            }
            Err(AuthError::UnknownPrincipal) if !registered => {
                registered = true;
                match auth.sign_up(identity, &credential).await {
                    Ok(()) => {
                        tracing::info!(identity = %identity, "registered new principal");
                        continue;
                    }
                    // Someone else registered first; signing in will now work.
                    Err(AuthError::AlreadyRegistered) => continue,
                    Err(AuthError::Transient(reason)) => {
                        registered = false;
                        reason
                    }
                    Err(e) => return Err(ChatError::AuthUnavailable(e.to_string())),
                }
            }
            // Registered but not yet visible to sign-in.
            Err(AuthError::UnknownPrincipal) => "principal not yet visible".to_string(),
            Err(AuthError::Transient(reason)) => reason,
            Err(e) => return Err(ChatError::AuthUnavailable(e.to_string())),
        };

        failures += 1;
        if failures >= max_attempts {
            tracing::warn!(
                identity = %identity,
                attempts = failures,
                reason = %transient,
                "giving up on session"
            );
            return Err(ChatError::AuthUnavailable(format!(
                "gave up after {failures} attempts: {transient}"
            )));
        }

        let delay = policy.delay_for(failures - 1);
        tracing::debug!(
            identity = %identity,
            attempt = failures,
            reason = %transient,
            "retrying sign-in in {:?}",
            delay,
        );
        tokio::time::sleep(delay).await;
    }
}
