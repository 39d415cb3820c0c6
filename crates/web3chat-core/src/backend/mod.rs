//! Persistence/transport seam of the message store.
//!
//! The core only needs three record primitives (insert, either-field query,
//! insert notification) plus a sign-in/sign-up auth primitive. Concrete
//! backends are picked once from [`BackendConfig`] by the composition root.

pub mod listeners;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::envelope::{Envelope, EnvelopeField, EnvelopeRecord};
use crate::error::{AuthError, BackendError};
use crate::identity::Identity;

pub use listeners::ListenerRegistry;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Callback invoked by a backend for each matching insert.
pub type InsertHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Detaches an insert handler. Calling it more than once is impossible by
/// construction; dropping it without calling leaves the handler attached.
pub type Unsubscribe = Box<dyn FnOnce() + Send + Sync>;

/// Record storage. Every call except [`EnvelopeBackend::on_insert`] is
/// authorised by a session token obtained from an [`AuthBackend`].
#[async_trait]
pub trait EnvelopeBackend: Send + Sync {
    /// Persist `record`, returning its backend-assigned id.
    async fn insert(&self, token: &str, record: EnvelopeRecord) -> Result<String, BackendError>;

    /// Records where `field1 == value` or `field2 == value`, ascending by
    /// timestamp with ties in insertion order.
    async fn query_by_either_field(
        &self,
        token: &str,
        field1: EnvelopeField,
        field2: EnvelopeField,
        value: &Identity,
    ) -> Result<Vec<Envelope>, BackendError>;

    async fn get(&self, token: &str, id: &str) -> Result<Option<Envelope>, BackendError>;

    /// Set `read = true`. Returns the updated record, or `None` for an unknown id.
    async fn set_read(&self, token: &str, id: &str) -> Result<Option<Envelope>, BackendError>;

    /// Largest stored timestamp, or `None` when nothing is stored. Backends
    /// that cannot answer cheaply keep the default.
    async fn latest_timestamp(&self, _token: &str) -> Result<Option<u64>, BackendError> {
        Ok(None)
    }

    /// Call `handler` for every subsequent insert whose `field` equals `value`.
    fn on_insert(&self, field: EnvelopeField, value: &Identity, handler: InsertHandler)
        -> Unsubscribe;
}

/// Principal registration and credential exchange.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange a credential for a session token.
    async fn sign_in(&self, principal: &Identity, credential: &str) -> Result<String, AuthError>;

    async fn sign_up(&self, principal: &Identity, credential: &str) -> Result<(), AuthError>;

    /// Revoke a token. Unknown tokens are ignored.
    async fn sign_out(&self, token: &str) -> Result<(), AuthError>;
}

/// Both halves of a configured backend.
#[derive(Clone)]
pub struct Backends {
    pub envelopes: Arc<dyn EnvelopeBackend>,
    pub auth: Arc<dyn AuthBackend>,
}

impl Backends {
    pub fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: EnvelopeBackend + AuthBackend + 'static,
    {
        Self {
            envelopes: backend.clone(),
            auth: backend,
        }
    }
}

/// Open the backend named by `config`.
pub fn open(config: &BackendConfig) -> Result<Backends, BackendError> {
    match config {
        BackendConfig::Memory => {
            tracing::info!("using in-memory backend");
            Ok(Backends::from_shared(Arc::new(MemoryBackend::new())))
        }
        BackendConfig::Sqlite { path } => {
            tracing::info!(path = %path, "using sqlite backend");
            Ok(Backends::from_shared(Arc::new(SqliteBackend::open(path)?)))
        }
    }
}

/// Wall-clock epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
