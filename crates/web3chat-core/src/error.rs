use thiserror::Error;
use web3chat_crypto::CryptoError;

/// Errors surfaced to callers of the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("message store is not connected")]
    NotConnected,

    #[error("message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("authentication unavailable: {0}")]
    AuthUnavailable(String),

    #[error("message store is closed")]
    Closed,

    #[error("only the recipient may mark a message as read")]
    NotRecipient,

    #[error("envelope not found: {0}")]
    NotFound(String),

    #[error("wallet error: {0}")]
    Wallet(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Failures reported by an [`EnvelopeBackend`](crate::backend::EnvelopeBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend I/O failed: {0}")]
    Unavailable(String),

    #[error("session credential is stale")]
    StaleSession,
}

/// Failures reported by an [`AuthBackend`](crate::backend::AuthBackend).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("unknown principal")]
    UnknownPrincipal,

    #[error("principal already registered")]
    AlreadyRegistered,

    #[error("credential rejected")]
    InvalidCredential,

    /// Rate limiting, registration races and similar conditions worth retrying.
    #[error("transient auth failure: {0}")]
    Transient(String),

    #[error("auth backend unavailable: {0}")]
    Unavailable(String),
}

impl From<BackendError> for ChatError {
    fn from(e: BackendError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Transient(e.to_string())
            }
            _ => Self::Unavailable(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for BackendError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Unavailable(format!("database task failed: {e}"))
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Unavailable(format!("database task failed: {e}"))
    }
}
