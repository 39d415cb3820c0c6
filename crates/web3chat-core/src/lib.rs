pub mod backend;
pub mod config;
pub mod conversation;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod messenger;
pub mod session;
pub mod store;
pub mod wallet;

pub use backend::{AuthBackend, EnvelopeBackend, MemoryBackend, SqliteBackend};
pub use config::{BackendConfig, RetryPolicy, StoreConfig};
pub use conversation::{conversation_id, ConversationId};
pub use envelope::{Envelope, EnvelopeField, EnvelopeRecord};
pub use error::{AuthError, BackendError, ChatError};
pub use identity::{canonicalize, Identity};
pub use messenger::{DecryptedMessage, Messenger};
pub use session::{Session, SessionBridge};
pub use store::{MessageStore, StoreState, SubscriptionHandle};
pub use wallet::{IdentityProvider, StaticWallet, WalletIdentityProvider, WalletKind, WalletProvider};
