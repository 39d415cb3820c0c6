pub mod error;
pub mod keys;
pub mod primitive;
pub mod sealed;

pub use error::CryptoError;
pub use keys::{derive_key_pair, generate_seed, KeyPair, PublicKey, SecretKey, SEED_LEN};
pub use sealed::{decrypt, encrypt, BLOB_ENCODING, NONCE_LEN, TAG_LEN};
