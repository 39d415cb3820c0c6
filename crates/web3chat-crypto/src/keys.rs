use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha512};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::primitive;

/// Required seed length for [`derive_key_pair`].
pub const SEED_LEN: usize = 32;

/// Length of both halves of a [`KeyPair`].
pub const KEY_LEN: usize = 32;

/// X25519 public key. Safe to publish, log and store.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes =
            hex::decode(s).map_err(|e| CryptoError::InvalidKey(format!("invalid hex: {e}")))?;
        Self::from_slice(&bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(s)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "public key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub(crate) fn to_x25519(self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// X25519 secret key.
///
/// Lives only in the memory of the identity's own runtime: it has no
/// serialisation, its `Debug` output is redacted, and it is wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw secret bytes.
    ///
    /// # Security
    /// Raw private key material.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub(crate) fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.0)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

/// A participant's box key pair.
///
/// Derived deterministically from a 32-byte seed so a participant can
/// regenerate the same keys in every session without a key-storage service.
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    secret: SecretKey,
}

impl KeyPair {
    /// Derive a key pair from a seed of exactly [`SEED_LEN`] bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        derive_key_pair(seed)
    }

    /// Derive a key pair from a fresh random seed.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = generate_seed()?;
        let pair = derive_key_pair(&seed);
        seed.zeroize();
        pair
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public.to_hex())
            .finish_non_exhaustive()
    }
}

/// Derive a [`KeyPair`] from `seed`.
///
/// The secret is the first 32 bytes of SHA-512(seed) and the public key is
/// its X25519 base-point product, matching libsodium's seeded box key pairs.
pub fn derive_key_pair(seed: &[u8]) -> Result<KeyPair, CryptoError> {
    if seed.len() != SEED_LEN {
        return Err(CryptoError::InvalidSeedLength {
            expected: SEED_LEN,
            actual: seed.len(),
        });
    }
    primitive::ready()?;

    let digest = Sha512::digest(seed);
    let mut secret_bytes = [0u8; KEY_LEN];
    secret_bytes.copy_from_slice(&digest[..KEY_LEN]);

    let static_secret = StaticSecret::from(secret_bytes);
    let public = x25519_dalek::PublicKey::from(&static_secret);
    let secret = SecretKey(secret_bytes);
    secret_bytes.zeroize();

    Ok(KeyPair {
        public: PublicKey(public.to_bytes()),
        secret,
    })
}

/// A fresh random seed suitable for [`derive_key_pair`].
pub fn generate_seed() -> Result<[u8; SEED_LEN], CryptoError> {
    let mut seed = [0u8; SEED_LEN];
    primitive::ready()?.fill_random(&mut seed)?;
    Ok(seed)
}
