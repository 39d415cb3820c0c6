//! Process-wide handle to the box primitive.
//!
//! Every key derivation and seal/open goes through [`ready`], which runs the
//! one-time initialisation (OS RNG check + seal/open self-test) the first time
//! it is called. After that the handle is immutable and shared by all threads.
//!
//! The box is libsodium's `crypto_box_easy`: X25519 key agreement and
//! XSalsa20-Poly1305, with the 16-byte tag in front of the ciphertext.

use std::sync::OnceLock;

use crypto_box::aead::{Aead, Nonce};
use crypto_box::SalsaBox;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;
use crate::keys::{PublicKey, SecretKey};
use crate::sealed::{NONCE_LEN, TAG_LEN};

static PRIMITIVE: OnceLock<Result<BoxPrimitive, CryptoError>> = OnceLock::new();

/// Initialised XSalsa20-Poly1305 box plus its randomness source.
#[derive(Debug)]
pub struct BoxPrimitive {
    _initialised: (),
}

/// Return the shared primitive, initialising it on first use.
pub fn ready() -> Result<&'static BoxPrimitive, CryptoError> {
    PRIMITIVE
        .get_or_init(BoxPrimitive::initialise)
        .as_ref()
        .map_err(Clone::clone)
}

impl BoxPrimitive {
    fn initialise() -> Result<Self, CryptoError> {
        let primitive = Self { _initialised: () };

        let mut sample = [0u8; 32];
        primitive.fill_random(&mut sample)?;

        // Box to ourselves under a fixed key; key derivation is not usable yet.
        let secret = SecretKey::from_bytes([0x5a; 32]);
        let public = PublicKey::from_bytes(
            x25519_dalek::PublicKey::from(&secret.to_x25519()).to_bytes(),
        );
        let nonce = [0u8; NONCE_LEN];
        let sealed = primitive.seal(&public, &secret, &nonce, b"web3chat self-test")?;
        if sealed.len() != b"web3chat self-test".len() + TAG_LEN {
            return Err(CryptoError::EncryptionFailure(
                "self-test produced unexpected ciphertext length".into(),
            ));
        }
        let opened = primitive
            .open(&public, &secret, &nonce, &sealed)
            .map_err(|e| CryptoError::EncryptionFailure(format!("self-test failed: {e}")))?;
        if opened != b"web3chat self-test" {
            return Err(CryptoError::EncryptionFailure(
                "self-test round trip mismatch".into(),
            ));
        }

        tracing::debug!("box primitive initialised");
        Ok(primitive)
    }

    /// Fill `buf` from the operating system RNG.
    pub fn fill_random(&self, buf: &mut [u8]) -> Result<(), CryptoError> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| CryptoError::EncryptionFailure(format!("OS RNG unavailable: {e}")))
    }

    /// Fresh random nonce. Never reuse one for the same key pair.
    pub fn nonce(&self) -> Result<[u8; NONCE_LEN], CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.fill_random(&mut nonce)?;
        Ok(nonce)
    }

    /// `crypto_box_easy`: seal `plaintext` from `sender` to `recipient`.
    /// Output is `16-byte tag || ciphertext`.
    pub fn seal(
        &self,
        recipient: &PublicKey,
        sender: &SecretKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        salsa_box(recipient, sender)
            .encrypt(Nonce::<SalsaBox>::from_slice(nonce), plaintext)
            .map_err(|e| CryptoError::EncryptionFailure(e.to_string()))
    }

    /// `crypto_box_open_easy`: open a buffer produced by [`BoxPrimitive::seal`].
    pub fn open(
        &self,
        sender: &PublicKey,
        recipient: &SecretKey,
        nonce: &[u8; NONCE_LEN],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        salsa_box(sender, recipient)
            .decrypt(Nonce::<SalsaBox>::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::DecryptionFailure("authentication failed".into()))
    }
}

fn salsa_box(their_public: &PublicKey, my_secret: &SecretKey) -> SalsaBox {
    let public = crypto_box::PublicKey::from(*their_public.as_bytes());
    let secret = crypto_box::SecretKey::from(*my_secret.as_bytes());
    SalsaBox::new(&public, &secret)
}
