use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use crate::error::CryptoError;
use crate::keys::{PublicKey, SecretKey};
use crate::primitive;

/// XSalsa20 nonce length (`crypto_box_NONCEBYTES`).
pub const NONCE_LEN: usize = 24;
/// Poly1305 authentication tag length (`crypto_box_MACBYTES`).
pub const TAG_LEN: usize = 16;

/// Text encoding of a box blob: libsodium's default `to_base64` variant,
/// URL-safe alphabet without padding.
pub const BLOB_ENCODING: base64::engine::GeneralPurpose = URL_SAFE_NO_PAD;

/// Whether X25519 between `my_secret` and `their_public` yields a
/// contributory shared secret. libsodium refuses low-order points.
fn contributory(my_secret: &SecretKey, their_public: &PublicKey) -> bool {
    my_secret
        .to_x25519()
        .diffie_hellman(&their_public.to_x25519())
        .was_contributory()
}

/// Encrypt `plaintext` for `recipient_public`, authenticated by `sender_secret`.
///
/// Returns [`BLOB_ENCODING`] of `[24-byte nonce || 16-byte tag || ciphertext]`,
/// byte for byte what libsodium's `crypto_box_easy` plus `to_base64` emits.
/// A fresh random nonce is drawn for every call.
pub fn encrypt(
    plaintext: &str,
    recipient_public: &PublicKey,
    sender_secret: &SecretKey,
) -> Result<String, CryptoError> {
    let primitive = primitive::ready()?;
    if !contributory(sender_secret, recipient_public) {
        return Err(CryptoError::EncryptionFailure(
            "recipient public key is a low-order point".into(),
        ));
    }

    let nonce = primitive.nonce()?;
    let sealed = primitive.seal(recipient_public, sender_secret, &nonce, plaintext.as_bytes())?;

    let mut blob = Vec::with_capacity(NONCE_LEN + sealed.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&sealed);
    Ok(BLOB_ENCODING.encode(blob))
}

/// Decrypt a blob produced by [`encrypt`] or by libsodium.
///
/// Fails with [`CryptoError::DecryptionFailure`] on malformed base64, a blob
/// too short to hold nonce and tag, a failed tag check (wrong keys or
/// tampering), or non-UTF-8 plaintext.
pub fn decrypt(
    blob: &str,
    sender_public: &PublicKey,
    recipient_secret: &SecretKey,
) -> Result<String, CryptoError> {
    let primitive = primitive::ready()?;
    let data = BLOB_ENCODING
        .decode(blob.trim())
        .map_err(|e| CryptoError::DecryptionFailure(format!("invalid base64: {e}")))?;

    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailure(
            "ciphertext too short".to_string(),
        ));
    }

    let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(nonce_bytes);

    if !contributory(recipient_secret, sender_public) {
        return Err(CryptoError::DecryptionFailure(
            "sender public key is a low-order point".into(),
        ));
    }
    let plaintext = primitive.open(sender_public, recipient_secret, &nonce, sealed)?;

    String::from_utf8(plaintext)
        .map_err(|_| CryptoError::DecryptionFailure("plaintext is not valid UTF-8".into()))
}
