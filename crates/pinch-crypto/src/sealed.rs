//! NaCl-box sealed payloads.
//!
//! End-to-end payload encryption uses `crypto_box` (X25519 +
//! XSalsa20-Poly1305) with a random 24-byte nonce prepended to the
//! ciphertext:
//!
//! ```text
//! [nonce 24B] [ciphertext + tag 16B]
//! ```
//!
//! The format is wire-compatible with NaCl `box` as produced by peer
//! implementations. On any decryption failure no partial plaintext is
//! returned.

use crypto_box::aead::Aead;
use crypto_box::{Nonce, PublicKey, SalsaBox, SecretKey};
use pinch_types::{PinchError, Result};
use rand::rngs::OsRng;
use rand::RngCore;

/// Length of the XSalsa20-Poly1305 nonce.
pub const NONCE_LEN: usize = 24;

/// Length of the Poly1305 authentication tag.
const TAG_LEN: usize = 16;

/// Minimum length of a sealed payload: nonce plus authentication tag.
pub const SEALED_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Encrypts `plaintext` for `recipient_pub` using a fresh random nonce.
///
/// The nonce is prepended to the ciphertext in the returned bytes.
///
/// # Errors
///
/// Returns [`PinchError::CryptoError`] if the cipher rejects the input.
pub fn encrypt(
    plaintext: &[u8],
    recipient_pub: &[u8; 32],
    sender_priv: &[u8; 32],
) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal(plaintext, recipient_pub, sender_priv, &nonce)
}

/// Decrypts sealed bytes produced by [`encrypt`].
///
/// Expects the first 24 bytes to be the nonce, followed by the
/// ciphertext and tag.
///
/// # Errors
///
/// Returns [`PinchError::CryptoError`] if the input is shorter than
/// [`SEALED_OVERHEAD`] or if authentication fails (wrong keys, wrong
/// nonce, or tampered ciphertext).
pub fn decrypt(
    sealed_bytes: &[u8],
    sender_pub: &[u8; 32],
    recipient_priv: &[u8; 32],
) -> Result<Vec<u8>> {
    if sealed_bytes.len() < SEALED_OVERHEAD {
        return Err(PinchError::CryptoError {
            reason: format!(
                "sealed data too short: expected at least {SEALED_OVERHEAD} bytes, got {}",
                sealed_bytes.len()
            ),
        });
    }

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&sealed_bytes[..NONCE_LEN]);

    let salsa = SalsaBox::new(
        &PublicKey::from(*sender_pub),
        &SecretKey::from(*recipient_priv),
    );
    salsa
        .decrypt(&Nonce::from(nonce), &sealed_bytes[NONCE_LEN..])
        .map_err(|_| PinchError::CryptoError {
            reason: "decryption failed: authentication error".into(),
        })
}

/// Encrypts `plaintext` with an explicit nonce.
///
/// Intended for test vector validation only. Production paths must use
/// [`encrypt`], which generates a random nonce; reusing a nonce with
/// the same key pair breaks the cipher's guarantees.
pub fn encrypt_with_nonce(
    plaintext: &[u8],
    recipient_pub: &[u8; 32],
    sender_priv: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    seal(plaintext, recipient_pub, sender_priv, nonce)
}

/// Shared seal path: `nonce || box(plaintext)`.
fn seal(
    plaintext: &[u8],
    recipient_pub: &[u8; 32],
    sender_priv: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let salsa = SalsaBox::new(
        &PublicKey::from(*recipient_pub),
        &SecretKey::from(*sender_priv),
    );
    let ciphertext = salsa
        .encrypt(&Nonce::from(*nonce), plaintext)
        .map_err(|_| PinchError::CryptoError {
            reason: "encryption failed".into(),
        })?;

    let mut sealed_bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed_bytes.extend_from_slice(nonce);
    sealed_bytes.extend_from_slice(&ciphertext);
    Ok(sealed_bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
