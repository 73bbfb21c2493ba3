//! Ed25519 → X25519 key conversion (RFC 7748 compatible).
//!
//! Pinch addresses embed Ed25519 signing keys; payload encryption runs
//! over X25519. The two conversions here bridge that gap:
//!
//! - **Public**: decode the Edwards point, output its Montgomery
//!   u-coordinate.
//! - **Private**: `SHA-512(seed)`, truncate to 32 bytes, clamp.
//!
//! Both directions must match the conversions performed by peer
//! implementations exactly, or sealed payloads become undecryptable.

use ed25519_dalek::VerifyingKey;
use pinch_types::{PinchError, Result};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::keys::Keypair;

/// Converts an Ed25519 public key to the birationally equivalent
/// X25519 public key (Montgomery form).
///
/// # Errors
///
/// Returns [`PinchError::CryptoError`] if the bytes do not decode to a
/// valid Edwards point.
pub fn ed25519_public_to_x25519(public_key: &[u8; 32]) -> Result<[u8; 32]> {
    let verifying = VerifyingKey::from_bytes(public_key).map_err(|e| {
        PinchError::CryptoError {
            reason: format!("invalid Ed25519 public key: {e}"),
        }
    })?;
    Ok(verifying.to_montgomery().to_bytes())
}

/// Derives an X25519 private key from an Ed25519 seed.
///
/// Process: `SHA-512(seed)`, take the lower 32 bytes, clamp per
/// RFC 7748 (`d[0] &= 248; d[31] &= 127; d[31] |= 64`). The returned
/// bytes are the scalar peer implementations expect; intermediate hash
/// output is zeroized before returning.
pub fn ed25519_private_to_x25519(seed: &[u8; 32]) -> [u8; 32] {
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&Sha512::digest(seed));

    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    digest.zeroize();

    // Clamp per RFC 7748.
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    scalar
}

/// Derives the X25519 secret and public keys for a full keypair.
///
/// Convenience for callers holding a [`Keypair`]: the public half is
/// derived from the converted secret, guaranteeing the pair is
/// internally consistent.
pub fn keypair_to_x25519(keypair: &Keypair) -> ([u8; 32], [u8; 32]) {
    let mut seed = keypair.signing_key.to_bytes();
    let secret = ed25519_private_to_x25519(&seed);
    seed.zeroize();

    let public = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(secret));
    (secret, public.to_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
