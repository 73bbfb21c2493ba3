//! Ed25519 keypair handling.
//!
//! Wraps an `ed25519-dalek` [`SigningKey`]. The private key is
//! automatically zeroized when this struct is dropped, courtesy of
//! `ed25519-dalek`'s built-in `ZeroizeOnDrop`.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

// ---------------------------------------------------------------------------
// Keypair
// ---------------------------------------------------------------------------

/// Ed25519 signing keypair.
///
/// The identity of an endpoint agent. The 32-byte public half is what
/// a Pinch address embeds; the seed is the minimal secret material
/// needed to reconstruct the keypair deterministically.
pub struct Keypair {
    /// Internal signing key. `pub(crate)` so [`crate::convert`] can
    /// derive X25519 material without exposing the seed to external
    /// callers.
    pub(crate) signing_key: SigningKey,
}

impl Keypair {
    /// Generates a new random keypair using OS-level entropy.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Reconstructs a keypair deterministically from a 32-byte seed.
    ///
    /// Given the same seed, this always produces the same keypair.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Returns the 32-byte Ed25519 public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Returns the 32-byte seed of this keypair.
    ///
    /// # Security
    ///
    /// The returned bytes are sensitive key material. Callers **must**
    /// zeroize or discard the copy as soon as it is no longer needed.
    pub fn seed_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

// Keypair intentionally does not implement Clone or Debug to prevent
// accidental leakage of the private key in logs or copies.

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
