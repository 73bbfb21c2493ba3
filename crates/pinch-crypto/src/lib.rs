//! Cryptographic primitives for the Pinch protocol.
//!
//! Provides Ed25519 keypair handling, conversion of Ed25519 keys to
//! their X25519 (Curve25519) counterparts, and NaCl-box sealed payload
//! encryption with a prepended 24-byte nonce. The relay itself never
//! decrypts payloads; these primitives serve enrollment tooling, the
//! cross-language test harness, and endpoint agents embedding this
//! crate.

pub mod convert;
pub mod keys;
pub mod sealed;

pub use keys::Keypair;
pub use sealed::{decrypt, encrypt, encrypt_with_nonce, NONCE_LEN, SEALED_OVERHEAD};
