//! Pinch address generation and validation.
//!
//! Addresses bind an Ed25519 public key to a relay host:
//!
//! ```text
//! pinch:<base58(pubkey(32) || checksum(4))>@<host>
//! ```
//!
//! The checksum is the first 4 bytes of `SHA-256(pubkey)`, providing
//! lightweight typo detection when addresses are exchanged out-of-band.
//! All functions here are pure and side-effect-free.

use pinch_types::{PinchError, Result};
use sha2::{Digest, Sha256};

/// URI scheme prefix for Pinch addresses.
const SCHEME: &str = "pinch:";

/// Number of checksum bytes appended to the public key.
const CHECKSUM_LEN: usize = 4;

/// Decoded payload length: 32-byte key plus 4-byte checksum.
const PAYLOAD_LEN: usize = 32 + CHECKSUM_LEN;

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Creates a Pinch address from an Ed25519 public key and relay host.
///
/// Format: `pinch:<base58(pubkey + sha256(pubkey)[0..4])>@<host>`
pub fn generate_address(public_key: &[u8; 32], relay_host: &str) -> String {
    let digest = Sha256::digest(public_key);

    let mut payload = [0u8; PAYLOAD_LEN];
    payload[..32].copy_from_slice(public_key);
    payload[32..].copy_from_slice(&digest[..CHECKSUM_LEN]);

    format!("{SCHEME}{}@{relay_host}", bs58::encode(payload).into_string())
}

// ---------------------------------------------------------------------------
// Parsing & validation
// ---------------------------------------------------------------------------

/// Extracts the base58 payload and host from a Pinch address string.
///
/// Validates the format (scheme, non-empty base58 payload, non-empty
/// host) but does not verify the checksum.
///
/// # Errors
///
/// Returns [`PinchError::InvalidAddress`] if the string does not match
/// `pinch:<base58>@<host>`.
pub fn parse_address(addr: &str) -> Result<(&str, &str)> {
    let rest = addr.strip_prefix(SCHEME).ok_or_else(|| format_error(addr))?;

    // The base58 alphabet never contains '@', so the first '@' always
    // terminates the payload; the host may contain further '@'s.
    let (payload, host) = rest.split_once('@').ok_or_else(|| format_error(addr))?;

    if payload.is_empty() || host.is_empty() || !payload.chars().all(is_base58_char) {
        return Err(format_error(addr));
    }

    Ok((payload, host))
}

/// Parses and validates a Pinch address, returning the embedded Ed25519
/// public key and relay host.
///
/// # Errors
///
/// Returns [`PinchError::InvalidAddress`] if the format is invalid, the
/// payload is not valid base58, the decoded payload is not exactly 36
/// bytes, or the checksum does not match.
pub fn validate_address(addr: &str) -> Result<([u8; 32], String)> {
    let (payload, host) = parse_address(addr)?;

    let decoded =
        bs58::decode(payload)
            .into_vec()
            .map_err(|e| PinchError::InvalidAddress {
                reason: format!("invalid base58 in address: {e}"),
            })?;

    if decoded.len() != PAYLOAD_LEN {
        return Err(PinchError::InvalidAddress {
            reason: format!(
                "invalid address payload length: expected {PAYLOAD_LEN}, got {}",
                decoded.len()
            ),
        });
    }

    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&decoded[..32]);

    let digest = Sha256::digest(public_key);
    if decoded[32..] != digest[..CHECKSUM_LEN] {
        return Err(PinchError::InvalidAddress {
            reason: "address checksum mismatch".into(),
        });
    }

    Ok((public_key, host.to_owned()))
}

/// Reports whether `c` belongs to the Bitcoin base58 alphabet
/// (`[1-9A-HJ-NP-Za-km-z]`).
fn is_base58_char(c: char) -> bool {
    matches!(c, '1'..='9' | 'A'..='H' | 'J'..='N' | 'P'..='Z' | 'a'..='k' | 'm'..='z')
}

fn format_error(addr: &str) -> PinchError {
    PinchError::InvalidAddress {
        reason: format!("invalid address format: {addr:?}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
