//! Two-phase key enrollment over the relay database.
//!
//! Agents register their public key as a *pending* entry and receive a
//! short claim code. An operator approves the enrollment by presenting
//! the code, which atomically moves the key into the approved table.
//! Approved keys gate session admission.
//!
//! Pending rows are stored as JSON so operators can inspect them with
//! standard tooling; approved rows map the base64 public key directly
//! to its address.

use std::time::Duration;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Batch;

use pinch_types::{PinchError, Result};

use crate::storage_err;

/// Tree holding unclaimed enrollments, keyed by claim code.
const PENDING_TREE: &str = "pending_registry";

/// Tree holding approved keys, keyed by base64 public key.
const KEY_TREE: &str = "key_registry";

/// Random bytes per claim code; hex-encoded to 8 characters.
const CLAIM_CODE_BYTES: usize = 4;

/// How many times to regenerate a colliding claim code before giving
/// up. Collisions are astronomically unlikely with a working RNG, so
/// exhausting this bound signals an entropy failure worth surfacing.
const MAX_CODE_ATTEMPTS: usize = 5;

// ---------------------------------------------------------------------------
// PendingEntry
// ---------------------------------------------------------------------------

/// An unclaimed enrollment awaiting operator approval.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingEntry {
    /// Base64-encoded Ed25519 public key.
    pub_key_b64: String,
    /// Pinch address the key claims.
    address: String,
    /// Unix seconds at registration; drives TTL expiry.
    registered_at: i64,
}

// ---------------------------------------------------------------------------
// KeyRegistry
// ---------------------------------------------------------------------------

/// Store for pending and approved agent key registrations.
pub struct KeyRegistry {
    pending: sled::Tree,
    approved: sled::Tree,
}

impl KeyRegistry {
    /// Creates or opens the registry trees in the given database.
    pub fn new(db: &sled::Db) -> Result<Self> {
        let pending = db
            .open_tree(PENDING_TREE)
            .map_err(|e| storage_err("failed to open pending registry", e))?;
        let approved = db
            .open_tree(KEY_TREE)
            .map_err(|e| storage_err("failed to open key registry", e))?;
        Ok(Self { pending, approved })
    }

    /// Stores a pending registration and returns its 8-character hex
    /// claim code.
    ///
    /// On the (vanishingly rare) collision with an existing pending
    /// code, a fresh code is generated; repeated collisions indicate a
    /// broken RNG and surface as an error.
    pub fn register_pending(&self, pub_key_b64: &str, address: &str) -> Result<String> {
        let entry = PendingEntry {
            pub_key_b64: pub_key_b64.to_owned(),
            address: address.to_owned(),
            registered_at: Utc::now().timestamp(),
        };
        let data = serde_json::to_vec(&entry)
            .map_err(|e| storage_err("failed to serialize pending entry", e))?;

        for _ in 0..MAX_CODE_ATTEMPTS {
            let mut code = [0u8; CLAIM_CODE_BYTES];
            OsRng.fill_bytes(&mut code);
            let claim_code = hex::encode(code);

            // Insert-if-absent so a concurrent registration can never
            // overwrite an existing pending entry.
            let swap = self
                .pending
                .compare_and_swap(
                    claim_code.as_bytes(),
                    None as Option<&[u8]>,
                    Some(data.as_slice()),
                )
                .map_err(|e| storage_err("failed to store pending entry", e))?;

            if swap.is_ok() {
                return Ok(claim_code);
            }
        }

        Err(PinchError::StorageError {
            reason: format!(
                "claim code collision persisted across {MAX_CODE_ATTEMPTS} attempts; \
                 random source is likely broken"
            ),
        })
    }

    /// Approves a pending registration by claim code, moving it into
    /// the approved table.
    ///
    /// The read, approval insert, and pending delete happen in one
    /// transaction; no partial state is ever observable.
    ///
    /// # Errors
    ///
    /// Returns [`PinchError::ClaimNotFound`] if the code does not
    /// exist, or [`PinchError::StorageError`] on database faults.
    pub fn claim(&self, claim_code: &str) -> Result<String> {
        let outcome = (&self.pending, &self.approved).transaction(|(pending, approved)| {
            let raw = match pending.get(claim_code.as_bytes())? {
                Some(raw) => raw,
                None => {
                    return Err(ConflictableTransactionError::Abort(
                        PinchError::ClaimNotFound,
                    ))
                }
            };

            let entry: PendingEntry = serde_json::from_slice(&raw).map_err(|e| {
                ConflictableTransactionError::Abort(storage_err(
                    "malformed pending entry",
                    e,
                ))
            })?;

            approved.insert(entry.pub_key_b64.as_bytes(), entry.address.as_bytes())?;
            pending.remove(claim_code.as_bytes())?;
            Ok(entry.address)
        });

        match outcome {
            Ok(address) => Ok(address),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(storage_err("claim transaction failed", e)),
        }
    }

    /// Reports whether the given base64-encoded public key has been
    /// approved.
    ///
    /// Storage faults read as "not approved": admission fails closed.
    pub fn is_approved(&self, pub_key_b64: &str) -> bool {
        matches!(self.approved.get(pub_key_b64.as_bytes()), Ok(Some(_)))
    }

    /// Removes pending registrations older than `ttl`, along with any
    /// rows that no longer parse. Idempotent; safe to run periodically.
    pub fn sweep_pending(&self, ttl: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp() - ttl.as_secs() as i64;

        let mut batch = Batch::default();
        let mut removed = 0usize;
        for item in self.pending.iter() {
            let (key, raw) = item.map_err(|e| storage_err("pending sweep iteration failed", e))?;

            let expired = match serde_json::from_slice::<PendingEntry>(&raw) {
                // Malformed rows are unclaimable; treat as expired.
                Err(_) => true,
                Ok(entry) => entry.registered_at <= cutoff,
            };

            if expired {
                batch.remove(key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.pending
                .apply_batch(batch)
                .map_err(|e| storage_err("pending sweep delete failed", e))?;
            tracing::debug!(removed, "swept expired pending registrations");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn open_registry() -> (tempfile::TempDir, sled::Db, KeyRegistry) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let db = crate::open_db(&dir.path().join("registry.db")).expect("open db");
        let registry = KeyRegistry::new(&db).expect("open registry");
        (dir, db, registry)
    }

    #[test]
    fn register_returns_eight_hex_chars() -> Result<()> {
        let (_dir, _db, registry) = open_registry();

        let code = registry.register_pending("dGVzdHB1YmtleQ==", "pinch:abc@relay.test")?;
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        Ok(())
    }

    #[test]
    fn register_produces_distinct_codes() -> Result<()> {
        let (_dir, _db, registry) = open_registry();

        let code1 = registry.register_pending("a", "addr1")?;
        let code2 = registry.register_pending("b", "addr2")?;
        assert_ne!(code1, code2);
        Ok(())
    }

    #[test]
    fn claim_approves_and_removes_pending() -> Result<()> {
        let (_dir, _db, registry) = open_registry();

        let pub_key = "dGVzdHB1YmtleQ==";
        let address = "pinch:abc@relay.test";
        let code = registry.register_pending(pub_key, address)?;

        assert!(!registry.is_approved(pub_key));
        assert_eq!(registry.claim(&code)?, address);
        assert!(registry.is_approved(pub_key));

        // The code was consumed; a second claim must fail.
        assert!(matches!(
            registry.claim(&code),
            Err(PinchError::ClaimNotFound)
        ));
        Ok(())
    }

    #[test]
    fn claim_unknown_code_fails() {
        let (_dir, _db, registry) = open_registry();
        assert!(matches!(
            registry.claim("deadbeef"),
            Err(PinchError::ClaimNotFound)
        ));
    }

    #[test]
    fn sweep_zero_ttl_removes_everything() -> Result<()> {
        let (_dir, _db, registry) = open_registry();

        let pub_key = "dGVzdHB1YmtleQ==";
        let code = registry.register_pending(pub_key, "pinch:abc@relay.test")?;

        let removed = registry.sweep_pending(Duration::ZERO)?;
        assert_eq!(removed, 1);

        assert!(matches!(
            registry.claim(&code),
            Err(PinchError::ClaimNotFound)
        ));
        // Swept, not claimed: the key must not appear approved.
        assert!(!registry.is_approved(pub_key));
        Ok(())
    }

    #[test]
    fn sweep_preserves_fresh_entries() -> Result<()> {
        let (_dir, _db, registry) = open_registry();

        let address = "pinch:abc@relay.test";
        let code = registry.register_pending("dGVzdHB1YmtleQ==", address)?;

        let removed = registry.sweep_pending(Duration::from_secs(24 * 3600))?;
        assert_eq!(removed, 0);
        assert_eq!(registry.claim(&code)?, address);
        Ok(())
    }

    #[test]
    fn sweep_removes_malformed_rows() -> Result<()> {
        let (_dir, _db, registry) = open_registry();

        registry
            .pending
            .insert(b"cafe0123", b"not json at all")
            .expect("raw insert");

        let removed = registry.sweep_pending(Duration::from_secs(24 * 3600))?;
        assert_eq!(removed, 1);
        Ok(())
    }

    #[test]
    fn claim_survives_restart() -> Result<()> {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("registry.db");

        let code = {
            let db = crate::open_db(&path)?;
            let registry = KeyRegistry::new(&db)?;
            registry.register_pending("cGVyc2lzdGVk", "pinch:abc@relay.test")?
        };

        let db = crate::open_db(&path)?;
        let registry = KeyRegistry::new(&db)?;
        assert_eq!(registry.claim(&code)?, "pinch:abc@relay.test");
        assert!(registry.is_approved("cGVyc2lzdGVk"));
        Ok(())
    }
}
