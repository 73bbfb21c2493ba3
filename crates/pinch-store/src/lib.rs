//! Durable storage for the Pinch relay.
//!
//! A single embedded sled database holds every persistent concern, one
//! tree per bucket:
//!
//! - `pending_registry` — unclaimed key enrollments (see [`KeyRegistry`])
//! - `key_registry` — approved public keys (see [`KeyRegistry`])
//! - `messages` — queued frames for offline recipients (see
//!   [`MessageQueue`])
//!
//! The database is opened once at startup and shared by reference.

pub mod keyregistry;
pub mod queue;

pub use keyregistry::KeyRegistry;
pub use queue::{MessageQueue, QueuedMessage};

use pinch_types::{PinchError, Result};

/// Opens (or creates) the relay database at `path`.
///
/// # Errors
///
/// Returns [`PinchError::StorageError`] if the database cannot be
/// opened (missing permissions, lock held by another process, or a
/// corrupt store).
pub fn open_db(path: &std::path::Path) -> Result<sled::Db> {
    sled::open(path).map_err(|e| PinchError::StorageError {
        reason: format!("failed to open database at '{}': {e}", path.display()),
    })
}

/// Maps a sled error into the workspace error type.
pub(crate) fn storage_err(context: &str, e: impl std::fmt::Display) -> PinchError {
    PinchError::StorageError {
        reason: format!("{context}: {e}"),
    }
}
