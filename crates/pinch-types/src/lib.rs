//! Core shared types for the Pinch relay.
//!
//! This crate defines the central error type and configuration used
//! across the workspace. No other crate should define shared types —
//! everything lives here.

pub mod config;

use thiserror::Error;

// ---------------------------------------------------------------------------
// PinchError
// ---------------------------------------------------------------------------

/// Central error type for the Pinch relay.
///
/// All crates in the workspace convert their internal errors into variants
/// of this enum, ensuring a unified error handling surface.
#[derive(Debug, Error)]
pub enum PinchError {
    /// The provided address is malformed or fails checksum validation.
    #[error("invalid address: {reason}")]
    InvalidAddress {
        /// Human-readable description of why the address is invalid.
        reason: String,
    },

    /// An envelope frame is malformed or carries an unsupported version.
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope {
        /// Human-readable description of the envelope failure.
        reason: String,
    },

    /// A cryptographic operation failed (key conversion, encryption,
    /// decryption, authentication).
    #[error("crypto error: {reason}")]
    CryptoError {
        /// Human-readable description of the cryptographic failure.
        reason: String,
    },

    /// A storage or database operation failed.
    #[error("storage error: {reason}")]
    StorageError {
        /// Human-readable description of the storage failure.
        reason: String,
    },

    /// A networking or transport operation failed.
    #[error("transport error: {reason}")]
    TransportError {
        /// Human-readable description of the transport failure.
        reason: String,
    },

    /// A configuration value is invalid or missing.
    #[error("config error: {reason}")]
    ConfigError {
        /// Human-readable description of the configuration problem.
        reason: String,
    },

    /// A claim code does not exist in the pending registry.
    ///
    /// This is the one error callers match on: the enrollment flow
    /// distinguishes "unknown or expired code" from storage faults.
    #[error("claim code not found or expired")]
    ClaimNotFound,
}

/// Convenience result type using [`PinchError`].
pub type Result<T> = std::result::Result<T, PinchError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
