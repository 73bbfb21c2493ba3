//! Relay configuration with sensible defaults.
//!
//! All operational parameters are centralized here. Every value has a
//! documented default; the environment can override the deployment-
//! specific ones (port, relay host, database path, admin secret).

use serde::{Deserialize, Serialize};

use crate::{PinchError, Result};

/// Environment variable for the listen port.
pub const ENV_PORT: &str = "PINCH_RELAY_PORT";

/// Environment variable for the relay host used in delivery checks.
pub const ENV_RELAY_HOST: &str = "PINCH_RELAY_HOST";

/// Environment variable for the database path.
pub const ENV_DB_PATH: &str = "PINCH_RELAY_DB";

/// Environment variable for the enrollment admin secret.
pub const ENV_ADMIN_SECRET: &str = "PINCH_RELAY_ADMIN_SECRET";

/// Global relay configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    /// TCP port the HTTP/WebSocket server binds to.
    pub port: u16,

    /// Host component this relay accepts recipient addresses for.
    /// When unset, delivery-admissibility checks are skipped.
    pub relay_host: Option<String>,

    /// Path to the embedded key-value database.
    pub db_path: String,

    /// Secret required by the enrollment claim endpoint.
    /// When unset, claims are rejected.
    pub admin_secret: Option<String>,

    /// Capacity of each session's outbound frame buffer.
    pub send_buffer: usize,

    /// Maximum queued messages per recipient. Oldest entries are
    /// dropped when the limit is reached.
    pub max_queue_per_recipient: usize,

    /// Time-to-live for queued messages, in seconds.
    pub message_retention_secs: u64,

    /// Time-to-live for unclaimed pending registrations, in seconds.
    pub pending_ttl_secs: u64,

    /// Interval between heartbeat pings, in seconds.
    pub ping_interval_secs: u64,

    /// How long a session may go without a pong before teardown,
    /// in seconds.
    pub pong_timeout_secs: u64,

    /// Grace period for draining connections on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            relay_host: None,
            db_path: "pinch-relay.db".into(),
            admin_secret: None,
            send_buffer: 16,
            max_queue_per_recipient: 1000,
            message_retention_secs: 72 * 3600,
            pending_ttl_secs: 24 * 3600,
            ping_interval_secs: 30,
            pong_timeout_secs: 10,
            shutdown_grace_secs: 10,
        }
    }
}

impl RelayConfig {
    /// Builds a configuration from defaults plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`PinchError::ConfigError`] if `PINCH_RELAY_PORT` is set
    /// but not a valid port number.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = std::env::var(ENV_PORT) {
            config.port = port.parse().map_err(|_| PinchError::ConfigError {
                reason: format!("invalid {ENV_PORT} value: {port:?}"),
            })?;
        }
        if let Ok(host) = std::env::var(ENV_RELAY_HOST) {
            if !host.is_empty() {
                config.relay_host = Some(host);
            }
        }
        if let Ok(path) = std::env::var(ENV_DB_PATH) {
            if !path.is_empty() {
                config.db_path = path;
            }
        }
        if let Ok(secret) = std::env::var(ENV_ADMIN_SECRET) {
            if !secret.is_empty() {
                config.admin_secret = Some(secret);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates all configuration values.
    ///
    /// Returns an error if any value is outside its acceptable range.
    pub fn validate(&self) -> Result<()> {
        if self.send_buffer == 0 {
            return Err(PinchError::ConfigError {
                reason: "send_buffer must be greater than 0".into(),
            });
        }

        if self.max_queue_per_recipient == 0 {
            return Err(PinchError::ConfigError {
                reason: "max_queue_per_recipient must be greater than 0".into(),
            });
        }

        if self.message_retention_secs == 0 {
            return Err(PinchError::ConfigError {
                reason: "message_retention_secs must be greater than 0".into(),
            });
        }

        if self.ping_interval_secs == 0 {
            return Err(PinchError::ConfigError {
                reason: "ping_interval_secs must be greater than 0".into(),
            });
        }

        if self.pong_timeout_secs == 0 {
            return Err(PinchError::ConfigError {
                reason: "pong_timeout_secs must be greater than 0".into(),
            });
        }

        Ok(())
    }
}
