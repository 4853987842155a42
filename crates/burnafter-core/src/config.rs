//! Configuration for the burnafter daemon and client.
//!
//! The daemon receives its entire configuration as a single JSON string
//! passed as its first positional argument; [`Config::to_arg`] and
//! [`Config::from_arg`] are the two ends of that contract. Two environment
//! variables (named by `envar_socket` / `envar_debug`, `BURNAFTER_SOCKET_PATH`
//! and `BURNAFTER_DEBUG` by default) override the socket path and debug flag
//! at daemon startup.
//!
//! Durations are serialized as integer seconds.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity;

/// Default inactivity TTL for stored secrets: 4 hours.
pub const DEFAULT_TTL_SECS: u64 = 4 * 60 * 60;

/// Default daemon inactivity shutdown timeout: 10 minutes.
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 10 * 60;

/// Default maximum number of stored secrets.
pub const DEFAULT_MAX_SECRETS: usize = 100;

/// Default maximum size of a single secret: 1 MiB.
pub const DEFAULT_MAX_SECRET_SIZE: u64 = 1024 * 1024;

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration argument is not valid JSON.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Options shared by the daemon and the client.
///
/// This struct is the daemon's command-line contract: the client serializes
/// it to JSON and passes it as the single positional argument when spawning
/// the daemon. Missing keys take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the Unix socket. Empty = derive from the executable digest.
    pub socket_path: String,

    /// Default inactivity TTL for secrets stored with ttl 0, in seconds.
    pub default_ttl: u64,

    /// Seconds without any RPC before the daemon shuts itself down
    /// (default: 10 minutes). 0 disables the inactivity shutdown.
    pub inactivity_timeout: u64,

    /// Emit debug logging and keep the spawned daemon's stderr attached.
    pub debug: bool,

    /// Name of the environment variable overriding the socket path.
    pub envar_socket: String,

    /// Name of the environment variable overriding the debug flag.
    pub envar_debug: String,

    /// Maximum number of secrets the daemon will hold.
    pub max_secrets: usize,

    /// Maximum size of a single secret in bytes.
    pub max_secret_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: String::new(),
            default_ttl: DEFAULT_TTL_SECS,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            debug: false,
            envar_socket: "BURNAFTER_SOCKET_PATH".to_string(),
            envar_debug: "BURNAFTER_DEBUG".to_string(),
            max_secrets: DEFAULT_MAX_SECRETS,
            max_secret_size: DEFAULT_MAX_SECRET_SIZE,
        }
    }
}

impl Config {
    /// Serialize to the single-argument form the daemon accepts.
    pub fn to_arg(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the daemon's single configuration argument.
    pub fn from_arg(arg: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(arg)?)
    }

    /// Apply environment-variable overrides.
    ///
    /// The variables consulted are the ones this config names, so a client
    /// can rename them without recompiling the daemon.
    pub fn apply_env(&mut self) {
        if !self.envar_socket.is_empty() {
            if let Ok(path) = std::env::var(&self.envar_socket) {
                if !path.is_empty() {
                    self.socket_path = path;
                }
            }
        }
        if !self.envar_debug.is_empty() {
            if let Ok(value) = std::env::var(&self.envar_debug) {
                self.debug = !matches!(value.as_str(), "" | "0" | "false");
            }
        }
    }

    /// The configured socket path, or the digest-derived default.
    pub fn socket_path_or_default(&self) -> PathBuf {
        if self.socket_path.is_empty() {
            identity::default_socket_path()
        } else {
            PathBuf::from(&self.socket_path)
        }
    }

    /// Default secret TTL as a duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl)
    }

    /// Inactivity shutdown timeout, `None` when disabled.
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        (self.inactivity_timeout > 0).then(|| Duration::from_secs(self.inactivity_timeout))
    }
}

/// Client-side options.
///
/// Extends the shared [`Config`] with the compile-time client nonce and the
/// fallback routing switches. The nonce never travels in the daemon's
/// configuration argument; it is sent per-request.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Options forwarded to a spawned daemon.
    pub common: Config,

    /// Compile-time nonce mixed into key derivation. May be empty.
    pub nonce: String,

    /// Never start or talk to a daemon; use the encrypted-file fallback.
    pub no_server: bool,

    /// Fail instead of degrading to the fallback when no daemon can start.
    pub no_fallback: bool,
}

/// Per-store options: expiration behavior of a single secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Inactivity TTL in seconds; 0 means the server default.
    pub ttl_seconds: i64,

    /// Absolute deadline in seconds from now; 0 means none.
    pub absolute_expiration_seconds: i64,
}

impl StoreOptions {
    /// Set the inactivity TTL in seconds.
    pub fn with_ttl(mut self, secs: i64) -> Self {
        self.ttl_seconds = secs;
        self
    }

    /// Set an absolute deadline, in seconds from now.
    pub fn with_absolute_expiration(mut self, secs: i64) -> Self {
        self.absolute_expiration_seconds = secs;
        self
    }
}
