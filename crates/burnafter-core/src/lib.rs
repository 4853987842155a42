//! Core types and utilities for burnafter.
//!
//! burnafter provides ephemeral, per-process storage of small secrets behind
//! a self-spawned local daemon. Secrets are encrypted at rest under keys
//! derived from the identity of the client executable, so a binary with a
//! different digest can never read them back. This crate holds the pieces
//! shared by the daemon and the client:
//!
//! - [`crypto`]: key derivation, authenticated encryption, digests, zeroing
//! - [`identity`]: resolving and hashing the executable behind a PID
//! - [`protocol`]: IPC protocol types (`Request`, `Response`, `ErrorCode`)
//! - [`config`]: daemon/client configuration and its JSON argument form
//!
//! # Example
//!
//! ```
//! use burnafter_core::protocol::Request;
//!
//! let request = Request::Get {
//!     name: "api-token".to_string(),
//!     client_nonce: "n1".to_string(),
//! };
//!
//! // Serialize to a JSON line for IPC
//! let line = request.to_json_line().unwrap();
//! assert!(line.contains("get"));
//! ```

pub mod config;
pub mod crypto;
pub mod identity;
pub mod protocol;

// Re-export commonly used types at the crate root for convenience
pub use config::{ClientConfig, Config, ConfigError, StoreOptions};
pub use crypto::{CryptoError, DerivedKey};
pub use identity::IdentityError;
pub use protocol::{ErrorCode, ProtocolError, Request, Response};
