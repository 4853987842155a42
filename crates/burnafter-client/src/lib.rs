//! Client library for the burnafter secret store.
//!
//! burnafter gives host applications ephemeral, per-process storage of
//! small secrets. A single executable carries both the client and an
//! embedded daemon image: the first operation spawns the daemon (from an
//! anonymous in-memory file where the platform allows it), and every secret
//! is encrypted under a key derived from the digest of the client
//! executable, so no other binary can read it back. When no daemon can be
//! started the client degrades to per-secret encrypted files.
//!
//! - [`client`]: the facade applications embed (`Client`)
//! - [`launcher`]: locating/spawning the daemon from the embedded image
//! - [`embedded`]: the per-target compressed daemon image
//! - [`fallback`]: the encrypted-file degraded mode
//!
//! # Example
//!
//! ```no_run
//! use burnafter_client::Client;
//! use burnafter_core::config::{ClientConfig, StoreOptions};
//!
//! let mut client = Client::new(ClientConfig::default());
//! client.connect()?;
//! client.store("db-password", b"s3cret", StoreOptions::default())?;
//! # Ok::<(), burnafter_client::ClientError>(())
//! ```

pub mod client;
pub mod embedded;
pub mod fallback;
pub mod launcher;

// Re-export main components
pub use client::{Client, ClientError};
pub use fallback::{FallbackError, FallbackStore};
pub use launcher::LaunchError;
