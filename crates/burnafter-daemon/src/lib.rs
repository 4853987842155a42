//! The burnafter daemon.
//!
//! A per-executable secret-store daemon listening on a Unix socket. The
//! daemon authenticates every caller by the digest of the executable behind
//! its PID, encrypts secrets under keys derived from that identity plus a
//! per-process session ID, and shuts itself down when it has nothing left
//! to do.
//!
//! The daemon binary is normally embedded in the client library and spawned
//! on demand; see the `burnafter-client` crate.

pub mod daemon;
pub mod peercred;
pub mod socket;
pub mod storage;

// Re-export main components
pub use daemon::{Daemon, DaemonState};
pub use peercred::PeerCredentials;
pub use storage::{MemoryStorage, Payload, Storage, StorageError};
