//! Protocol types for client-daemon communication.
//!
//! The burnafter protocol is JSON over a Unix socket with newline-delimited
//! messages. A connection carries a sequence of request/response pairs in
//! order; the peer credentials read at handshake time apply to every request
//! on the connection.
//!
//! All failures travel inside the response body as an error code plus a
//! human-readable message, never as transport-level faults, so the daemon
//! stays strictly request/response.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request from the client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Store a secret under a caller-chosen name.
    Store {
        /// Name of the secret, unique within a daemon instance.
        name: String,

        /// The secret bytes to protect.
        secret: Vec<u8>,

        /// Inactivity TTL in seconds; 0 means the server default.
        #[serde(default)]
        ttl_seconds: i64,

        /// Optional absolute deadline, in seconds from now; 0 means none.
        #[serde(default)]
        absolute_expiration_seconds: i64,

        /// Compile-time nonce of the client, a key-derivation input.
        #[serde(default)]
        client_nonce: String,
    },

    /// Retrieve a previously stored secret.
    Get {
        /// Name of the secret.
        name: String,

        /// Must match the nonce used at store time for the key to derive.
        #[serde(default)]
        client_nonce: String,
    },

    /// Health check. Also resets the daemon's inactivity timer.
    Ping,
}

/// A response from the daemon to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// The secret was stored.
    Stored,

    /// A retrieved secret.
    Secret {
        /// The decrypted secret bytes.
        secret: Vec<u8>,
    },

    /// Response to a ping request.
    Pong {
        /// Always true; a daemon that cannot answer does not answer.
        alive: bool,
    },

    /// An error response.
    Error {
        /// Machine-readable error kind.
        code: ErrorCode,

        /// Human-readable detail.
        message: String,
    },
}

/// Error kinds carried in RPC responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Peer credentials could not be read, or the platform reported no PID.
    CredentialError,

    /// The caller's executable could not be located or hashed.
    ExecutableError,

    /// The stored executable digest does not match the caller's.
    Unauthorized,

    /// No secret with that name exists.
    NotFound,

    /// The secret existed but exceeded its inactivity TTL; this call
    /// evicted it.
    ExpiredInactivity,

    /// The secret existed but passed its absolute deadline; this call
    /// evicted it.
    ExpiredAbsolute,

    /// The secret exceeds the maximum allowed size.
    SizeExceeded,

    /// The daemon already stores the maximum number of secrets.
    LimitExceeded,

    /// Key derivation, encryption, or decryption failed.
    CryptoError,

    /// The storage backend failed.
    StorageError,

    /// The request was malformed.
    InvalidRequest,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::CredentialError => "credential_error",
            ErrorCode::ExecutableError => "executable_error",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ExpiredInactivity => "expired_inactivity",
            ErrorCode::ExpiredAbsolute => "expired_absolute",
            ErrorCode::SizeExceeded => "size_exceeded",
            ErrorCode::LimitExceeded => "limit_exceeded",
            ErrorCode::CryptoError => "crypto_error",
            ErrorCode::StorageError => "storage_error",
            ErrorCode::InvalidRequest => "invalid_request",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize or parse a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to read/write on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Received a well-formed message of the wrong kind.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Connection closed before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Request {
    /// Parse a request from a JSON string.
    pub fn parse(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::Serialization)
    }

    /// Serialize the request to a JSON string with trailing newline.
    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

impl Response {
    /// Create a stored confirmation response.
    pub fn stored() -> Self {
        Response::Stored
    }

    /// Create a secret response.
    pub fn secret(secret: Vec<u8>) -> Self {
        Response::Secret { secret }
    }

    /// Create a pong response.
    pub fn pong() -> Self {
        Response::Pong { alive: true }
    }

    /// Create an error response.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    /// Parse a response from a JSON string.
    pub fn parse(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::Serialization)
    }

    /// Serialize the response to a JSON string with trailing newline.
    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}
