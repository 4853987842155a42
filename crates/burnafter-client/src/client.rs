//! The burnafter client facade.
//!
//! Host applications embed this client to store and retrieve secrets. The
//! client locates or spawns the daemon for its own executable and speaks
//! the newline-JSON protocol over the Unix socket; when no daemon can be
//! started (or `no_server` is set) it degrades to the encrypted-file
//! fallback store, transparently for the caller.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretSlice;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

use burnafter_core::config::{ClientConfig, StoreOptions};
use burnafter_core::protocol::{ErrorCode, ProtocolError, Request, Response};

use crate::fallback::{FallbackError, FallbackStore};
use crate::launcher::{self, LaunchError};

/// Timeout wrapping a Ping RPC.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout wrapping Store and Get RPCs.
const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to the embedding application.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No connection to a daemon; call `connect` first.
    #[error("not connected to daemon")]
    NotConnected,

    /// The daemon could not be located or spawned.
    #[error("launching daemon: {0}")]
    Launch(#[from] LaunchError),

    /// The daemon refused the request.
    #[error("server error ({code}): {message}")]
    Server {
        /// Error kind reported by the daemon.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// The conversation with the daemon broke down.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The fallback file store failed.
    #[error(transparent)]
    Fallback(#[from] FallbackError),

    /// Delete has no daemon-mode RPC; it only works against the fallback
    /// store.
    #[error("delete is only supported in fallback mode")]
    DeleteUnsupported,
}

struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

/// The burnafter client.
///
/// # Example
///
/// ```no_run
/// use burnafter_client::Client;
/// use burnafter_core::config::{ClientConfig, StoreOptions};
///
/// let mut client = Client::new(ClientConfig {
///     nonce: "build-time-nonce".to_string(),
///     ..ClientConfig::default()
/// });
/// client.connect()?;
/// client.store("api-token", b"hunter2", StoreOptions::default().with_ttl(300))?;
/// let secret = client.get("api-token")?;
/// # Ok::<(), burnafter_client::ClientError>(())
/// ```
pub struct Client {
    config: ClientConfig,
    socket_path: PathBuf,
    fallback: FallbackStore,
    connection: Option<Connection>,
    launch_failed: bool,
}

impl Client {
    /// Create a client. No daemon is contacted until [`Client::connect`].
    pub fn new(mut config: ClientConfig) -> Self {
        // Honor the same environment overrides the daemon applies, so both
        // sides agree on the socket path.
        config.common.apply_env();

        let socket_path = config.common.socket_path_or_default();
        let fallback = FallbackStore::new(config.nonce.clone());

        Self {
            config,
            socket_path,
            fallback,
            connection: None,
            launch_failed: false,
        }
    }

    /// Whether operations route to the fallback file store.
    fn use_fallback(&self) -> bool {
        self.config.no_server || self.launch_failed
    }

    /// Establish the connection, spawning the daemon when necessary.
    ///
    /// With `no_server` set this is a no-op. A launch failure switches this
    /// client instance to the fallback store for its lifetime, unless
    /// `no_fallback` forbids that, in which case the failure is returned.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.use_fallback() {
            return Ok(());
        }

        match launcher::ensure_daemon(&self.config.common, &self.socket_path) {
            Ok(()) => {
                let stream = UnixStream::connect(&self.socket_path)
                    .map_err(|e| ClientError::Protocol(ProtocolError::Io(e)))?;
                stream
                    .set_read_timeout(Some(RPC_TIMEOUT))
                    .map_err(|e| ClientError::Protocol(ProtocolError::Io(e)))?;
                stream
                    .set_write_timeout(Some(RPC_TIMEOUT))
                    .map_err(|e| ClientError::Protocol(ProtocolError::Io(e)))?;

                let reader = BufReader::new(
                    stream
                        .try_clone()
                        .map_err(|e| ClientError::Protocol(ProtocolError::Io(e)))?,
                );
                self.connection = Some(Connection { stream, reader });
                debug!(path = %self.socket_path.display(), "Connected to daemon");
                Ok(())
            }
            Err(e) if self.config.no_fallback => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "Daemon unavailable, degrading to fallback store");
                self.launch_failed = true;
                Ok(())
            }
        }
    }

    /// Store a secret.
    pub fn store(
        &mut self,
        name: &str,
        secret: &[u8],
        opts: StoreOptions,
    ) -> Result<(), ClientError> {
        if self.use_fallback() {
            return Ok(self
                .fallback
                .store(name, secret, self.fallback_expiry(&opts))?);
        }

        let request = Request::Store {
            name: name.to_string(),
            secret: secret.to_vec(),
            ttl_seconds: opts.ttl_seconds,
            absolute_expiration_seconds: opts.absolute_expiration_seconds,
            client_nonce: self.config.nonce.clone(),
        };

        match self.rpc(request, RPC_TIMEOUT)? {
            Response::Stored => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Retrieve a secret. The returned value zeroes itself on drop.
    pub fn get(&mut self, name: &str) -> Result<SecretSlice<u8>, ClientError> {
        if self.use_fallback() {
            let mut plaintext = self.fallback.get(name)?;
            return Ok(SecretSlice::from(std::mem::take(&mut *plaintext)));
        }

        let request = Request::Get {
            name: name.to_string(),
            client_nonce: self.config.nonce.clone(),
        };

        match self.rpc(request, RPC_TIMEOUT)? {
            Response::Secret { secret } => Ok(SecretSlice::from(secret)),
            other => Err(unexpected(other)),
        }
    }

    /// Delete a secret. Only supported against the fallback store; the
    /// daemon has no Delete RPC yet.
    pub fn delete(&mut self, name: &str) -> Result<(), ClientError> {
        if self.use_fallback() {
            return Ok(self.fallback.delete(name)?);
        }

        Err(ClientError::DeleteUnsupported)
    }

    /// Check liveness. Against the fallback store this is trivially true.
    pub fn ping(&mut self) -> Result<(), ClientError> {
        if self.use_fallback() {
            return Ok(());
        }

        match self.rpc(Request::Ping, PING_TIMEOUT)? {
            Response::Pong { alive: true } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Drop the daemon connection. The daemon itself keeps running until
    /// its own timers take it down.
    pub fn close(&mut self) {
        self.connection = None;
    }

    /// The socket path this client launches and dials.
    pub fn socket_path(&self) -> &std::path::Path {
        &self.socket_path
    }

    /// One request/response exchange on the established connection.
    fn rpc(&mut self, mut request: Request, timeout: Duration) -> Result<Response, ClientError> {
        let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;

        let mut line = request.to_json_line()?;
        zeroize_request(&mut request);

        let _ = connection.stream.set_read_timeout(Some(timeout));
        let _ = connection.stream.set_write_timeout(Some(timeout));

        let written = connection
            .stream
            .write_all(line.as_bytes())
            .and_then(|_| connection.stream.flush());
        line.zeroize();
        written.map_err(ProtocolError::Io)?;

        let mut response_line = String::new();
        let read = connection.reader.read_line(&mut response_line);
        match read {
            Ok(0) => {
                self.connection = None;
                return Err(ClientError::Protocol(ProtocolError::ConnectionClosed));
            }
            Ok(_) => {}
            Err(e) => {
                self.connection = None;
                return Err(ClientError::Protocol(ProtocolError::Io(e)));
            }
        }

        let response = Response::parse(response_line.trim());
        response_line.zeroize();

        match response? {
            Response::Error { code, message } => Err(ClientError::Server { code, message }),
            response => Ok(response),
        }
    }

    /// Absolute expiry stamp for a fallback file.
    ///
    /// The file store has no inactivity semantics, so the stamp is the
    /// absolute deadline when one is given, otherwise now + TTL (or the
    /// default TTL).
    fn fallback_expiry(&self, opts: &StoreOptions) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let relative = if opts.absolute_expiration_seconds > 0 {
            opts.absolute_expiration_seconds as u64
        } else if opts.ttl_seconds > 0 {
            opts.ttl_seconds as u64
        } else {
            self.config.common.default_ttl
        };

        now.saturating_add(relative)
    }
}

/// Zero any plaintext a request carries.
fn zeroize_request(request: &mut Request) {
    if let Request::Store { secret, .. } = request {
        secret.zeroize();
    }
}

fn unexpected(response: Response) -> ClientError {
    ClientError::Protocol(ProtocolError::InvalidMessage(format!(
        "unexpected response type: {response:?}"
    )))
}
