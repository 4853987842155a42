//! Daemon core: request handling, secret lifecycle, self-shutdown.
//!
//! The daemon holds encrypted payloads in a storage backend and a metadata
//! table (TTLs, deadlines, access times) in memory. The two are created and
//! deleted as a pair, payload first, so a failure between the writes leaves
//! the payload unreachable rather than the metadata dangling.
//!
//! Secrets die three ways: an expiry check during `Get`, the periodic
//! sweeper, or daemon shutdown. The daemon itself dies when its inactivity
//! timer fires, when a sweep finds nothing left to guard, or on a
//! termination signal; in every case it drains existing connections,
//! refuses new ones, and unlinks its socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use burnafter_core::config::Config;
use burnafter_core::crypto::{self, DerivedKey};
use burnafter_core::identity;
use burnafter_core::protocol::{ErrorCode, Request, Response};

use crate::peercred::{self, PeerCredentials};
use crate::socket;
use crate::storage::{Payload, Storage, StorageError};

/// Interval between expiration sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Lifecycle state of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Created but not yet listening.
    Starting,
    /// Listening and serving requests.
    Serving,
    /// Refusing new connections, completing outstanding requests.
    Draining,
    /// Fully stopped; the socket has been unlinked.
    Stopped,
}

/// Lifecycle record for a single named secret.
///
/// The encrypted payload itself lives in the storage backend under the same
/// name; this table only drives expiration.
struct Metadata {
    inactivity_ttl: Duration,
    absolute_deadline: Option<Instant>,
    last_accessed: Instant,
}

impl Metadata {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_accessed) > self.inactivity_ttl
            || self.absolute_deadline.is_some_and(|deadline| now > deadline)
    }
}

/// The burnafter daemon.
pub struct Daemon {
    config: Config,

    /// Per-process random value mixed into every key derivation. Never
    /// persisted, never exposed; a daemon restart orphans all ciphertext.
    session_id: String,

    /// Metadata table. The sweeper holds the write guard for a whole pass.
    metadata: RwLock<HashMap<String, Metadata>>,

    storage: Arc<dyn Storage>,

    /// Guarded separately so request hot paths extend liveness without
    /// touching the metadata lock.
    last_activity: Mutex<Instant>,

    state: Mutex<DaemonState>,

    shutdown: watch::Sender<bool>,
}

impl Daemon {
    /// Create a daemon with the given configuration and storage backend.
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> anyhow::Result<Self> {
        let session_id = crypto::random_session_id()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            session_id,
            metadata: RwLock::new(HashMap::new()),
            storage,
            last_activity: Mutex::new(Instant::now()),
            state: Mutex::new(DaemonState::Starting),
            shutdown,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DaemonState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: DaemonState) {
        let mut current = self.state.lock().expect("state lock poisoned");
        debug!(from = ?*current, to = ?state, "Daemon state transition");
        *current = state;
    }

    /// Begin graceful shutdown: stop accepting, finish outstanding work.
    pub fn initiate_shutdown(&self) {
        // send_replace updates the value even with no receivers yet.
        self.shutdown.send_replace(true);
    }

    /// Run the daemon until it shuts itself down.
    ///
    /// Binds the socket, serves connections, and reacts to the inactivity
    /// timer, the sweeper, and termination signals. Returns after the
    /// socket has been unlinked.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let socket_path = self.config.socket_path_or_default();
        let listener = socket::bind(&socket_path)?;
        self.set_state(DaemonState::Serving);
        info!(path = %socket_path.display(), "Daemon listening for connections");

        let sweeper = Arc::clone(&self);
        tokio::spawn(async move { sweeper.run_sweeper().await });

        if self.config.inactivity_timeout().is_some() {
            let monitor = Arc::clone(&self);
            tokio::spawn(async move { monitor.run_inactivity_monitor().await });
        }

        let mut shutdown = self.shutdown.subscribe();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("Accepted connection");
                        let daemon = Arc::clone(&self);
                        let drain = self.shutdown.subscribe();
                        connections.spawn(async move {
                            daemon.handle_connection(stream, drain).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    self.initiate_shutdown();
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                    self.initiate_shutdown();
                    break;
                }
            }
        }

        self.set_state(DaemonState::Draining);
        self.initiate_shutdown();
        drop(listener);

        while connections.join_next().await.is_some() {}

        self.set_state(DaemonState::Stopped);
        let _ = std::fs::remove_file(&socket_path);
        info!("Daemon stopped");
        Ok(())
    }

    /// Periodically evict expired secrets; shut down once nothing is left.
    async fn run_sweeper(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
        let mut interval = tokio::time::interval_at(start, SWEEP_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (removed, remaining) = self.sweep_expired();
                    if removed > 0 {
                        debug!(removed = removed, "Swept expired secrets");
                    }
                    if remaining == 0 {
                        info!("No secrets left to guard, shutting down");
                        self.initiate_shutdown();
                        return;
                    }
                }
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
        }
    }

    /// One sweep pass. Holds the exclusive metadata guard for the whole
    /// pass, including the backend deletes, so concurrent requests observe
    /// either the pre- or post-sweep table.
    ///
    /// Returns `(removed, remaining)`.
    fn sweep_expired(&self) -> (usize, usize) {
        let mut metadata = self.metadata.write().expect("metadata lock poisoned");
        let now = Instant::now();

        let mut removed = Vec::new();
        metadata.retain(|name, entry| {
            if entry.is_expired(now) {
                removed.push(name.clone());
                false
            } else {
                true
            }
        });

        for name in &removed {
            // Backend errors during sweep are ignored; the metadata entry
            // is already gone and an orphaned payload is unreachable.
            if let Err(e) = self.storage.delete(name) {
                debug!(name = %name, error = %e, "Backend delete failed during sweep");
            }
        }

        (removed.len(), metadata.len())
    }

    /// Shut down after `inactivity_timeout` without a single RPC.
    async fn run_inactivity_monitor(self: Arc<Self>) {
        let Some(timeout) = self.config.inactivity_timeout() else {
            return;
        };
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let last = *self.last_activity.lock().expect("activity lock poisoned");
            let deadline = tokio::time::Instant::from_std(last + timeout);

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let last = *self.last_activity.lock().expect("activity lock poisoned");
                    if last.elapsed() >= timeout {
                        info!(timeout_secs = timeout.as_secs(), "Inactivity timeout reached, shutting down");
                        self.initiate_shutdown();
                        return;
                    }
                    // Activity arrived while we slept; re-arm from the new
                    // timestamp on the next loop iteration.
                }
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
        }
    }

    fn touch_activity(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Instant::now();
    }

    /// Serve one connection: probe peer credentials once, then answer
    /// newline-delimited requests until the client closes or we drain.
    async fn handle_connection(&self, stream: UnixStream, mut drain: watch::Receiver<bool>) {
        let creds = match peercred::peer_credentials(&stream) {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "Failed to read peer credentials, dropping connection");
                return;
            }
        };
        debug!(pid = creds.pid, uid = creds.uid, "Peer connected");

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            tokio::select! {
                read = reader.read_line(&mut line) => match read {
                    Ok(0) => return, // client closed
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Failed to read request");
                        return;
                    }
                },
                _ = drain.wait_for(|stop| *stop) => return,
            }

            let mut response = match Request::parse(line.trim()) {
                Ok(request) => self.handle_request(request, &creds),
                Err(e) => {
                    warn!(error = %e, "Failed to parse request");
                    Response::error(ErrorCode::InvalidRequest, e.to_string())
                }
            };
            // The request line may carry a plaintext secret.
            line.zeroize();

            let mut json = match response.to_json_line() {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize response");
                    return;
                }
            };
            zeroize_response(&mut response);

            let written = writer.write_all(json.as_bytes()).await;
            json.zeroize();
            if let Err(e) = written {
                error!(error = %e, "Failed to send response");
                return;
            }
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush response");
                return;
            }
        }
    }

    /// Dispatch a parsed request. Every verb counts as activity.
    fn handle_request(&self, request: Request, creds: &PeerCredentials) -> Response {
        self.touch_activity();

        match request {
            Request::Store {
                name,
                secret,
                ttl_seconds,
                absolute_expiration_seconds,
                client_nonce,
            } => self.handle_store(
                name,
                secret,
                ttl_seconds,
                absolute_expiration_seconds,
                client_nonce,
                creds,
            ),
            Request::Get { name, client_nonce } => self.handle_get(name, client_nonce, creds),
            Request::Ping => Response::pong(),
        }
    }

    /// Verify the caller's executable and return its digest, or the error
    /// response that refuses service.
    fn verify_caller(&self, creds: &PeerCredentials) -> Result<String, Response> {
        if !creds.has_pid() {
            return Err(Response::error(
                ErrorCode::CredentialError,
                "peer credentials carry no pid - unauthorized",
            ));
        }

        match identity::client_binary_info(creds.pid) {
            Ok((_path, digest)) => Ok(digest),
            Err(e) => Err(Response::error(
                ErrorCode::ExecutableError,
                format!("failed to verify client binary: {e}"),
            )),
        }
    }

    fn handle_store(
        &self,
        name: String,
        mut secret: Vec<u8>,
        ttl_seconds: i64,
        absolute_expiration_seconds: i64,
        client_nonce: String,
        creds: &PeerCredentials,
    ) -> Response {
        debug!(name = %name, "Store request");

        if name.is_empty() {
            return Response::error(ErrorCode::InvalidRequest, "secret name must not be empty");
        }
        if ttl_seconds < 0 || absolute_expiration_seconds < 0 {
            return Response::error(
                ErrorCode::InvalidRequest,
                "expiration values must not be negative",
            );
        }

        let digest = match self.verify_caller(creds) {
            Ok(digest) => digest,
            Err(response) => return response,
        };

        if secret.len() as u64 > self.config.max_secret_size {
            return Response::error(
                ErrorCode::SizeExceeded,
                format!(
                    "secret size ({} bytes) exceeds maximum allowed size ({} bytes)",
                    secret.len(),
                    self.config.max_secret_size
                ),
            );
        }

        // Overwrites never count against the limit.
        {
            let metadata = self.metadata.read().expect("metadata lock poisoned");
            if !metadata.contains_key(&name) && metadata.len() >= self.config.max_secrets {
                return Response::error(
                    ErrorCode::LimitExceeded,
                    format!(
                        "maximum number of secrets ({}) reached",
                        self.config.max_secrets
                    ),
                );
            }
        }

        let salt = match crypto::random_salt() {
            Ok(salt) => salt,
            Err(e) => {
                return Response::error(ErrorCode::CryptoError, format!("generating salt: {e}"))
            }
        };

        let key = DerivedKey::derive(
            &digest,
            &client_nonce,
            Some(&self.session_id),
            &name,
            &salt,
        );
        let encrypted = match key.encrypt(&secret) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                return Response::error(ErrorCode::CryptoError, format!("encrypting secret: {e}"))
            }
        };
        drop(key);
        secret.zeroize();

        // Payload first, metadata second: a failure in between leaves the
        // payload unreachable, never the metadata dangling.
        let payload = Payload {
            encrypted_data: encrypted,
            salt: salt.to_vec(),
            client_digest: digest,
        };
        if let Err(e) = self.storage.store(&name, payload) {
            return Response::error(
                ErrorCode::StorageError,
                format!("storing secret in backend: {e}"),
            );
        }

        let now = Instant::now();
        let inactivity_ttl = if ttl_seconds > 0 {
            Duration::from_secs(ttl_seconds as u64)
        } else {
            self.config.default_ttl()
        };
        let absolute_deadline = if absolute_expiration_seconds > 0 {
            match now.checked_add(Duration::from_secs(absolute_expiration_seconds as u64)) {
                Some(deadline) => Some(deadline),
                None => {
                    return Response::error(
                        ErrorCode::InvalidRequest,
                        "absolute expiration too far in the future",
                    )
                }
            }
        } else {
            None
        };

        let mut metadata = self.metadata.write().expect("metadata lock poisoned");
        metadata.insert(
            name.clone(),
            Metadata {
                inactivity_ttl,
                absolute_deadline,
                last_accessed: now,
            },
        );
        drop(metadata);

        debug!(
            name = %name,
            ttl_secs = inactivity_ttl.as_secs(),
            has_deadline = absolute_deadline.is_some(),
            "Stored secret"
        );
        Response::stored()
    }

    fn handle_get(&self, name: String, client_nonce: String, creds: &PeerCredentials) -> Response {
        debug!(name = %name, "Get request");

        let digest = match self.verify_caller(creds) {
            Ok(digest) => digest,
            Err(response) => return response,
        };

        {
            let mut metadata = self.metadata.write().expect("metadata lock poisoned");
            let Some(entry) = metadata.get_mut(&name) else {
                return Response::error(ErrorCode::NotFound, "secret not found");
            };

            let now = Instant::now();
            if now.duration_since(entry.last_accessed) > entry.inactivity_ttl {
                metadata.remove(&name);
                self.evict_payload(&name);
                return Response::error(
                    ErrorCode::ExpiredInactivity,
                    "secret has expired due to inactivity",
                );
            }
            if entry.absolute_deadline.is_some_and(|deadline| now > deadline) {
                metadata.remove(&name);
                self.evict_payload(&name);
                return Response::error(
                    ErrorCode::ExpiredAbsolute,
                    "secret has expired (absolute deadline reached)",
                );
            }

            entry.last_accessed = now;
        }

        let payload = match self.storage.get(&name) {
            Ok(payload) => payload,
            Err(StorageError::NotFound) => {
                return Response::error(ErrorCode::NotFound, "secret not found")
            }
            Err(e) => {
                return Response::error(
                    ErrorCode::StorageError,
                    format!("reading secret from backend: {e}"),
                )
            }
        };

        if payload.client_digest != digest {
            warn!(name = %name, "Client binary digest mismatch");
            return Response::error(
                ErrorCode::Unauthorized,
                "client binary digest mismatch - unauthorized",
            );
        }

        // Re-derive with the salt stored alongside the ciphertext. A wrong
        // client nonce yields a different key and fails the tag check.
        let key = DerivedKey::derive(
            &digest,
            &client_nonce,
            Some(&self.session_id),
            &name,
            &payload.salt,
        );
        let mut plaintext = match key.decrypt(&payload.encrypted_data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                return Response::error(ErrorCode::CryptoError, format!("decrypting secret: {e}"))
            }
        };

        debug!(name = %name, "Retrieved secret");
        Response::secret(std::mem::take(&mut *plaintext))
    }

    /// Remove a payload whose metadata entry was just evicted. Backend
    /// errors are logged and dropped; the caller already reports expiry.
    fn evict_payload(&self, name: &str) {
        if let Err(e) = self.storage.delete(name) {
            debug!(name = %name, error = %e, "Backend delete failed during eviction");
        }
    }

    /// Number of live metadata entries.
    pub fn secret_count(&self) -> usize {
        self.metadata.read().expect("metadata lock poisoned").len()
    }

    /// Socket path this daemon serves on.
    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path_or_default()
    }
}

/// Zero any plaintext a response carries before the response is dropped.
fn zeroize_response(response: &mut Response) {
    if let Response::Secret { secret } = response {
        secret.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn own_creds() -> PeerCredentials {
        PeerCredentials {
            pid: std::process::id() as i32,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    fn no_pid_creds() -> PeerCredentials {
        PeerCredentials {
            pid: 0,
            uid: 1000,
            gid: 1000,
        }
    }

    fn test_daemon(config: Config) -> Arc<Daemon> {
        Arc::new(Daemon::new(config, Arc::new(MemoryStorage::new())).unwrap())
    }

    fn store_request(name: &str, secret: &[u8], ttl: i64, abs: i64) -> Request {
        Request::Store {
            name: name.to_string(),
            secret: secret.to_vec(),
            ttl_seconds: ttl,
            absolute_expiration_seconds: abs,
            client_nonce: "n1".to_string(),
        }
    }

    fn get_request(name: &str) -> Request {
        Request::Get {
            name: name.to_string(),
            client_nonce: "n1".to_string(),
        }
    }

    fn assert_error(response: Response, code: ErrorCode) {
        match response {
            Response::Error { code: got, .. } => assert_eq!(got, code),
            other => panic!("expected {code} error, got {other:?}"),
        }
    }

    /// Pull a metadata entry's timestamps into the past.
    fn age_entry(daemon: &Daemon, name: &str, by: Duration) {
        let mut metadata = daemon.metadata.write().unwrap();
        let entry = metadata.get_mut(name).expect("entry exists");
        entry.last_accessed = Instant::now() - by;
        if let Some(deadline) = entry.absolute_deadline {
            entry.absolute_deadline = deadline.checked_sub(by);
        }
    }

    #[tokio::test]
    async fn new_daemon_begins_in_starting_state() {
        let daemon = test_daemon(Config::default());
        assert_eq!(daemon.state(), DaemonState::Starting);
    }

    #[tokio::test]
    async fn inactivity_timeout_shuts_the_daemon_down() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("idle.sock").display().to_string(),
            inactivity_timeout: 1,
            ..Config::default()
        };
        let daemon = test_daemon(config);
        let socket_path = daemon.socket_path();

        let runner = Arc::clone(&daemon);
        let server = tokio::spawn(async move { runner.run().await });

        // No RPC ever arrives; the daemon must take itself down.
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("daemon shut down on inactivity")
            .unwrap()
            .unwrap();

        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn ping_answers_alive() {
        let daemon = test_daemon(Config::default());
        let response = daemon.handle_request(Request::Ping, &own_creds());
        assert!(matches!(response, Response::Pong { alive: true }));
    }

    #[tokio::test]
    async fn store_then_get_roundtrip() {
        let daemon = test_daemon(Config::default());

        let response = daemon.handle_request(store_request("k1", b"hello", 300, 0), &own_creds());
        assert!(matches!(response, Response::Stored));

        match daemon.handle_request(get_request("k1"), &own_creds()) {
            Response::Secret { secret } => assert_eq!(secret, b"hello"),
            other => panic!("expected secret, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_unknown_name_is_not_found() {
        let daemon = test_daemon(Config::default());
        let response = daemon.handle_request(get_request("missing"), &own_creds());
        assert_error(response, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn store_empty_name_is_rejected() {
        let daemon = test_daemon(Config::default());
        let response = daemon.handle_request(store_request("", b"v", 0, 0), &own_creds());
        assert_error(response, ErrorCode::InvalidRequest);
        assert_eq!(daemon.secret_count(), 0);
    }

    #[tokio::test]
    async fn store_negative_ttl_is_rejected() {
        let daemon = test_daemon(Config::default());
        let response = daemon.handle_request(store_request("k", b"v", -1, 0), &own_creds());
        assert_error(response, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn requests_without_pid_fail_closed() {
        let daemon = test_daemon(Config::default());

        let response = daemon.handle_request(store_request("k", b"v", 0, 0), &no_pid_creds());
        assert_error(response, ErrorCode::CredentialError);

        let response = daemon.handle_request(get_request("k"), &no_pid_creds());
        assert_error(response, ErrorCode::CredentialError);
    }

    #[tokio::test]
    async fn unresolvable_pid_is_executable_error() {
        let daemon = test_daemon(Config::default());
        // PID i32::MAX is above any real pid_max.
        let creds = PeerCredentials {
            pid: i32::MAX,
            uid: 1000,
            gid: 1000,
        };
        let response = daemon.handle_request(get_request("k"), &creds);
        assert_error(response, ErrorCode::ExecutableError);
    }

    #[tokio::test]
    async fn oversized_secret_is_rejected() {
        let config = Config {
            max_secret_size: 16,
            ..Config::default()
        };
        let daemon = test_daemon(config);

        let response =
            daemon.handle_request(store_request("k", &[0u8; 17], 0, 0), &own_creds());
        assert_error(response, ErrorCode::SizeExceeded);
        assert_eq!(daemon.secret_count(), 0);
    }

    #[tokio::test]
    async fn secret_limit_is_enforced_but_overwrites_pass() {
        let config = Config {
            max_secrets: 2,
            ..Config::default()
        };
        let daemon = test_daemon(config);

        for name in ["k1", "k2"] {
            let response = daemon.handle_request(store_request(name, b"v", 300, 0), &own_creds());
            assert!(matches!(response, Response::Stored));
        }

        let response = daemon.handle_request(store_request("k3", b"v", 300, 0), &own_creds());
        assert_error(response, ErrorCode::LimitExceeded);

        // Overwriting an existing name never counts against the limit.
        let response = daemon.handle_request(store_request("k1", b"v2", 300, 0), &own_creds());
        assert!(matches!(response, Response::Stored));
        assert_eq!(daemon.secret_count(), 2);
    }

    #[tokio::test]
    async fn overwrite_keeps_cardinality_and_replaces_value() {
        let daemon = test_daemon(Config::default());

        daemon.handle_request(store_request("k", b"first", 300, 0), &own_creds());
        daemon.handle_request(store_request("k", b"second", 300, 0), &own_creds());
        assert_eq!(daemon.secret_count(), 1);

        match daemon.handle_request(get_request("k"), &own_creds()) {
            Response::Secret { secret } => assert_eq!(secret, b"second"),
            other => panic!("expected secret, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_nonce_fails_decryption() {
        let daemon = test_daemon(Config::default());
        daemon.handle_request(store_request("k", b"v", 300, 0), &own_creds());

        let response = daemon.handle_request(
            Request::Get {
                name: "k".to_string(),
                client_nonce: "different".to_string(),
            },
            &own_creds(),
        );
        assert_error(response, ErrorCode::CryptoError);
    }

    #[tokio::test]
    async fn digest_mismatch_is_unauthorized() {
        let daemon = test_daemon(Config::default());
        daemon.handle_request(store_request("k", b"v", 300, 0), &own_creds());

        // Forge a stored payload from a different binary.
        {
            let mut payload = daemon.storage.get("k").unwrap();
            payload.client_digest = "00".repeat(32);
            daemon.storage.store("k", payload).unwrap();
        }

        let response = daemon.handle_request(get_request("k"), &own_creds());
        assert_error(response, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn inactivity_expiry_evicts_on_get() {
        let daemon = test_daemon(Config::default());
        daemon.handle_request(store_request("k", b"v", 2, 0), &own_creds());

        age_entry(&daemon, "k", Duration::from_secs(3));

        let response = daemon.handle_request(get_request("k"), &own_creds());
        assert_error(response, ErrorCode::ExpiredInactivity);

        // Both metadata and payload are gone.
        assert_eq!(daemon.secret_count(), 0);
        assert!(matches!(
            daemon.storage.get("k"),
            Err(StorageError::NotFound)
        ));

        // A second Get reports not-found, not expiry.
        let response = daemon.handle_request(get_request("k"), &own_creds());
        assert_error(response, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn absolute_deadline_expires_despite_access() {
        let daemon = test_daemon(Config::default());
        daemon.handle_request(store_request("k", b"v", 3600, 2), &own_creds());

        // Intervening Get refreshes last_accessed.
        assert!(matches!(
            daemon.handle_request(get_request("k"), &own_creds()),
            Response::Secret { .. }
        ));

        age_entry(&daemon, "k", Duration::from_secs(3));

        let response = daemon.handle_request(get_request("k"), &own_creds());
        assert_error(response, ErrorCode::ExpiredAbsolute);
        assert_eq!(daemon.secret_count(), 0);
    }

    #[tokio::test]
    async fn get_refreshes_inactivity_window() {
        let daemon = test_daemon(Config::default());
        daemon.handle_request(store_request("k", b"v", 10, 0), &own_creds());

        // Age it close to the TTL, access it, age it again: still alive.
        age_entry(&daemon, "k", Duration::from_secs(8));
        assert!(matches!(
            daemon.handle_request(get_request("k"), &own_creds()),
            Response::Secret { .. }
        ));

        age_entry(&daemon, "k", Duration::from_secs(8));
        assert!(matches!(
            daemon.handle_request(get_request("k"), &own_creds()),
            Response::Secret { .. }
        ));
    }

    #[tokio::test]
    async fn sweep_removes_expired_and_reports_remaining() {
        let daemon = test_daemon(Config::default());
        daemon.handle_request(store_request("dead", b"v", 1, 0), &own_creds());
        daemon.handle_request(store_request("alive", b"v", 3600, 0), &own_creds());

        age_entry(&daemon, "dead", Duration::from_secs(2));

        let (removed, remaining) = daemon.sweep_expired();
        assert_eq!(removed, 1);
        assert_eq!(remaining, 1);
        assert!(matches!(
            daemon.storage.get("dead"),
            Err(StorageError::NotFound)
        ));
        assert!(daemon.storage.get("alive").is_ok());
    }

    #[tokio::test]
    async fn sweep_with_everything_expired_empties_table_and_backend() {
        let daemon = test_daemon(Config::default());
        daemon.handle_request(store_request("a", b"v", 1, 0), &own_creds());
        daemon.handle_request(store_request("b", b"v", 1, 0), &own_creds());

        age_entry(&daemon, "a", Duration::from_secs(2));
        age_entry(&daemon, "b", Duration::from_secs(2));

        let (removed, remaining) = daemon.sweep_expired();
        assert_eq!(removed, 2);
        assert_eq!(remaining, 0);
        assert!(matches!(daemon.storage.get("a"), Err(StorageError::NotFound)));
        assert!(matches!(daemon.storage.get("b"), Err(StorageError::NotFound)));
    }

    #[tokio::test]
    async fn roundtrip_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("test.sock").display().to_string(),
            ..Config::default()
        };
        let daemon = test_daemon(config);
        let socket_path = daemon.socket_path();

        let runner = Arc::clone(&daemon);
        let server = tokio::spawn(async move { runner.run().await });

        // Wait for the listener to come up.
        let mut stream = loop {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        let mut request = store_request("k1", b"hello", 300, 0).to_json_line().unwrap();
        request.push_str(&get_request("k1").to_json_line().unwrap());
        request.push_str(&Request::Ping.to_json_line().unwrap());
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut line = String::new();

        reader.read_line(&mut line).await.unwrap();
        assert!(matches!(
            Response::parse(line.trim()).unwrap(),
            Response::Stored
        ));

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        match Response::parse(line.trim()).unwrap() {
            Response::Secret { secret } => assert_eq!(secret, b"hello"),
            other => panic!("expected secret, got {other:?}"),
        }

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(matches!(
            Response::parse(line.trim()).unwrap(),
            Response::Pong { alive: true }
        ));

        daemon.initiate_shutdown();
        drop(reader);
        server.await.unwrap().unwrap();

        assert_eq!(daemon.state(), DaemonState::Stopped);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn malformed_request_gets_invalid_request_response() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("test.sock").display().to_string(),
            ..Config::default()
        };
        let daemon = test_daemon(config);
        let socket_path = daemon.socket_path();

        let runner = Arc::clone(&daemon);
        let server = tokio::spawn(async move { runner.run().await });

        let mut stream = loop {
            match UnixStream::connect(&socket_path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        stream.write_all(b"this is not json\n").await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_error(Response::parse(line.trim()).unwrap(), ErrorCode::InvalidRequest);

        daemon.initiate_shutdown();
        drop(reader);
        server.await.unwrap().unwrap();
    }
}
