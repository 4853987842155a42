//! Encrypted-file fallback store.
//!
//! When no daemon can be started (or the client is configured never to
//! start one), secrets degrade to one encrypted file each under the system
//! temp directory. Paths and keys depend only on the executable digest, the
//! client nonce, and the secret name, never on a runtime session value, so
//! two invocations of the same executable share the same files. That is the
//! deliberate difference from daemon mode, which loses everything on
//! restart.
//!
//! # File format
//!
//! Big-endian, fixed offsets:
//!
//! | Offset | Length | Field |
//! |--------|--------|-------------------------------------|
//! | 0      | 1      | Version = 1                         |
//! | 1      | 12     | AES-GCM nonce                       |
//! | 13     | 8      | Expiry (seconds since Unix epoch)   |
//! | 21     | rest   | ciphertext + 16-byte tag            |
//!
//! Files are written 0600 into a same-directory temp file and renamed into
//! place atomically.

use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use burnafter_core::crypto::{self, CryptoError, DerivedKey, NONCE_SIZE, TAG_SIZE};
use burnafter_core::identity::{self, IdentityError};

/// Current fallback file format version.
const FILE_VERSION: u8 = 1;

/// Length of the fixed header: version + nonce + expiry.
const HEADER_LEN: usize = 1 + NONCE_SIZE + 8;

/// Errors from the fallback store.
#[derive(Debug, Error)]
pub enum FallbackError {
    /// No file exists for that secret name.
    #[error("secret not found")]
    NotFound,

    /// The secret existed but its expiry has passed; the file was deleted.
    #[error("secret expired")]
    Expired,

    /// The file carries a format version this build cannot read.
    #[error("unsupported file version: {0}")]
    UnsupportedVersion(u8),

    /// The file does not parse as a fallback secret file.
    #[error("invalid file format: {0}")]
    InvalidFormat(&'static str),

    /// Key derivation or decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The current executable's identity could not be established.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Filesystem failure reading or writing the secret file.
    #[error("fallback file I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Client-side encrypted-file store.
pub struct FallbackStore {
    nonce: String,
}

impl FallbackStore {
    /// Create a store deriving keys with the given client nonce.
    pub fn new(nonce: impl Into<String>) -> Self {
        Self {
            nonce: nonce.into(),
        }
    }

    /// Derive the key for a secret name.
    ///
    /// No session ID exists here; the salt is the SHA-256 of the name so
    /// the same executable re-derives the same key in a later process.
    fn derive_key(&self, name: &str) -> Result<DerivedKey, FallbackError> {
        let digest = identity::current_executable_digest()?;
        let salt = crypto::sha256(name.as_bytes());
        Ok(DerivedKey::derive(&digest, &self.nonce, None, name, &salt))
    }

    /// Encrypt `secret` into its file, expiring at `expires_at` (Unix
    /// seconds). Overwrites any previous value atomically.
    pub fn store(&self, name: &str, secret: &[u8], expires_at: u64) -> Result<(), FallbackError> {
        if expires_at > i64::MAX as u64 {
            return Err(FallbackError::InvalidFormat("expiry out of range"));
        }

        // Sweep before writing so the sweep can never eat the new file.
        self.cleanup_expired();

        let key = self.derive_key(name)?;
        let blob = key.encrypt(secret)?;
        drop(key);

        let mut contents = Vec::with_capacity(HEADER_LEN + blob.len() - NONCE_SIZE);
        contents.push(FILE_VERSION);
        contents.extend_from_slice(&blob[..NONCE_SIZE]);
        contents.extend_from_slice(&expires_at.to_be_bytes());
        contents.extend_from_slice(&blob[NONCE_SIZE..]);

        let path = identity::fallback_file_path(name)?;
        let dir = path.parent().expect("fallback path has a parent");

        // Same-directory temp file (created 0600) + rename = atomic
        // replace; readers see the old file or the new one, never a
        // partial write.
        let mut tmp = tempfile::Builder::new()
            .prefix(".burnafter-tmp-")
            .tempfile_in(dir)?;
        tmp.write_all(&contents)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| FallbackError::Io(e.error))?;

        debug!(name = %name, path = %path.display(), "Stored fallback secret");
        Ok(())
    }

    /// Read and decrypt a secret. Expired files are deleted on sight.
    pub fn get(&self, name: &str) -> Result<Zeroizing<Vec<u8>>, FallbackError> {
        let path = identity::fallback_file_path(name)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FallbackError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };

        let expiry = parse_expiry(&data)?;
        if unix_now() > expiry {
            let _ = std::fs::remove_file(&path);
            self.cleanup_expired();
            return Err(FallbackError::Expired);
        }

        // Reassemble the nonce-prefixed blob the crypto layer expects.
        let mut blob = Vec::with_capacity(data.len() - 9);
        blob.extend_from_slice(&data[1..1 + NONCE_SIZE]);
        blob.extend_from_slice(&data[HEADER_LEN..]);

        let key = self.derive_key(name)?;
        let plaintext = key.decrypt(&blob)?;

        self.cleanup_expired();
        Ok(plaintext)
    }

    /// Unlink a secret's file. Missing files are [`FallbackError::NotFound`].
    pub fn delete(&self, name: &str) -> Result<(), FallbackError> {
        let path = identity::fallback_file_path(name)?;
        let result = match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FallbackError::NotFound),
            Err(e) => Err(e.into()),
        };

        self.cleanup_expired();
        result
    }

    /// Remove every expired fallback file belonging to this executable.
    ///
    /// Best-effort: unreadable or malformed files are skipped, errors are
    /// swallowed. Runs after every store/get/delete.
    fn cleanup_expired(&self) {
        let Ok(prefix) = identity::fallback_file_prefix() else {
            return;
        };
        let dir = identity::runtime_dir();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };

        let now = unix_now();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.starts_with(&prefix) {
                continue;
            }

            let path = dir.join(file_name);
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            let Ok(expiry) = parse_expiry(&data) else {
                continue;
            };
            if now > expiry {
                debug!(path = %path.display(), "Removing expired fallback file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    /// Path of the file a secret name maps to.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, FallbackError> {
        Ok(identity::fallback_file_path(name)?)
    }
}

/// Validate the header and extract the expiry timestamp.
fn parse_expiry(data: &[u8]) -> Result<u64, FallbackError> {
    if data.len() < HEADER_LEN + TAG_SIZE {
        return Err(FallbackError::InvalidFormat("file too small"));
    }
    if data[0] != FILE_VERSION {
        return Err(FallbackError::UnsupportedVersion(data[0]));
    }

    let expiry = u64::from_be_bytes(
        data[1 + NONCE_SIZE..HEADER_LEN]
            .try_into()
            .expect("slice is 8 bytes"),
    );
    if expiry > i64::MAX as u64 {
        return Err(FallbackError::InvalidFormat("expiry out of range"));
    }
    Ok(expiry)
}

/// Current time as seconds since the Unix epoch.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_an_hour() -> u64 {
        unix_now() + 3600
    }

    /// Deletes the secret file when dropped, pass or fail.
    struct Cleanup<'a>(&'a FallbackStore, &'a str);

    impl Drop for Cleanup<'_> {
        fn drop(&mut self) {
            let _ = self.0.delete(self.1);
        }
    }

    #[test]
    fn store_get_roundtrip() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-rt");
        let _cleanup = Cleanup(&store, "fb-roundtrip");

        store.store("fb-roundtrip", b"my-secret-value", in_an_hour()).unwrap();
        let plain = store.get("fb-roundtrip").unwrap();
        assert_eq!(plain.as_slice(), b"my-secret-value");
    }

    #[test]
    fn empty_secret_roundtrip() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-empty");
        let _cleanup = Cleanup(&store, "fb-empty");

        store.store("fb-empty", b"", in_an_hour()).unwrap();
        assert!(store.get("fb-empty").unwrap().is_empty());
    }

    #[test]
    fn large_secret_roundtrip() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-large");
        let _cleanup = Cleanup(&store, "fb-large");

        let secret: Vec<u8> = (0..10 * 1024).map(|i| (i % 256) as u8).collect();
        store.store("fb-large", &secret, in_an_hour()).unwrap();
        assert_eq!(store.get("fb-large").unwrap().as_slice(), &secret[..]);
    }

    #[test]
    fn overwrite_returns_latest_value() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-overwrite");
        let _cleanup = Cleanup(&store, "fb-overwrite");

        store.store("fb-overwrite", b"first-value", in_an_hour()).unwrap();
        store.store("fb-overwrite", b"second-value", in_an_hour()).unwrap();
        assert_eq!(store.get("fb-overwrite").unwrap().as_slice(), b"second-value");
    }

    #[test]
    fn expired_secret_is_deleted_on_read() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-expired");

        store.store("fb-expired", b"will-expire", unix_now() - 10).unwrap();
        assert!(matches!(store.get("fb-expired"), Err(FallbackError::Expired)));

        // The read deleted the file; a second read is a plain not-found.
        assert!(matches!(store.get("fb-expired"), Err(FallbackError::NotFound)));
    }

    #[test]
    fn get_nonexistent_is_not_found() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-nonexistent");
        assert!(matches!(
            store.get("fb-does-not-exist"),
            Err(FallbackError::NotFound)
        ));
    }

    #[test]
    fn delete_nonexistent_is_not_found() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-delete");
        assert!(matches!(
            store.delete("fb-never-stored"),
            Err(FallbackError::NotFound)
        ));
    }

    #[test]
    fn file_layout_and_permissions() {
        let _dir = crate::testutil::fallback_dir_guard();
        use std::os::unix::fs::PermissionsExt;

        let store = FallbackStore::new("test-nonce-format");
        let _cleanup = Cleanup(&store, "fb-format");

        store.store("fb-format", b"test-value", in_an_hour()).unwrap();

        let path = store.file_path("fb-format").unwrap();
        let data = std::fs::read(&path).unwrap();

        // version(1) + nonce(12) + expiry(8) + tag(16) is the floor.
        assert!(data.len() >= 37);
        assert_eq!(data[0], 0x01);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn tampered_file_fails_decryption() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-tamper");
        let _cleanup = Cleanup(&store, "fb-tamper");

        store.store("fb-tamper", b"value", in_an_hour()).unwrap();

        let path = store.file_path("fb-tamper").unwrap();
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            store.get("fb-tamper"),
            Err(FallbackError::Crypto(CryptoError::AuthenticationFailed))
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-version");
        let _cleanup = Cleanup(&store, "fb-version");

        store.store("fb-version", b"value", in_an_hour()).unwrap();

        let path = store.file_path("fb-version").unwrap();
        let mut data = std::fs::read(&path).unwrap();
        data[0] = 9;
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            store.get("fb-version"),
            Err(FallbackError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn truncated_file_is_invalid() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-truncated");
        let _cleanup = Cleanup(&store, "fb-truncated");

        store.store("fb-truncated", b"value", in_an_hour()).unwrap();

        let path = store.file_path("fb-truncated").unwrap();
        std::fs::write(&path, [FILE_VERSION, 0, 0]).unwrap();

        assert!(matches!(
            store.get("fb-truncated"),
            Err(FallbackError::InvalidFormat(_))
        ));
    }

    #[test]
    fn wrong_nonce_cannot_decrypt() {
        let _dir = crate::testutil::fallback_dir_guard();
        let writer = FallbackStore::new("nonce-one");
        let reader = FallbackStore::new("nonce-two");
        let _cleanup = Cleanup(&writer, "fb-cross-nonce");

        writer.store("fb-cross-nonce", b"value", in_an_hour()).unwrap();
        assert!(matches!(
            reader.get("fb-cross-nonce"),
            Err(FallbackError::Crypto(CryptoError::AuthenticationFailed))
        ));
    }

    #[test]
    fn second_instance_with_same_nonce_reads_value() {
        let _dir = crate::testutil::fallback_dir_guard();
        let writer = FallbackStore::new("shared-nonce");
        let reader = FallbackStore::new("shared-nonce");
        let _cleanup = Cleanup(&writer, "fb-shared");

        writer.store("fb-shared", b"shared-value", in_an_hour()).unwrap();
        assert_eq!(reader.get("fb-shared").unwrap().as_slice(), b"shared-value");
    }

    #[test]
    fn cleanup_sweeps_expired_files_only() {
        let _dir = crate::testutil::fallback_dir_guard();
        let store = FallbackStore::new("test-nonce-cleanup");
        let _cleanup = Cleanup(&store, "fb-cleanup-alive");

        store.store("fb-cleanup-dead", b"value", unix_now() - 5).unwrap();
        let dead_path = store.file_path("fb-cleanup-dead").unwrap();
        assert!(dead_path.exists());

        // Any operation triggers the sweep.
        store.store("fb-cleanup-alive", b"value", in_an_hour()).unwrap();

        assert!(!dead_path.exists());
        assert!(store.file_path("fb-cleanup-alive").unwrap().exists());
    }
}
