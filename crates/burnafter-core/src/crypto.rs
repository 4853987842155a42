//! Key derivation and authenticated encryption for stored secrets.
//!
//! Every secret is encrypted with AES-256-GCM under a key derived with
//! PBKDF2-HMAC-SHA256 from the identity of the client executable. The key
//! derivation input is the byte concatenation of the client nonce, the
//! hex-encoded executable digest, the daemon session ID (daemon mode only)
//! and the secret name; the salt is either a fresh random value (daemon
//! mode) or the SHA-256 of the secret name (fallback files, which must be
//! recoverable across processes).
//!
//! # Security Properties
//!
//! - **Confidentiality + integrity**: AES-256-GCM authenticated encryption;
//!   tampering is detected at the tag check.
//! - **Unique nonces**: every encryption draws a fresh 96-bit nonce from the
//!   OS random source.
//! - **Key hygiene**: derived keys live in `mlock`ed memory where the OS
//!   allows it and are zeroed on drop. They are never serialized or stored.

use std::fmt;
use std::io::Read;
use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::TryRngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the per-secret random salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Size of the GCM nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count. Changing this invalidates every stored secret.
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Number of random bytes behind a session ID (hex-encoded to 32 chars).
const SESSION_ID_BYTES: usize = 16;

/// Errors from cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The ciphertext failed tag verification (wrong key, corrupted or
    /// tampered data).
    #[error("decryption failed: authentication tag mismatch")]
    AuthenticationFailed,

    /// The ciphertext blob is too short to contain a nonce and tag.
    #[error("ciphertext too short: {0} bytes")]
    TruncatedCiphertext(usize),

    /// The OS cryptographic random source is unavailable.
    #[error("OS random source unavailable: {0}")]
    RandomSource(String),
}

/// A derived AES-256 encryption key with secure memory handling.
///
/// The key material is heap-allocated, locked with `mlock` on a best-effort
/// basis, and zeroed before the memory is released. Keys are only ever
/// derived, used, and dropped inside a single request; nothing persists them.
pub struct DerivedKey {
    key: Box<[u8; KEY_SIZE]>,
    memory_locked: bool,
}

impl DerivedKey {
    /// Derive a key from the identity of a client executable.
    ///
    /// The password input is `client_nonce || binary_digest || session_id ||
    /// name` (session ID only in daemon mode); `salt` is the per-secret salt.
    /// The same inputs always produce the same key.
    ///
    /// `binary_digest` is the lowercase hex SHA-256 of the client executable
    /// as produced by [`crate::identity::digest_file`].
    pub fn derive(
        binary_digest: &str,
        client_nonce: &str,
        session_id: Option<&str>,
        name: &str,
        salt: &[u8],
    ) -> Self {
        let mut password = Zeroizing::new(Vec::with_capacity(
            client_nonce.len() + binary_digest.len() + name.len() + 32,
        ));
        password.extend_from_slice(client_nonce.as_bytes());
        password.extend_from_slice(binary_digest.as_bytes());
        if let Some(sid) = session_id {
            password.extend_from_slice(sid.as_bytes());
        }
        password.extend_from_slice(name.as_bytes());

        let mut key = Box::new([0u8; KEY_SIZE]);
        pbkdf2_hmac::<Sha256>(&password, salt, PBKDF2_ITERATIONS, key.as_mut());

        let mut derived = Self {
            key,
            memory_locked: false,
        };
        derived.try_lock_memory();
        derived
    }

    /// Attempt to lock the key memory to keep it out of swap.
    fn try_lock_memory(&mut self) {
        let ptr = self.key.as_ptr() as *mut u8;

        // Safety: locking memory we own; unlocked on drop.
        if unsafe { memsec::mlock(ptr, KEY_SIZE) } {
            self.memory_locked = true;
        }
        // Failure is common for unprivileged processes (RLIMIT_MEMLOCK); the
        // key still works, it may just be swapped.
    }

    /// Encrypt plaintext with AES-256-GCM under this key.
    ///
    /// Returns `nonce(12) || ciphertext || tag(16)` with a fresh random
    /// nonce, so encrypting the same plaintext twice yields different bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref()).expect("key size is correct");

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| CryptoError::RandomSource(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext_with_tag = cipher
            .encrypt(nonce, plaintext)
            .expect("encryption cannot fail with valid inputs");

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext_with_tag.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend(ciphertext_with_tag);
        Ok(blob)
    }

    /// Decrypt a `nonce || ciphertext || tag` blob produced by [`encrypt`].
    ///
    /// Fails with [`CryptoError::AuthenticationFailed`] if the tag does not
    /// verify. The plaintext is returned in a buffer that zeroes itself on
    /// drop.
    ///
    /// [`encrypt`]: DerivedKey::encrypt
    pub fn decrypt(&self, blob: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::TruncatedCiphertext(blob.len()));
        }

        let cipher = Aes256Gcm::new_from_slice(self.key.as_ref()).expect("key size is correct");
        let nonce = Nonce::from_slice(&blob[..NONCE_SIZE]);

        cipher
            .decrypt(nonce, &blob[NONCE_SIZE..])
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.key.zeroize();

        if self.memory_locked {
            let ptr = self.key.as_ptr() as *mut u8;
            // Safety: unlocking memory we previously locked.
            unsafe {
                memsec::munlock(ptr, KEY_SIZE);
            }
        }
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .field("memory_locked", &self.memory_locked)
            .finish()
    }
}

/// Generate a fresh 16-byte salt from the OS random source.
pub fn random_salt() -> Result<[u8; SALT_SIZE], CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| CryptoError::RandomSource(e.to_string()))?;
    Ok(salt)
}

/// Generate a fresh session ID: 16 random bytes, hex-encoded to 32 chars.
///
/// Generated once per daemon process and never persisted.
pub fn random_session_id() -> Result<String, CryptoError> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::RandomSource(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// Compute the lowercase hex SHA-256 of a file, streaming.
///
/// Symbolic links are resolved before the file is opened.
pub fn digest_file(path: &Path) -> std::io::Result<String> {
    let resolved = std::fs::canonicalize(path)?;
    let mut file = std::fs::File::open(resolved)?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Lowercase hex SHA-256 of a byte string.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of a byte string as raw digest bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Unconditionally overwrite a byte buffer with zeros.
///
/// Uses `zeroize`, which guarantees the writes survive optimization.
pub fn zero(buf: &mut [u8]) {
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "a665a45920422f9d417e4867efdc4fb8a04a1f3fff1fa07e998e86f7f7a27ae3";

    #[test]
    fn derive_is_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let key1 = DerivedKey::derive(DIGEST, "nonce", Some("sid"), "secret-a", &salt);
        let key2 = DerivedKey::derive(DIGEST, "nonce", Some("sid"), "secret-a", &salt);

        let blob = key1.encrypt(b"payload").unwrap();
        let plain = key2.decrypt(&blob).expect("same inputs derive same key");
        assert_eq!(plain.as_slice(), b"payload");
    }

    #[test]
    fn derive_differs_per_name() {
        let salt = [7u8; SALT_SIZE];
        let key1 = DerivedKey::derive(DIGEST, "nonce", Some("sid"), "secret-a", &salt);
        let key2 = DerivedKey::derive(DIGEST, "nonce", Some("sid"), "secret-b", &salt);

        let blob = key1.encrypt(b"payload").unwrap();
        assert!(matches!(
            key2.decrypt(&blob),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn derive_differs_per_nonce() {
        let salt = [7u8; SALT_SIZE];
        let key1 = DerivedKey::derive(DIGEST, "nonce-1", None, "secret", &salt);
        let key2 = DerivedKey::derive(DIGEST, "nonce-2", None, "secret", &salt);

        let blob = key1.encrypt(b"payload").unwrap();
        assert!(key2.decrypt(&blob).is_err());
    }

    #[test]
    fn derive_differs_with_session_id() {
        let salt = [7u8; SALT_SIZE];
        let with = DerivedKey::derive(DIGEST, "nonce", Some("sid"), "secret", &salt);
        let without = DerivedKey::derive(DIGEST, "nonce", None, "secret", &salt);

        let blob = with.encrypt(b"payload").unwrap();
        assert!(without.decrypt(&blob).is_err());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let salt = random_salt().unwrap();
        let key = DerivedKey::derive(DIGEST, "nonce", Some("sid"), "name", &salt);

        let blob = key.encrypt(b"my-secret-value").unwrap();
        assert_eq!(blob.len(), NONCE_SIZE + b"my-secret-value".len() + TAG_SIZE);

        let plain = key.decrypt(&blob).unwrap();
        assert_eq!(plain.as_slice(), b"my-secret-value");
    }

    #[test]
    fn encrypt_uses_fresh_nonces() {
        let salt = [1u8; SALT_SIZE];
        let key = DerivedKey::derive(DIGEST, "n", None, "name", &salt);

        let blob1 = key.encrypt(b"same-plaintext").unwrap();
        let blob2 = key.encrypt(b"same-plaintext").unwrap();
        assert_ne!(blob1[..NONCE_SIZE], blob2[..NONCE_SIZE]);
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn empty_plaintext_works() {
        let salt = [1u8; SALT_SIZE];
        let key = DerivedKey::derive(DIGEST, "n", None, "name", &salt);

        let blob = key.encrypt(b"").unwrap();
        assert_eq!(blob.len(), NONCE_SIZE + TAG_SIZE);
        assert!(key.decrypt(&blob).unwrap().is_empty());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let salt = [1u8; SALT_SIZE];
        let key = DerivedKey::derive(DIGEST, "n", None, "name", &salt);

        let mut blob = key.encrypt(b"secret-data").unwrap();
        blob[NONCE_SIZE] ^= 0xff;
        assert!(matches!(
            key.decrypt(&blob),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let salt = [1u8; SALT_SIZE];
        let key = DerivedKey::derive(DIGEST, "n", None, "name", &salt);

        assert!(matches!(
            key.decrypt(&[0u8; 10]),
            Err(CryptoError::TruncatedCiphertext(10))
        ));
    }

    #[test]
    fn key_debug_is_redacted() {
        let key = DerivedKey::derive(DIGEST, "n", None, "name", &[1u8; SALT_SIZE]);
        let output = format!("{:?}", key);
        assert!(output.contains("[REDACTED]"));
    }

    #[test]
    fn random_salt_size_and_variation() {
        let a = random_salt().unwrap();
        let b = random_salt().unwrap();
        assert_eq!(a.len(), SALT_SIZE);
        assert_ne!(a, b);
    }

    #[test]
    fn session_id_is_32_hex_chars() {
        let sid = random_session_id().unwrap();
        assert_eq!(sid.len(), 32);
        assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(sid, random_session_id().unwrap());
    }

    #[test]
    fn digest_file_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input");
        std::fs::write(&path, b"hello").unwrap();

        assert_eq!(
            digest_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn digest_file_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        std::fs::write(&target, b"hello").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert_eq!(digest_file(&link).unwrap(), digest_file(&target).unwrap());
    }

    #[test]
    fn digest_file_missing_is_an_error() {
        assert!(digest_file(Path::new("/nonexistent/burnafter-test")).is_err());
    }

    #[test]
    fn zero_overwrites_buffer() {
        let mut buf = vec![0xaa; 64];
        zero(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
