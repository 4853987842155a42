//! Executable identity: resolving and hashing the binary behind a PID.
//!
//! The daemon authenticates callers by the SHA-256 of the executable they
//! are running, resolved from the PID reported by the socket peer
//! credentials. The client uses the same digest of its own executable to
//! derive socket and fallback-file paths, so distinct binaries never share
//! a daemon or a secret file.

use std::path::PathBuf;

use thiserror::Error;

use crate::crypto;

/// Errors resolving or hashing a process executable.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The executable path for the PID could not be determined.
    #[error("resolving executable for pid {pid}: {source}")]
    ResolveFailed {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    /// The executable file could not be opened or read for hashing.
    #[error("hashing executable {path}: {source}")]
    DigestFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The current process's own executable path is unavailable.
    #[error("locating current executable: {0}")]
    CurrentExe(#[source] std::io::Error),
}

/// Resolve the filesystem path of the executable a process is running.
#[cfg(target_os = "linux")]
pub fn resolve_executable(pid: i32) -> Result<PathBuf, IdentityError> {
    std::fs::read_link(format!("/proc/{pid}/exe"))
        .map_err(|source| IdentityError::ResolveFailed { pid, source })
}

/// Resolve the filesystem path of the executable a process is running.
#[cfg(target_os = "macos")]
pub fn resolve_executable(pid: i32) -> Result<PathBuf, IdentityError> {
    use std::os::unix::ffi::OsStrExt;

    let mut buf = [0u8; libc::PROC_PIDPATHINFO_MAXSIZE as usize];
    // Safety: buf is valid for the length we pass.
    let len = unsafe {
        libc::proc_pidpath(pid, buf.as_mut_ptr() as *mut libc::c_void, buf.len() as u32)
    };
    if len <= 0 {
        return Err(IdentityError::ResolveFailed {
            pid,
            source: std::io::Error::last_os_error(),
        });
    }

    let path = std::ffi::OsStr::from_bytes(&buf[..len as usize]);
    Ok(PathBuf::from(path))
}

/// Resolve a PID's executable and compute its content digest.
///
/// Fails if the path cannot be resolved or the file cannot be read; the
/// daemon treats either as an unauthorized caller.
pub fn client_binary_info(pid: i32) -> Result<(PathBuf, String), IdentityError> {
    let path = resolve_executable(pid)?;
    let digest = crypto::digest_file(&path).map_err(|source| IdentityError::DigestFailed {
        path: path.clone(),
        source,
    })?;
    Ok((path, digest))
}

/// Digest of the executable the current process is running.
pub fn current_executable_digest() -> Result<String, IdentityError> {
    let exe = std::env::current_exe().map_err(IdentityError::CurrentExe)?;
    crypto::digest_file(&exe).map_err(|source| IdentityError::DigestFailed {
        path: exe.clone(),
        source,
    })
}

/// Default socket path for the current executable.
///
/// `<temp dir>/burnafter-<digest16>.sock`, where `digest16` is the first
/// sixteen hex characters of the current executable's digest. Distinct
/// executables therefore never share a daemon. Falls back to a fixed name
/// if the digest cannot be computed.
pub fn default_socket_path() -> PathBuf {
    match current_executable_digest() {
        Ok(digest) => std::env::temp_dir().join(format!("burnafter-{}.sock", &digest[..16])),
        Err(_) => std::env::temp_dir().join("burnafter.sock"),
    }
}

/// Deterministic fallback-file path for a secret of the current executable.
///
/// `<temp dir>/burnafter-<digest16>-<SHA256(name)16>`, both components being
/// the first sixteen hex characters of the respective digest.
pub fn fallback_file_path(name: &str) -> Result<PathBuf, IdentityError> {
    let digest = current_executable_digest()?;
    let name_hash = crypto::sha256_hex(name.as_bytes());
    Ok(std::env::temp_dir().join(format!("burnafter-{}-{}", &digest[..16], &name_hash[..16])))
}

/// Prefix shared by all fallback files of the current executable, used when
/// sweeping the temp directory for expired files.
pub fn fallback_file_prefix() -> Result<String, IdentityError> {
    let digest = current_executable_digest()?;
    Ok(format!("burnafter-{}-", &digest[..16]))
}

/// Directory holding sockets and fallback files.
pub fn runtime_dir() -> PathBuf {
    std::env::temp_dir()
}
