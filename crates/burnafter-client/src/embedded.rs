//! The embedded daemon image.
//!
//! Exactly one gzip-compressed daemon binary is embedded per (os, arch)
//! tuple, selected at compile time; `build.rs` produces the blob from the
//! binary named by `BURNAFTER_DAEMON_IMAGE`. Builds without an image embed
//! an empty placeholder and launching fails with [`ImageError::Missing`].

use std::io::Read;

use flate2::read::GzDecoder;
use thiserror::Error;

// Targets the build pipeline produces daemon binaries for. Anything else
// cannot launch a daemon and is rejected at compile time.
#[cfg(not(any(
    all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")),
    all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
)))]
compile_error!("no embedded daemon image is available for this target");

static DAEMON_IMAGE_GZ: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/daemon-image.gz"));

/// Errors producing the daemon image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The binary was built without an embedded daemon image.
    #[error("no embedded daemon image in this build")]
    Missing,

    /// The embedded image failed to decompress.
    #[error("decompressing daemon image: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Decompress the embedded daemon image for the current platform.
pub fn daemon_image() -> Result<Vec<u8>, ImageError> {
    if DAEMON_IMAGE_GZ.is_empty() {
        return Err(ImageError::Missing);
    }

    let mut decoder = GzDecoder::new(DAEMON_IMAGE_GZ);
    let mut image = Vec::new();
    decoder
        .read_to_end(&mut image)
        .map_err(ImageError::Decompress)?;
    Ok(image)
}
