//! Unix socket binding for the daemon's listening endpoint.

use std::path::Path;

use thiserror::Error;
use tokio::net::UnixListener;
use tracing::debug;

/// Errors binding the listening socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Failed to bind to the socket path.
    #[error("failed to bind socket: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Failed to remove a stale socket file at the path.
    #[error("failed to remove existing socket: {0}")]
    UnlinkFailed(#[source] std::io::Error),

    /// Failed to restrict the socket permissions.
    #[error("failed to set socket permissions: {0}")]
    PermissionsFailed(#[source] std::io::Error),
}

/// Bind the daemon's Unix listener at `path`.
///
/// Any pre-existing file at the path is unlinked first, and the bound
/// socket is restricted to mode 0600 before the listener is returned, so
/// no connection can be accepted with looser permissions.
pub fn bind(path: &Path) -> Result<UnixListener, SocketError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(SocketError::UnlinkFailed)?;
        debug!(path = %path.display(), "Removed existing socket");
    }

    let listener = UnixListener::bind(path).map_err(SocketError::BindFailed)?;

    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(SocketError::PermissionsFailed)?;
    }

    debug!(path = %path.display(), "Socket bound");
    Ok(listener)
}
