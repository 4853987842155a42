//! Peer-credential probe for accepted Unix socket connections.
//!
//! The kernel reports the identity of the process at the other end of a
//! local byte-stream; nothing the client sends is trusted for this. The
//! probe runs exactly once per connection, at handshake time, and the
//! result is carried alongside the connection for every request on it.
//!
//! On Linux the full `{pid, uid, gid}` triple comes from `SO_PEERCRED`. On
//! macOS `LOCAL_PEERCRED` yields uid/gid and the PID is read separately via
//! `LOCAL_PEERPID`; when the PID cannot be determined it is reported as 0
//! and request handlers fail closed, because without a PID there is no
//! executable to verify.

use std::os::unix::io::AsRawFd;

use tokio::net::UnixStream;

/// Identity of the process on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    /// PID of the peer; 0 when the platform could not report one.
    pub pid: i32,
    /// Effective UID of the peer.
    pub uid: u32,
    /// Effective GID of the peer.
    pub gid: u32,
}

impl PeerCredentials {
    /// Whether the peer's executable can be verified at all.
    pub fn has_pid(&self) -> bool {
        self.pid > 0
    }
}

/// Read the peer credentials of an accepted connection.
#[cfg(target_os = "linux")]
pub fn peer_credentials(stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    let fd = stream.as_raw_fd();
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // Safety: ucred is a plain struct sized for SO_PEERCRED's output.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(PeerCredentials {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

/// Read the peer credentials of an accepted connection.
#[cfg(target_os = "macos")]
pub fn peer_credentials(stream: &UnixStream) -> std::io::Result<PeerCredentials> {
    let fd = stream.as_raw_fd();

    let mut xucred: libc::xucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::xucred>() as libc::socklen_t;

    // Safety: xucred is sized for LOCAL_PEERCRED's output.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERCRED,
            &mut xucred as *mut libc::xucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // The PID travels on a separate option; absence is not fatal here, but
    // handlers refuse service for pid 0.
    let mut pid: libc::pid_t = 0;
    let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_LOCAL,
            libc::LOCAL_PEERPID,
            &mut pid as *mut libc::pid_t as *mut libc::c_void,
            &mut pid_len,
        )
    };
    if rc != 0 {
        pid = 0;
    }

    Ok(PeerCredentials {
        pid,
        uid: xucred.cr_uid,
        gid: if xucred.cr_ngroups > 0 {
            xucred.cr_groups[0]
        } else {
            0
        },
    })
}
