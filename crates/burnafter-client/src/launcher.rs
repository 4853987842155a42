//! Locating and spawning the daemon.
//!
//! The client guarantees a daemon is listening on the socket path before it
//! connects. A daemon that already answers `Ping` is reused; otherwise the
//! embedded image is decompressed and executed, preferably from an
//! anonymous in-memory file (`memfd_create`, sealed against modification,
//! exec'd through `/proc/self/fd/N`) so the daemon never touches disk. If
//! the in-memory path is unavailable or blocked, the image is extracted to
//! a private temporary file that is unlinked a few seconds after spawn: the
//! kernel's running-image reference keeps it alive while the directory
//! entry is gone.
//!
//! The spawned daemon is detached into its own session, inherits the full
//! environment, and receives the client's configuration serialized as its
//! single argument.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use burnafter_core::config::Config;
use burnafter_core::protocol::{Request, Response};

use crate::embedded::{self, ImageError};

/// Attempts made waiting for a spawned daemon to answer.
const STARTUP_ATTEMPTS: u32 = 10;

/// Delay between startup attempts.
const STARTUP_INTERVAL: Duration = Duration::from_millis(100);

/// How long the extracted temp-file image outlives the spawn before it is
/// unlinked.
const TEMP_IMAGE_LINGER: Duration = Duration::from_secs(2);

/// Errors launching the daemon.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No usable daemon image.
    #[error(transparent)]
    Image(#[from] ImageError),

    /// Serializing the configuration argument failed.
    #[error("serializing daemon configuration: {0}")]
    Config(#[from] burnafter_core::config::ConfigError),

    /// Writing the image to its launch location failed.
    #[error("preparing daemon image: {0}")]
    Prepare(#[source] std::io::Error),

    /// The daemon process could not be started.
    #[error("spawning daemon: {0}")]
    Spawn(#[source] std::io::Error),

    /// The daemon never answered within the startup window.
    #[error("daemon failed to start within {STARTUP_ATTEMPTS} attempts")]
    StartupTimeout,
}

/// Ensure a daemon is listening on `socket_path`, spawning one if needed.
pub fn ensure_daemon(config: &Config, socket_path: &Path) -> Result<(), LaunchError> {
    if ping_socket(socket_path) {
        debug!(path = %socket_path.display(), "Reusing running daemon");
        return Ok(());
    }

    spawn_daemon(config)?;

    for _ in 0..STARTUP_ATTEMPTS {
        std::thread::sleep(STARTUP_INTERVAL);
        if ping_socket(socket_path) {
            debug!(path = %socket_path.display(), "Daemon is up");
            return Ok(());
        }
    }

    Err(LaunchError::StartupTimeout)
}

/// Whether a live daemon answers `Ping` on the socket path.
pub fn ping_socket(path: &Path) -> bool {
    let Ok(stream) = UnixStream::connect(path) else {
        return false;
    };
    let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(1)));

    let Ok(line) = Request::Ping.to_json_line() else {
        return false;
    };
    let mut writer = &stream;
    if writer.write_all(line.as_bytes()).is_err() || writer.flush().is_err() {
        return false;
    }

    let mut reader = BufReader::new(&stream);
    let mut response = String::new();
    if reader.read_line(&mut response).is_err() {
        return false;
    }

    matches!(
        Response::parse(response.trim()),
        Ok(Response::Pong { alive: true })
    )
}

/// Spawn the embedded daemon, in-memory first, temp file as fallback.
fn spawn_daemon(config: &Config) -> Result<(), LaunchError> {
    let image = embedded::daemon_image()?;
    let arg = config.to_arg()?;

    #[cfg(target_os = "linux")]
    match spawn_from_memfd(&image, &arg, config.debug) {
        Ok(()) => return Ok(()),
        Err(e) => {
            debug!(error = %e, "In-memory launch failed, extracting to temp file");
        }
    }

    spawn_from_temp_file(&image, &arg, config.debug)
}

/// Execute the image from an anonymous in-memory file.
#[cfg(target_os = "linux")]
fn spawn_from_memfd(image: &[u8], arg: &str, debug: bool) -> std::io::Result<()> {
    use std::os::unix::io::{AsRawFd, FromRawFd};

    // MFD_EXEC exists since kernel 6.3; older kernels reject the flag.
    const MFD_EXEC: libc::c_uint = 0x10;

    let name = std::ffi::CString::new("burnafter-daemon").expect("static string");
    // Safety: name is a valid NUL-terminated string.
    let mut fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_ALLOW_SEALING | MFD_EXEC) };
    if fd < 0 {
        fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_ALLOW_SEALING) };
    }
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Safety: we own the fresh fd; the File closes it when dropped.
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    file.write_all(image)?;
    file.flush()?;

    // Seal against any further modification. Sealing can be refused (e.g.
    // by an LSM); the launch still proceeds.
    let seals = libc::F_SEAL_SEAL | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE;
    // Safety: fcntl on an fd we own.
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, seals) } < 0 {
        warn!("Failed to seal in-memory daemon image");
    }

    // The fd is inherited by the child (no CLOEXEC), so the same number is
    // valid under the child's /proc/self/fd.
    let mut command = Command::new(format!("/proc/self/fd/{}", file.as_raw_fd()));
    configure_daemon_command(&mut command, arg, debug);
    let child = command.spawn()?;
    reap_in_background(child);

    drop(file);
    Ok(())
}

/// Extract the image to a private temp file and execute it from there.
fn spawn_from_temp_file(image: &[u8], arg: &str, debug: bool) -> Result<(), LaunchError> {
    use std::os::unix::fs::PermissionsExt;

    // tempfile creates the file with mode 0600.
    let mut tmp = tempfile::Builder::new()
        .prefix("burnafter-daemon-")
        .tempfile_in(std::env::temp_dir())
        .map_err(LaunchError::Prepare)?;
    tmp.write_all(image).map_err(LaunchError::Prepare)?;
    tmp.flush().map_err(LaunchError::Prepare)?;

    let (file, image_path) = tmp.keep().map_err(|e| LaunchError::Prepare(e.error))?;
    drop(file);

    let executable = std::fs::Permissions::from_mode(0o700);
    if let Err(e) = std::fs::set_permissions(&image_path, executable) {
        let _ = std::fs::remove_file(&image_path);
        return Err(LaunchError::Prepare(e));
    }

    // macOS refuses to execute downloaded-looking files until the
    // quarantine attribute is gone; absence of the attribute is fine.
    #[cfg(target_os = "macos")]
    {
        let _ = Command::new("xattr")
            .args(["-d", "com.apple.quarantine"])
            .arg(&image_path)
            .status();
    }

    let mut command = Command::new(&image_path);
    configure_daemon_command(&mut command, arg, debug);
    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = std::fs::remove_file(&image_path);
            return Err(LaunchError::Spawn(e));
        }
    };
    reap_in_background(child);

    // Unlink once the kernel has the image loaded; the running process
    // keeps the inode alive without a directory entry.
    std::thread::spawn(move || {
        std::thread::sleep(TEMP_IMAGE_LINGER);
        let _ = std::fs::remove_file(&image_path);
    });

    Ok(())
}

/// Shared spawn setup: config argument, detached session, quiet stdio.
fn configure_daemon_command(command: &mut Command, arg: &str, debug: bool) {
    use std::os::unix::process::CommandExt;

    command.arg(arg);
    // The full environment is inherited by default.

    command.stdin(Stdio::null());
    if !debug {
        // Debug keeps the daemon's stderr attached to the client.
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());
    }

    // Safety: setsid is async-signal-safe and called between fork and exec.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Wait for the child in the background so it never lingers as a zombie.
fn reap_in_background(mut child: std::process::Child) {
    std::thread::spawn(move || {
        let _ = child.wait();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_on_missing_socket_is_false() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!ping_socket(&dir.path().join("absent.sock")));
    }

    #[test]
    fn ping_on_dead_listener_is_false() {
        // A bound socket with no reader accepts the connect but never
        // answers; the read times out.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mute.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        assert!(!ping_socket(&path));
    }

    #[test]
    fn ensure_daemon_without_image_reports_missing() {
        // Development builds carry no embedded image; ensure_daemon must
        // surface that as a structured launch error, not a panic.
        if embedded::daemon_image().is_ok() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            socket_path: dir.path().join("no.sock").display().to_string(),
            ..Config::default()
        };

        let result = ensure_daemon(&config, &config.socket_path_or_default());
        assert!(matches!(
            result,
            Err(LaunchError::Image(ImageError::Missing))
        ));
    }
}
