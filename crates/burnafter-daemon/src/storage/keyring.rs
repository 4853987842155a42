//! Linux kernel keyring storage backend.
//!
//! Payloads are serialized and held as `user` keys in the process keyring
//! (`KEY_SPEC_PROCESS_KEYRING`), so no other process can read them, not
//! even one of the same user, and everything vanishes when the daemon
//! exits.
//!
//! The kernel pins keyrings to OS threads, not processes: a keyring
//! attached on one thread is not visible from the others that serve
//! requests. Every keyring syscall in this process therefore goes through a
//! single dedicated worker thread that attaches the keyring once and then
//! serves operations from a channel for the life of the daemon. The worker
//! is global: all `KeyringStorage` instances share it, and the thread
//! itself is the serializer, so no further locking exists here.

use std::ffi::CString;
use std::sync::mpsc;
use std::sync::OnceLock;

use tracing::{debug, trace};

use super::{Payload, Storage, StorageError};

// keyctl(2) operation numbers and the process-keyring specifier.
const KEYCTL_GET_KEYRING_ID: libc::c_long = 0;
const KEYCTL_SETPERM: libc::c_long = 5;
const KEYCTL_UNLINK: libc::c_long = 9;
const KEYCTL_SEARCH: libc::c_long = 10;
const KEYCTL_READ: libc::c_long = 11;
const KEY_SPEC_PROCESS_KEYRING: libc::c_long = -2;

/// Possessor and user get full permissions; group and other get nothing.
const KEYRING_PERMS: libc::c_ulong = 0x3f3f0000;

/// Kernel key serial number.
type KeySerial = i32;

enum Op {
    Store(Payload),
    Get,
    Delete,
}

struct WorkerRequest {
    op: Op,
    id: String,
    reply: mpsc::Sender<Result<Option<Payload>, StorageError>>,
}

/// The global worker: a sender into its queue, or the init error message.
static WORKER: OnceLock<Result<mpsc::Sender<WorkerRequest>, String>> = OnceLock::new();

/// Kernel keyring implementation of [`Storage`].
///
/// Construction lazily starts the shared worker thread; an initialization
/// failure (keyring unavailable, permission denied) is reported here,
/// synchronously, so the caller can fall back to the in-memory backend.
pub struct KeyringStorage {
    requests: mpsc::Sender<WorkerRequest>,
}

impl KeyringStorage {
    /// Create a keyring backend, starting the shared worker if needed.
    pub fn new() -> Result<Self, StorageError> {
        let worker = WORKER.get_or_init(init_worker);
        match worker {
            Ok(sender) => Ok(Self {
                requests: sender.clone(),
            }),
            Err(message) => Err(StorageError::Backend(message.clone())),
        }
    }

    fn dispatch(&self, op: Op, id: &str) -> Result<Option<Payload>, StorageError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.requests
            .send(WorkerRequest {
                op,
                id: id.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| StorageError::Backend("keyring worker gone".to_string()))?;

        reply_rx
            .recv()
            .map_err(|_| StorageError::Backend("keyring worker gone".to_string()))?
    }
}

impl Storage for KeyringStorage {
    fn store(&self, id: &str, payload: Payload) -> Result<(), StorageError> {
        trace!(id = %id, "Dispatching keyring store");
        self.dispatch(Op::Store(payload), id).map(|_| ())
    }

    fn get(&self, id: &str) -> Result<Payload, StorageError> {
        trace!(id = %id, "Dispatching keyring get");
        self.dispatch(Op::Get, id)?.ok_or(StorageError::NotFound)
    }

    fn delete(&self, id: &str) -> Result<(), StorageError> {
        trace!(id = %id, "Dispatching keyring delete");
        self.dispatch(Op::Delete, id).map(|_| ())
    }
}

/// Start the worker thread and wait for its keyring initialization.
fn init_worker() -> Result<mpsc::Sender<WorkerRequest>, String> {
    let (request_tx, request_rx) = mpsc::channel::<WorkerRequest>();
    let (init_tx, init_rx) = mpsc::channel::<Result<(), String>>();

    let spawned = std::thread::Builder::new()
        .name("burnafter-keyring".to_string())
        .spawn(move || {
            // Attach (or create) the process keyring on this thread. Every
            // subsequent keyring syscall in the process happens right here.
            let keyring = match attach_process_keyring() {
                Ok(id) => id,
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };
            debug!(keyring = keyring, "Process keyring initialized");

            let _ = init_tx.send(Ok(()));

            while let Ok(request) = request_rx.recv() {
                let result = match request.op {
                    Op::Store(payload) => {
                        store_on_thread(keyring, &request.id, &payload).map(|_| None)
                    }
                    Op::Get => get_on_thread(keyring, &request.id).map(Some),
                    Op::Delete => delete_on_thread(keyring, &request.id).map(|_| None),
                };
                let _ = request.reply.send(result);
            }
        });

    if let Err(e) = spawned {
        return Err(format!("spawning keyring worker: {e}"));
    }

    match init_rx.recv() {
        Ok(Ok(())) => Ok(request_tx),
        Ok(Err(message)) => Err(message),
        Err(_) => Err("keyring worker exited during initialization".to_string()),
    }
}

fn attach_process_keyring() -> Result<KeySerial, String> {
    // Safety: KEYCTL_GET_KEYRING_ID with create=1 takes no pointers.
    let keyring = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_GET_KEYRING_ID,
            KEY_SPEC_PROCESS_KEYRING,
            1 as libc::c_long,
        )
    };
    if keyring < 0 {
        return Err(format!(
            "accessing process keyring: {}",
            std::io::Error::last_os_error()
        ));
    }
    let keyring = keyring as KeySerial;

    // Safety: KEYCTL_SETPERM takes the serial and a permission mask.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_SETPERM,
            keyring as libc::c_long,
            KEYRING_PERMS,
        )
    };
    if rc < 0 {
        return Err(format!(
            "setting keyring permissions: {}",
            std::io::Error::last_os_error()
        ));
    }

    Ok(keyring)
}

fn search_key(keyring: KeySerial, id: &str) -> Option<KeySerial> {
    let key_type = CString::new("user").expect("static string");
    let desc = CString::new(id).ok()?;

    // Safety: both pointers are valid NUL-terminated strings.
    let serial = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_SEARCH,
            keyring as libc::c_long,
            key_type.as_ptr(),
            desc.as_ptr(),
            0 as libc::c_long,
        )
    };
    (serial >= 0).then_some(serial as KeySerial)
}

fn store_on_thread(keyring: KeySerial, id: &str, payload: &Payload) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec(payload)?;

    // Replace semantics: unlink any existing key first. Failure to unlink
    // is ignored, add_key overwrites the binding anyway.
    if let Some(existing) = search_key(keyring, id) {
        // Safety: KEYCTL_UNLINK takes two serials.
        unsafe {
            libc::syscall(
                libc::SYS_keyctl,
                KEYCTL_UNLINK,
                existing as libc::c_long,
                keyring as libc::c_long,
            );
        }
    }

    let key_type = CString::new("user").expect("static string");
    let desc = CString::new(id)
        .map_err(|_| StorageError::Backend("secret id contains NUL byte".to_string()))?;

    // Safety: pointers are valid for the lengths passed.
    let serial = unsafe {
        libc::syscall(
            libc::SYS_add_key,
            key_type.as_ptr(),
            desc.as_ptr(),
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            keyring as libc::c_long,
        )
    };
    if serial < 0 {
        return Err(StorageError::Backend(format!(
            "adding key to keyring {keyring}: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

fn get_on_thread(keyring: KeySerial, id: &str) -> Result<Payload, StorageError> {
    let serial = search_key(keyring, id).ok_or(StorageError::NotFound)?;

    // First call sizes the buffer, second call fills it.
    // Safety: a null buffer with length 0 is the documented sizing call.
    let size = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_READ,
            serial as libc::c_long,
            std::ptr::null_mut::<libc::c_void>(),
            0 as libc::c_long,
        )
    };
    if size < 0 {
        return Err(StorageError::Backend(format!(
            "sizing key read: {}",
            std::io::Error::last_os_error()
        )));
    }

    let mut buf = vec![0u8; size as usize];
    // Safety: buf is valid for the length we pass.
    let read = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_READ,
            serial as libc::c_long,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if read < 0 {
        return Err(StorageError::Backend(format!(
            "reading key from keyring: {}",
            std::io::Error::last_os_error()
        )));
    }
    buf.truncate(read as usize);

    Ok(serde_json::from_slice(&buf)?)
}

fn delete_on_thread(keyring: KeySerial, id: &str) -> Result<(), StorageError> {
    // A missing key is not an error; delete is idempotent.
    let Some(serial) = search_key(keyring, id) else {
        return Ok(());
    };

    // Safety: KEYCTL_UNLINK takes two serials.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_UNLINK,
            serial as libc::c_long,
            keyring as libc::c_long,
        )
    };
    if rc < 0 {
        return Err(StorageError::Backend(format!(
            "unlinking key from keyring: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tag: u8) -> Payload {
        Payload {
            encrypted_data: vec![tag; 40],
            salt: vec![tag; 16],
            client_digest: format!("{:02x}", tag).repeat(32),
        }
    }

    /// Keyrings can be unavailable in sandboxes and minimal containers;
    /// these tests exercise the backend only where the kernel provides one.
    fn keyring_or_skip() -> Option<KeyringStorage> {
        match KeyringStorage::new() {
            Ok(storage) => Some(storage),
            Err(e) => {
                eprintln!("skipping keyring test: {e}");
                None
            }
        }
    }

    #[test]
    fn store_get_delete_roundtrip() {
        let Some(storage) = keyring_or_skip() else {
            return;
        };

        storage.store("keyring-test-rt", payload(3)).unwrap();
        assert_eq!(storage.get("keyring-test-rt").unwrap(), payload(3));

        storage.delete("keyring-test-rt").unwrap();
        assert!(matches!(
            storage.get("keyring-test-rt"),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn store_overwrites_existing_key() {
        let Some(storage) = keyring_or_skip() else {
            return;
        };

        storage.store("keyring-test-ow", payload(1)).unwrap();
        storage.store("keyring-test-ow", payload(2)).unwrap();
        assert_eq!(storage.get("keyring-test-ow").unwrap(), payload(2));

        storage.delete("keyring-test-ow").unwrap();
    }

    #[test]
    fn delete_missing_is_success() {
        let Some(storage) = keyring_or_skip() else {
            return;
        };

        storage.delete("keyring-test-never-stored").unwrap();
    }

    #[test]
    fn instances_share_one_worker() {
        let Some(a) = keyring_or_skip() else {
            return;
        };
        let b = KeyringStorage::new().unwrap();

        a.store("keyring-test-shared", payload(7)).unwrap();
        assert_eq!(b.get("keyring-test-shared").unwrap(), payload(7));
        b.delete("keyring-test-shared").unwrap();
    }
}
