//! Named cross-process mutex

use std::fs::File;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use memmap2::MmapMut;

use crate::error::{FabricError, Result};
use crate::segment;

use super::{check_rc, deadline_after, shared_state_handshake};

/// Outcome of a successful acquisition
///
/// `Abandoned` still grants ownership: the previous holder died without
/// releasing, so the guarded state may be inconsistent and must be discarded
/// or rewritten before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Normal acquisition
    Clean,
    /// Ownership recovered from a dead holder
    Abandoned,
}

impl Acquired {
    /// Whether the previous holder died while owning the mutex
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned)
    }
}

#[repr(C)]
struct MutexShared {
    state: AtomicU32,
    _reserved: u32,
    lock: libc::pthread_mutex_t,
}

/// A robust, recursive mutex shared across processes through its name
///
/// The mutex is reentrant only to its holding thread, and only the
/// acquiring thread may release it. When a holder dies, the next acquirer
/// gets [`Acquired::Abandoned`] instead of hanging.
pub struct NamedMutex {
    object_name: String,
    mmap: MmapMut,
    _file: File,
}

// SAFETY: all access to the mapped bytes goes through the process-shared
// pthread mutex, which is designed for concurrent use from any thread.
unsafe impl Send for NamedMutex {}
unsafe impl Sync for NamedMutex {}

impl NamedMutex {
    /// Open the named mutex, creating and initializing it if absent
    pub fn open(object_name: &str, permissions: u32) -> Result<Self> {
        let mapping = segment::map_object(
            object_name,
            std::mem::size_of::<MutexShared>(),
            permissions,
        )?;
        let this = Self {
            object_name: object_name.to_string(),
            mmap: mapping.mmap,
            _file: mapping.file,
        };
        let shared = this.shared();
        // SAFETY: the mapping is at least as large as MutexShared and lives
        // for the lifetime of `this`.
        let state = unsafe { &(*shared).state };
        shared_state_handshake(state, object_name, || unsafe {
            init_robust_mutex(addr_of_mut!((*shared).lock))
        })?;
        Ok(this)
    }

    fn shared(&self) -> *mut MutexShared {
        self.mmap.as_ptr() as *mut MutexShared
    }

    /// Block up to `timeout` for ownership
    pub fn acquire(&self, timeout: Duration) -> Result<Acquired> {
        let deadline = deadline_after(libc::CLOCK_REALTIME, timeout);
        let lock = unsafe { addr_of_mut!((*self.shared()).lock) };
        // SAFETY: `lock` points into our live mapping and was initialized by
        // the handshake in `open`.
        let rc = unsafe { libc::pthread_mutex_timedlock(lock, &deadline) };
        match rc {
            0 => Ok(Acquired::Clean),
            libc::ETIMEDOUT => Err(FabricError::timeout(
                format!("acquire {}", self.object_name),
                timeout,
            )),
            libc::EOWNERDEAD => {
                // Ownership is granted; mark the mutex usable again before
                // anyone else can observe it.
                unsafe { libc::pthread_mutex_consistent(lock) };
                Ok(Acquired::Abandoned)
            }
            rc => Err(FabricError::platform(format!(
                "pthread_mutex_timedlock({}) failed: {}",
                self.object_name,
                std::io::Error::from_raw_os_error(rc)
            ))),
        }
    }

    /// Release ownership; callable only by the acquiring thread
    pub fn release(&self) -> Result<()> {
        let lock = unsafe { addr_of_mut!((*self.shared()).lock) };
        let rc = unsafe { libc::pthread_mutex_unlock(lock) };
        if rc == libc::EPERM {
            return Err(FabricError::platform(format!(
                "{} released by a thread that does not own it",
                self.object_name
            )));
        }
        check_rc(rc, "pthread_mutex_unlock")
    }

    /// The kernel object name backing this mutex
    pub fn object_name(&self) -> &str {
        &self.object_name
    }
}

impl std::fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex")
            .field("object_name", &self.object_name)
            .finish()
    }
}

unsafe fn init_robust_mutex(lock: *mut libc::pthread_mutex_t) -> Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    check_rc(
        libc::pthread_mutexattr_init(attr.as_mut_ptr()),
        "pthread_mutexattr_init",
    )?;
    libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
    libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
    libc::pthread_mutexattr_settype(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_RECURSIVE);
    let rc = libc::pthread_mutex_init(lock, attr.as_ptr());
    libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
    check_rc(rc, "pthread_mutex_init")
}
