//! Named cross-process event with edge-triggered, consumed-on-wait semantics

use std::fs::File;
use std::mem::MaybeUninit;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use memmap2::MmapMut;

use crate::error::{FabricError, Result};
use crate::segment;

use super::{check_rc, deadline_after, shared_state_handshake};

#[repr(C)]
struct EventShared {
    state: AtomicU32,
    _reserved: u32,
    generation: AtomicU64,
    lock: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
}

/// A named notification event shared across processes
///
/// Signalling bumps a shared generation counter and wakes every handle
/// currently blocked in [`wait`](Self::wait). Each handle tracks the last
/// generation it consumed, so a signal is observed exactly once per handle:
/// any number of signals arriving before the next wait collapse into a
/// single pending edge, and a wait with no pending edge blocks until the
/// next signal or the timeout.
///
/// A handle is a single logical waiter; waiting on one handle from several
/// threads concurrently hands the edge to an arbitrary one of them.
pub struct NamedEvent {
    object_name: String,
    mmap: MmapMut,
    _file: File,
    last_seen: AtomicU64,
}

// SAFETY: the shared portion is only touched under its process-shared
// pthread mutex; `last_seen` is handle-local and atomic.
unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

impl NamedEvent {
    /// Open the named event, creating and initializing it if absent
    ///
    /// A freshly opened handle has no pending edge: only signals arriving
    /// after the open are observable through it.
    pub fn open(object_name: &str, permissions: u32) -> Result<Self> {
        let mapping = segment::map_object(
            object_name,
            std::mem::size_of::<EventShared>(),
            permissions,
        )?;
        let this = Self {
            object_name: object_name.to_string(),
            mmap: mapping.mmap,
            _file: mapping.file,
            last_seen: AtomicU64::new(0),
        };
        let shared = this.shared();
        // SAFETY: the mapping is at least as large as EventShared and lives
        // for the lifetime of `this`.
        let state = unsafe { &(*shared).state };
        shared_state_handshake(state, object_name, || unsafe {
            init_shared_condvar(shared)
        })?;
        let baseline = unsafe { (*shared).generation.load(Ordering::Acquire) };
        this.last_seen.store(baseline, Ordering::Relaxed);
        Ok(this)
    }

    fn shared(&self) -> *mut EventShared {
        self.mmap.as_ptr() as *mut EventShared
    }

    /// Set the event, waking all currently blocked waiters
    ///
    /// Idempotent while the edge is pending: signalling an already-signalled
    /// event leaves exactly one edge for each handle to consume.
    pub fn signal(&self) -> Result<()> {
        let shared = self.shared();
        unsafe {
            self.lock_internal()?;
            (*shared).generation.fetch_add(1, Ordering::Relaxed);
            libc::pthread_cond_broadcast(addr_of_mut!((*shared).cond));
            libc::pthread_mutex_unlock(addr_of_mut!((*shared).lock));
        }
        Ok(())
    }

    /// Consume one edge, blocking up to `timeout` for it
    ///
    /// Returns `Ok(true)` when an edge was consumed and `Ok(false)` on
    /// timeout.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let shared = self.shared();
        let deadline = deadline_after(libc::CLOCK_MONOTONIC, timeout);
        unsafe {
            self.lock_internal()?;
            loop {
                let current = (*shared).generation.load(Ordering::Relaxed);
                if current != self.last_seen.load(Ordering::Relaxed) {
                    self.last_seen.store(current, Ordering::Relaxed);
                    libc::pthread_mutex_unlock(addr_of_mut!((*shared).lock));
                    return Ok(true);
                }
                let rc = libc::pthread_cond_timedwait(
                    addr_of_mut!((*shared).cond),
                    addr_of_mut!((*shared).lock),
                    &deadline,
                );
                match rc {
                    0 => continue,
                    libc::ETIMEDOUT => {
                        let current = (*shared).generation.load(Ordering::Relaxed);
                        let signalled = current != self.last_seen.load(Ordering::Relaxed);
                        if signalled {
                            self.last_seen.store(current, Ordering::Relaxed);
                        }
                        libc::pthread_mutex_unlock(addr_of_mut!((*shared).lock));
                        return Ok(signalled);
                    }
                    libc::EOWNERDEAD => {
                        libc::pthread_mutex_consistent(addr_of_mut!((*shared).lock));
                        continue;
                    }
                    rc => {
                        libc::pthread_mutex_unlock(addr_of_mut!((*shared).lock));
                        return Err(FabricError::platform(format!(
                            "pthread_cond_timedwait({}) failed: {}",
                            self.object_name,
                            std::io::Error::from_raw_os_error(rc)
                        )));
                    }
                }
            }
        }
    }

    /// The kernel object name backing this event
    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Take the internal mutex, recovering it from a dead holder
    unsafe fn lock_internal(&self) -> Result<()> {
        let lock = addr_of_mut!((*self.shared()).lock);
        match libc::pthread_mutex_lock(lock) {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                libc::pthread_mutex_consistent(lock);
                Ok(())
            }
            rc => Err(FabricError::platform(format!(
                "pthread_mutex_lock({}) failed: {}",
                self.object_name,
                std::io::Error::from_raw_os_error(rc)
            ))),
        }
    }
}

impl std::fmt::Debug for NamedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedEvent")
            .field("object_name", &self.object_name)
            .finish()
    }
}

unsafe fn init_shared_condvar(shared: *mut EventShared) -> Result<()> {
    let mut mutex_attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    check_rc(
        libc::pthread_mutexattr_init(mutex_attr.as_mut_ptr()),
        "pthread_mutexattr_init",
    )?;
    libc::pthread_mutexattr_setpshared(mutex_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
    libc::pthread_mutexattr_setrobust(mutex_attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
    let rc = libc::pthread_mutex_init(addr_of_mut!((*shared).lock), mutex_attr.as_ptr());
    libc::pthread_mutexattr_destroy(mutex_attr.as_mut_ptr());
    check_rc(rc, "pthread_mutex_init")?;

    let mut cond_attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
    check_rc(
        libc::pthread_condattr_init(cond_attr.as_mut_ptr()),
        "pthread_condattr_init",
    )?;
    libc::pthread_condattr_setpshared(cond_attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
    libc::pthread_condattr_setclock(cond_attr.as_mut_ptr(), libc::CLOCK_MONOTONIC);
    let rc = libc::pthread_cond_init(addr_of_mut!((*shared).cond), cond_attr.as_ptr());
    libc::pthread_condattr_destroy(cond_attr.as_mut_ptr());
    check_rc(rc, "pthread_cond_init")
}
