//! Cross-process synchronization: named mutexes, events, and the lock/signal pair
//!
//! Both primitives live in small named shared-memory objects so that any
//! process computing the same name operates on the same kernel-backed state.
//! Layout of the shared portion is `#[repr(C)]` and is part of the wire
//! contract alongside the frame format.

mod event;
mod mutex;
mod pair;

pub use event::NamedEvent;
pub use mutex::{Acquired, NamedMutex};
pub use pair::LockSignalPair;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{FabricError, Result};

/// Shared-state word: object bytes are zero-filled and not yet initialized
pub(crate) const SYNC_RAW: u32 = 0;
/// Shared-state word: one participant is running pthread initialization
pub(crate) const SYNC_BUSY: u32 = 1;
/// Shared-state word: pthread objects are ready for use
pub(crate) const SYNC_READY: u32 = 2;

/// How long openers wait for a racing creator to finish initialization
const INIT_READY_TIMEOUT: Duration = Duration::from_secs(2);

/// One-time initialization handshake for pthread state in shared memory
///
/// A freshly created shm object is zero-filled, so `state` starts at
/// [`SYNC_RAW`]. Exactly one participant wins the CAS and runs `init`;
/// everyone else spins until the state reads [`SYNC_READY`].
pub(crate) fn shared_state_handshake(
    state: &AtomicU32,
    object_name: &str,
    init: impl FnOnce() -> Result<()>,
) -> Result<()> {
    match state.compare_exchange(SYNC_RAW, SYNC_BUSY, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            init()?;
            state.store(SYNC_READY, Ordering::Release);
            Ok(())
        }
        Err(_) => {
            let deadline = Instant::now() + INIT_READY_TIMEOUT;
            while state.load(Ordering::Acquire) != SYNC_READY {
                if Instant::now() >= deadline {
                    return Err(FabricError::platform(format!(
                        "sync object {} never became ready",
                        object_name
                    )));
                }
                std::thread::yield_now();
            }
            Ok(())
        }
    }
}

/// Absolute deadline `timeout` from now on the given clock
pub(crate) fn deadline_after(clock: libc::clockid_t, timeout: Duration) -> libc::timespec {
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: timespec is plain data and the clock id is a valid constant.
    unsafe { libc::clock_gettime(clock, &mut now) };
    let mut sec = now.tv_sec as i64 + timeout.as_secs() as i64;
    let mut nsec = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    if nsec >= NANOS_PER_SEC {
        sec += 1;
        nsec -= NANOS_PER_SEC;
    }
    libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as libc::c_long,
    }
}

/// Map a nonzero pthread return code to a platform error
pub(crate) fn check_rc(rc: libc::c_int, operation: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(FabricError::platform(format!(
            "{} failed: {}",
            operation,
            std::io::Error::from_raw_os_error(rc)
        )))
    }
}
