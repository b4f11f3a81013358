//! The lock/signal pair: mutual exclusion plus change notification

use std::time::Duration;

use crate::{
    config::{FabricConfig, PrefixFallback},
    error::{FabricError, Result},
    names,
};

use super::{Acquired, NamedEvent, NamedMutex};

/// A named mutex and named event opened together from one base name
///
/// This is the synchronization unit every channel uses: writers acquire the
/// mutex, mutate the associated segment, release, then signal; readers wait
/// for the signal, acquire, read, release. Acquiring after waking absorbs
/// the case where many writes collapsed into one notification.
///
/// The privileged-prefix fallback is applied to the pair as a unit, so the
/// mutex and event can never end up in different namespaces.
pub struct LockSignalPair {
    base_name: String,
    mutex: NamedMutex,
    event: NamedEvent,
}

impl LockSignalPair {
    /// Open the mutex and event for `base_name`, creating them if absent
    pub fn open(config: &FabricConfig, base_name: &str) -> Result<Self> {
        let mutex_name = names::mutex_name(&config.privileged_prefix, base_name);
        let event_name = names::event_name(&config.privileged_prefix, base_name);
        match Self::open_tier(base_name, &mutex_name, &event_name, config.permissions) {
            Ok(pair) => Ok(pair),
            Err(FabricError::AccessDenied { .. })
                if config.fallback == PrefixFallback::Lenient
                    && !config.privileged_prefix.is_empty() =>
            {
                tracing::debug!(
                    base = %base_name,
                    "privileged namespace refused sync pair, retrying in session scope"
                );
                let mutex_name = names::mutex_name("", base_name);
                let event_name = names::event_name("", base_name);
                Self::open_tier(base_name, &mutex_name, &event_name, config.permissions)
            }
            Err(e) => Err(e),
        }
    }

    fn open_tier(
        base_name: &str,
        mutex_name: &str,
        event_name: &str,
        permissions: u32,
    ) -> Result<Self> {
        let mutex = NamedMutex::open(mutex_name, permissions)?;
        let event = NamedEvent::open(event_name, permissions)?;
        Ok(Self {
            base_name: base_name.to_string(),
            mutex,
            event,
        })
    }

    /// Block up to `timeout` for the mutex
    pub fn acquire(&self, timeout: Duration) -> Result<Acquired> {
        self.mutex.acquire(timeout)
    }

    /// Release the mutex; callable only by the acquiring thread
    pub fn release(&self) -> Result<()> {
        self.mutex.release()
    }

    /// Set the event, waking current waiters
    pub fn signal(&self) -> Result<()> {
        self.event.signal()
    }

    /// Consume one notification edge, blocking up to `timeout`
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        self.event.wait(timeout)
    }

    /// The base name this pair was opened with
    pub fn base_name(&self) -> &str {
        &self.base_name
    }
}

impl std::fmt::Debug for LockSignalPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockSignalPair")
            .field("base_name", &self.base_name)
            .field("mutex", &self.mutex.object_name())
            .field("event", &self.event.object_name())
            .finish()
    }
}
