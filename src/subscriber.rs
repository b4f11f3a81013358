//! Consuming endpoint: watches provider channels and the registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::{
    config::{FabricConfig, READ_LOCK_TIMEOUT, WATCH_WAIT_TIMEOUT},
    error::{FabricError, Result},
    names,
    registry::{ProviderDescriptor, ProviderStatus, Registry},
    segment::SharedSegment,
    sync::LockSignalPair,
};

/// Callback for every received payload frame
pub type DataHandler = Box<dyn FnMut(&str, serde_json::Value) + Send>;

/// Callback for registry membership reports
pub type MembershipHandler = Box<dyn FnMut(&str, ProviderStatus) + Send>;

#[derive(Default)]
struct Handlers {
    data: Option<DataHandler>,
    membership: Option<MembershipHandler>,
}

struct Subscription {
    stop: Arc<AtomicBool>,
    watcher: JoinHandle<()>,
}

/// Consumer of any number of provider channels
///
/// Each subscription runs a dedicated watcher thread over the provider's
/// lock/signal pair; the registry attachment adds membership reports. Both
/// handlers dispatch under one callback mutex, so they never run
/// concurrently with each other or with themselves.
pub struct Subscriber {
    config: FabricConfig,
    registry: Option<Registry>,
    subscriptions: HashMap<String, Subscription>,
    handlers: Arc<Mutex<Handlers>>,
    running: Arc<AtomicBool>,
}

impl Subscriber {
    /// Create a subscriber with the default configuration
    pub fn new() -> Self {
        Self::with_config(FabricConfig::default())
    }

    /// Create a subscriber with an explicit fabric configuration
    pub fn with_config(config: FabricConfig) -> Self {
        Self {
            config,
            registry: None,
            subscriptions: HashMap::new(),
            handlers: Arc::new(Mutex::new(Handlers::default())),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Attach to the registry and start forwarding membership reports
    ///
    /// Formats the registry if nobody has yet. The membership handler is
    /// invoked once per listed provider on every registry change; no delta
    /// is computed, so applications diff snapshots if they need transitions.
    /// Subscribing works without this, losing only discovery.
    pub fn initialize(&mut self) -> Result<()> {
        if self.registry.is_some() {
            return Ok(());
        }
        let mut registry = Registry::open(&self.config)?;
        registry.initialize()?;
        let handlers = Arc::clone(&self.handlers);
        registry.set_change_handler(move |snapshot| {
            let mut guard = handlers.lock().unwrap();
            if let Some(callback) = guard.membership.as_mut() {
                for descriptor in snapshot {
                    callback(&descriptor.name, descriptor.status);
                }
            }
        })?;
        self.registry = Some(registry);
        Ok(())
    }

    /// Watch the named provider; idempotent
    ///
    /// Fails if the provider's segment or sync pair cannot be opened.
    pub fn subscribe(&mut self, provider: &str) -> Result<()> {
        if self.subscriptions.contains_key(provider) {
            return Ok(());
        }
        let segment = SharedSegment::open(
            &self.config,
            &names::segment_name(&self.config.privileged_prefix, provider),
            self.config.segment_size,
        )?;
        let pair = LockSignalPair::open(&self.config, provider)?;

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let name = provider.to_string();
            let handlers = Arc::clone(&self.handlers);
            let running = Arc::clone(&self.running);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("sharingway-watch-{}", provider))
                .spawn(move || watch_provider(name, segment, pair, handlers, running, stop))
                .map_err(|e| FabricError::from_io(e, "failed to spawn subscription watcher"))?
        };
        self.subscriptions
            .insert(provider.to_string(), Subscription { stop, watcher });
        tracing::debug!(provider, "subscribed");
        Ok(())
    }

    /// Stop watching the named provider and join its watcher
    pub fn unsubscribe(&mut self, provider: &str) -> Result<()> {
        let subscription = self
            .subscriptions
            .remove(provider)
            .ok_or_else(|| FabricError::unknown_provider(provider))?;
        subscription.stop.store(true, Ordering::Release);
        let _ = subscription.watcher.join();
        tracing::debug!(provider, "unsubscribed");
        Ok(())
    }

    /// Names of all active subscriptions, sorted
    pub fn list_subscriptions(&self) -> Vec<String> {
        let mut subscriptions: Vec<String> = self.subscriptions.keys().cloned().collect();
        subscriptions.sort();
        subscriptions
    }

    /// Registry snapshot of all known providers
    ///
    /// Without an initialized registry handle this attaches transiently,
    /// so discovery works even before `initialize`.
    pub fn list_providers(&self) -> Result<Vec<ProviderDescriptor>> {
        if let Some(registry) = &self.registry {
            return registry.snapshot();
        }
        let registry = Registry::open(&self.config)?;
        registry.initialize()?;
        registry.snapshot()
    }

    /// Install the callback invoked for every received frame
    pub fn set_data_handler(&mut self, handler: impl FnMut(&str, serde_json::Value) + Send + 'static) {
        self.handlers.lock().unwrap().data = Some(Box::new(handler));
    }

    /// Install the callback invoked for registry membership reports
    pub fn set_membership_handler(
        &mut self,
        handler: impl FnMut(&str, ProviderStatus) + Send + 'static,
    ) {
        self.handlers.lock().unwrap().membership = Some(Box::new(handler));
    }

    /// Tear down all subscriptions, then the registry handle; idempotent
    ///
    /// Watchers exit on their next timeout or signal, bounding shutdown
    /// latency by the watch wait interval.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        for (_, subscription) in self.subscriptions.drain() {
            subscription.stop.store(true, Ordering::Release);
            let _ = subscription.watcher.join();
        }
        if let Some(mut registry) = self.registry.take() {
            registry.shutdown();
        }
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscriptions", &self.subscriptions.len())
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

/// Per-subscription watcher loop
///
/// Wait for a signal edge, take the channel lock briefly to copy the frame
/// out, release, then dispatch. Timeouts and abandoned locks are transient:
/// the loop simply tries again on the next edge. An unreadable frame never
/// reaches the data handler.
fn watch_provider(
    name: String,
    segment: SharedSegment,
    pair: LockSignalPair,
    handlers: Arc<Mutex<Handlers>>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) && !stop.load(Ordering::Acquire) {
        match pair.wait(WATCH_WAIT_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(provider = %name, error = %e, "subscription wait failed");
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        }
        let acquired = match pair.acquire(READ_LOCK_TIMEOUT) {
            Ok(acquired) => acquired,
            Err(e) => {
                if !e.is_transient() {
                    tracing::warn!(provider = %name, error = %e, "subscription lock failed");
                }
                continue;
            }
        };
        if acquired.is_abandoned() {
            tracing::warn!(provider = %name, "payload mutex recovered from a dead holder");
        }
        let frame = segment.read_frame();
        if let Err(e) = pair.release() {
            tracing::warn!(provider = %name, error = %e, "subscription release failed");
        }
        let bytes = match frame {
            Ok(bytes) => bytes,
            // Empty and Invalid frames are silently skipped.
            Err(_) => continue,
        };
        let value = match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(provider = %name, error = %e, "discarding non-JSON frame");
                continue;
            }
        };
        let mut guard = handlers.lock().unwrap();
        if let Some(callback) = guard.data.as_mut() {
            callback(&name, value);
        }
    }
}
