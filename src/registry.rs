//! Global provider registry
//!
//! The registry is one distinguished segment plus lock/signal pair holding a
//! JSON object that maps provider names to descriptors. There is no registry
//! server: the first participant to look formats an empty document under the
//! lock, and every mutation is a read-modify-write by whichever process
//! performs it. Concurrent writers serialize on the lock; last writer wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::{FabricConfig, READ_LOCK_TIMEOUT, WATCH_WAIT_TIMEOUT, WRITE_LOCK_TIMEOUT},
    error::{FabricError, Result},
    names,
    segment::SharedSegment,
    sync::LockSignalPair,
};

/// Liveness state of a provider as recorded in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Online,
    Offline,
    Error,
}

impl ProviderStatus {
    /// The wire string for this status
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    /// Parse a wire string, mapping anything unrecognized to `Offline`
    pub fn from_wire(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "error" => Self::Error,
            _ => Self::Offline,
        }
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

fn default_status() -> ProviderStatus {
    ProviderStatus::Offline
}

/// One registry entry
///
/// The provider name is the key of the registry object, not part of the
/// serialized entry; snapshots fill it in from the key. Timestamps are
/// Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_status")]
    pub status: ProviderStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(rename = "lastUpdate", default)]
    pub last_update_ms: u64,
    #[serde(rename = "lastHeartbeat", default)]
    pub last_heartbeat_ms: u64,
}

/// Callback invoked with a fresh snapshot on every registry change signal
pub(crate) type ChangeHandler = Box<dyn FnMut(&[ProviderDescriptor]) + Send>;

/// Current time as Unix epoch milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct RegistryShared {
    segment: Mutex<SharedSegment>,
    pair: LockSignalPair,
}

impl RegistryShared {
    /// Run `f` on the registry segment under both the process-local and the
    /// cross-process lock. `f` returns the value and whether it mutated the
    /// document; the event is signalled only after a successful mutation,
    /// so a failed write never wakes readers.
    fn with_lock<T>(
        &self,
        timeout: Duration,
        f: impl FnOnce(&mut SharedSegment) -> Result<(T, bool)>,
    ) -> Result<T> {
        let mut seg = self.segment.lock().unwrap();
        let acquired = self.pair.acquire(timeout)?;
        if acquired.is_abandoned() {
            tracing::warn!(
                object = %seg.object_name(),
                "registry mutex recovered from a dead holder"
            );
        }
        let outcome = f(&mut seg);
        let released = self.pair.release();
        let (value, mutated) = outcome?;
        released?;
        if mutated {
            self.pair.signal()?;
        }
        Ok(value)
    }

    fn snapshot(&self, timeout: Duration) -> Result<Vec<ProviderDescriptor>> {
        let document = self.with_lock(timeout, |seg| Ok((read_document(seg)?, false)))?;
        Ok(document_to_descriptors(&document))
    }
}

/// Parse the registry document, treating absent or unparsable content as empty
///
/// An abandoned writer can leave partial JSON behind; the read-modify-write
/// pattern recovers by rewriting the whole document on the next mutation.
fn read_document(seg: &SharedSegment) -> Result<Map<String, Value>> {
    match seg.read_frame() {
        Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                tracing::warn!("registry document is not a JSON object, treating as empty");
                Ok(Map::new())
            }
        },
        Err(FabricError::Empty { .. }) | Err(FabricError::Invalid { .. }) => Ok(Map::new()),
        Err(e) => Err(e),
    }
}

fn write_document(seg: &mut SharedSegment, document: &Map<String, Value>) -> Result<()> {
    let bytes = serde_json::to_vec(document)
        .map_err(|e| FabricError::invalid(format!("registry serialization failed: {}", e)))?;
    seg.write_frame(&bytes)
}

fn document_to_descriptors(document: &Map<String, Value>) -> Vec<ProviderDescriptor> {
    let mut descriptors: Vec<ProviderDescriptor> = document
        .iter()
        .filter_map(|(name, value)| {
            match serde_json::from_value::<ProviderDescriptor>(value.clone()) {
                Ok(mut descriptor) => {
                    descriptor.name = name.clone();
                    Some(descriptor)
                }
                Err(e) => {
                    tracing::debug!(provider = %name, error = %e, "skipping malformed registry entry");
                    None
                }
            }
        })
        .collect();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    descriptors
}

/// Handle to the global provider roster
///
/// Every component that needs the registry opens its own handle; the
/// underlying objects are shared through their names like any other channel.
pub struct Registry {
    shared: Arc<RegistryShared>,
    handler: Arc<Mutex<Option<ChangeHandler>>>,
    running: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl Registry {
    /// Open the registry segment and its lock/signal pair
    pub fn open(config: &FabricConfig) -> Result<Self> {
        config.validate()?;
        let segment = SharedSegment::open(
            config,
            &names::registry_segment_name(&config.privileged_prefix),
            config.segment_size,
        )?;
        let pair = LockSignalPair::open(config, names::REGISTRY_BASE_NAME)?;
        Ok(Self {
            shared: Arc::new(RegistryShared {
                segment: Mutex::new(segment),
                pair,
            }),
            handler: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            watcher: None,
        })
    }

    /// Format the registry document if it is absent or not a JSON object
    ///
    /// This lazy format-on-open is the only initialization the registry
    /// ever receives.
    pub fn initialize(&self) -> Result<()> {
        self.shared.with_lock(WRITE_LOCK_TIMEOUT, |seg| {
            let formatted = match seg.read_frame() {
                Ok(bytes) => matches!(
                    serde_json::from_slice::<Value>(&bytes),
                    Ok(Value::Object(_))
                ),
                Err(FabricError::Empty { .. }) | Err(FabricError::Invalid { .. }) => false,
                Err(e) => return Err(e),
            };
            if formatted {
                Ok(((), false))
            } else {
                seg.write_frame(b"{}")?;
                Ok(((), true))
            }
        })
    }

    /// Insert or replace a provider entry, marking it online now
    pub fn register(
        &self,
        name: &str,
        description: &str,
        capabilities: &[String],
    ) -> Result<()> {
        let ts = now_ms();
        let entry = ProviderDescriptor {
            name: name.to_string(),
            status: ProviderStatus::Online,
            description: description.to_string(),
            capabilities: capabilities.to_vec(),
            last_update_ms: ts,
            last_heartbeat_ms: ts,
        };
        let value = serde_json::to_value(&entry)
            .map_err(|e| FabricError::invalid(format!("descriptor serialization failed: {}", e)))?;
        self.shared.with_lock(WRITE_LOCK_TIMEOUT, |seg| {
            let mut document = read_document(seg)?;
            document.insert(name.to_string(), value);
            write_document(seg, &document)?;
            Ok(((), true))
        })?;
        tracing::debug!(provider = %name, "registered provider");
        Ok(())
    }

    /// Update the status of an existing entry, refreshing its timestamps
    ///
    /// `lastUpdate` always advances; `lastHeartbeat` advances only for
    /// `Online` updates, which is how a publish doubles as a heartbeat.
    pub fn update_status(&self, name: &str, status: ProviderStatus) -> Result<()> {
        self.shared.with_lock(WRITE_LOCK_TIMEOUT, |seg| {
            let mut document = read_document(seg)?;
            let ts = now_ms();
            let entry = document
                .get_mut(name)
                .ok_or_else(|| FabricError::unknown_provider(name))?;
            let object = entry.as_object_mut().ok_or_else(|| {
                FabricError::invalid(format!("registry entry for {} is not an object", name))
            })?;
            object.insert("status".to_string(), Value::from(status.as_wire()));
            object.insert("lastUpdate".to_string(), Value::from(ts));
            if status == ProviderStatus::Online {
                object.insert("lastHeartbeat".to_string(), Value::from(ts));
            }
            write_document(seg, &document)?;
            Ok(((), true))
        })
    }

    /// Delete a provider entry; removing an absent name is not an error
    pub fn remove(&self, name: &str) -> Result<()> {
        self.shared.with_lock(WRITE_LOCK_TIMEOUT, |seg| {
            let mut document = read_document(seg)?;
            document.remove(name);
            write_document(seg, &document)?;
            Ok(((), true))
        })
    }

    /// Defensive copy of all well-formed entries, sorted by provider name
    pub fn snapshot(&self) -> Result<Vec<ProviderDescriptor>> {
        self.shared.snapshot(WRITE_LOCK_TIMEOUT)
    }

    /// Mark online entries whose heartbeat is older than `max_age` offline
    ///
    /// The fabric itself never detects provider death; this gives hosts the
    /// sweep mechanism while the calling cadence stays host policy. Returns
    /// the names that were flipped and signals only when the document
    /// changed.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<Vec<String>> {
        self.shared.with_lock(WRITE_LOCK_TIMEOUT, |seg| {
            let mut document = read_document(seg)?;
            let now = now_ms();
            let cutoff = now.saturating_sub(max_age.as_millis() as u64);
            let mut swept = Vec::new();
            for (name, value) in document.iter_mut() {
                let Some(object) = value.as_object_mut() else {
                    continue;
                };
                let online = object.get("status").and_then(Value::as_str)
                    == Some(ProviderStatus::Online.as_wire());
                let heartbeat = object
                    .get("lastHeartbeat")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                if online && heartbeat < cutoff {
                    object.insert(
                        "status".to_string(),
                        Value::from(ProviderStatus::Offline.as_wire()),
                    );
                    object.insert("lastUpdate".to_string(), Value::from(now));
                    swept.push(name.clone());
                }
            }
            if swept.is_empty() {
                Ok((swept, false))
            } else {
                tracing::debug!(count = swept.len(), "swept stale providers offline");
                write_document(seg, &document)?;
                Ok((swept, true))
            }
        })
    }

    /// Install a change handler and start the background watcher
    ///
    /// The watcher waits on the registry event with a bounded timeout and
    /// invokes the handler with a fresh snapshot for every signal edge.
    pub fn set_change_handler(
        &mut self,
        handler: impl FnMut(&[ProviderDescriptor]) + Send + 'static,
    ) -> Result<()> {
        *self.handler.lock().unwrap() = Some(Box::new(handler));
        self.spawn_watcher()
    }

    fn spawn_watcher(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handler = Arc::clone(&self.handler);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name("sharingway-registry-watch".to_string())
            .spawn(move || watch_loop(shared, handler, running))
            .map_err(|e| FabricError::from_io(e, "failed to spawn registry watcher"))?;
        self.watcher = Some(handle);
        Ok(())
    }

    /// Stop the watcher and drop the change handler; idempotent
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.watcher.take() {
            let _ = handle.join();
        }
        *self.handler.lock().unwrap() = None;
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

fn watch_loop(
    shared: Arc<RegistryShared>,
    handler: Arc<Mutex<Option<ChangeHandler>>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        match shared.pair.wait(WATCH_WAIT_TIMEOUT) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "registry watcher wait failed");
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        }
        let snapshot = match shared.snapshot(READ_LOCK_TIMEOUT) {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_transient() => continue,
            Err(e) => {
                tracing::warn!(error = %e, "registry watcher snapshot failed");
                continue;
            }
        };
        let mut guard = handler.lock().unwrap();
        if let Some(callback) = guard.as_mut() {
            callback(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_strings() {
        assert_eq!(ProviderStatus::Online.as_wire(), "online");
        assert_eq!(ProviderStatus::Offline.as_wire(), "offline");
        assert_eq!(ProviderStatus::Error.as_wire(), "error");
        assert_eq!(ProviderStatus::from_wire("online"), ProviderStatus::Online);
        assert_eq!(ProviderStatus::from_wire("bogus"), ProviderStatus::Offline);
    }

    #[test]
    fn descriptor_wire_format() {
        let entry = ProviderDescriptor {
            name: "alpha".to_string(),
            status: ProviderStatus::Online,
            description: "test provider".to_string(),
            capabilities: vec!["telemetry".to_string()],
            last_update_ms: 1234,
            last_heartbeat_ms: 5678,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["status"], "online");
        assert_eq!(value["lastUpdate"], 1234);
        assert_eq!(value["lastHeartbeat"], 5678);
        // The name lives in the registry key, not the entry.
        assert!(value.get("name").is_none());

        let parsed: ProviderDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.status, ProviderStatus::Online);
        assert_eq!(parsed.capabilities, entry.capabilities);
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let mut document = Map::new();
        document.insert(
            "good".to_string(),
            serde_json::json!({
                "status": "online",
                "description": "",
                "capabilities": [],
                "lastUpdate": 1,
                "lastHeartbeat": 1
            }),
        );
        document.insert("bad".to_string(), Value::from(42));
        let descriptors = document_to_descriptors(&document);
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "good");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let value = serde_json::json!({ "description": "sparse" });
        let parsed: ProviderDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.status, ProviderStatus::Offline);
        assert!(parsed.capabilities.is_empty());
        assert_eq!(parsed.last_update_ms, 0);
    }
}
