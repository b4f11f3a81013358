//! Publishing endpoint: owns one payload channel and a registry entry

use crate::{
    config::{FabricConfig, DRAIN_LOCK_TIMEOUT, WRITE_LOCK_TIMEOUT},
    error::{FabricError, Result},
    names,
    registry::{ProviderStatus, Registry},
    segment::SharedSegment,
    sync::LockSignalPair,
};

struct Channel {
    segment: SharedSegment,
    pair: LockSignalPair,
}

/// A named data stream with a single current value
///
/// A provider owns its payload segment and lock/signal pair and advertises
/// itself in the global registry. Publishing overwrites the current value:
/// subscribers see the latest payload on their next read, and missed
/// intermediate values are not recoverable.
///
/// The registry attachment is best effort. A provider that cannot reach the
/// registry still publishes to its segment, and any subscriber that knows
/// the name can attach directly.
pub struct Provider {
    name: String,
    config: FabricConfig,
    registry: Option<Registry>,
    channel: Option<Channel>,
    online: bool,
}

impl Provider {
    /// Create a provider and best-effort register it
    pub fn new(name: &str, description: &str, capabilities: &[String]) -> Self {
        Self::with_config(FabricConfig::default(), name, description, capabilities)
    }

    /// Create a provider with an explicit fabric configuration
    pub fn with_config(
        config: FabricConfig,
        name: &str,
        description: &str,
        capabilities: &[String],
    ) -> Self {
        let registry = match Registry::open(&config) {
            Ok(registry) => {
                if let Err(e) = registry.initialize() {
                    tracing::warn!(provider = %name, error = %e, "registry initialization failed");
                }
                if let Err(e) = registry.register(name, description, capabilities) {
                    tracing::warn!(provider = %name, error = %e, "registry registration failed");
                }
                Some(registry)
            }
            Err(e) => {
                tracing::warn!(
                    provider = %name,
                    error = %e,
                    "registry unreachable, provider operates in isolation"
                );
                None
            }
        };
        Self {
            name: name.to_string(),
            config,
            registry,
            channel: None,
            online: false,
        }
    }

    /// Open the payload channel and go online
    ///
    /// `size` defaults to the configured segment size. On failure the
    /// provider stays uninitialized (and reports `Error` to the registry),
    /// and the call may be retried.
    pub fn initialize(&mut self, size: Option<usize>) -> Result<()> {
        if self.online {
            return Ok(());
        }
        let size = size.unwrap_or(self.config.segment_size);
        let channel = self.open_channel(size);
        match channel {
            Ok(channel) => {
                self.channel = Some(channel);
                self.online = true;
                self.report_status(ProviderStatus::Online);
                tracing::debug!(provider = %self.name, size, "provider online");
                Ok(())
            }
            Err(e) => {
                self.report_status(ProviderStatus::Error);
                Err(e)
            }
        }
    }

    fn open_channel(&self, size: usize) -> Result<Channel> {
        let segment = SharedSegment::open(
            &self.config,
            &names::segment_name(&self.config.privileged_prefix, &self.name),
            size,
        )?;
        let pair = LockSignalPair::open(&self.config, &self.name)?;
        Ok(Channel { segment, pair })
    }

    /// Publish a JSON value as the new current payload
    pub fn publish(&mut self, value: &serde_json::Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| FabricError::invalid(format!("payload serialization failed: {}", e)))?;
        self.publish_raw(&bytes)
    }

    /// Publish pre-serialized UTF-8 JSON bytes
    ///
    /// The bytes are copied into the segment opaquely; the fabric never
    /// parses payloads. Requires the provider to be online. A failed write
    /// leaves the segment unchanged and emits no signal.
    pub fn publish_raw(&mut self, payload: &[u8]) -> Result<()> {
        if !self.online {
            return Err(FabricError::not_attached(&self.name));
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| FabricError::not_attached(&self.name))?;

        let acquired = match channel.pair.acquire(WRITE_LOCK_TIMEOUT) {
            Ok(acquired) => acquired,
            Err(e) => {
                if matches!(e, FabricError::Timeout { .. }) {
                    // Still the owner of the channel, but publishes are stuck.
                    if let Some(registry) = &self.registry {
                        let _ = registry.update_status(&self.name, ProviderStatus::Error);
                    }
                }
                return Err(e);
            }
        };
        if acquired.is_abandoned() {
            tracing::warn!(provider = %self.name, "payload mutex recovered from a dead holder");
        }
        let written = channel.segment.write_frame(payload);
        let released = channel.pair.release();
        written?;
        released?;
        channel.pair.signal()?;

        // The successful publish doubles as a heartbeat.
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.update_status(&self.name, ProviderStatus::Online) {
                tracing::debug!(provider = %self.name, error = %e, "heartbeat update failed");
            }
        }
        Ok(())
    }

    /// Whether the payload channel is open
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// The provider name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drain the channel and go offline; idempotent
    ///
    /// Writes `{}` as a drained marker so attached subscribers observe the
    /// transition, then reports `Offline` to the registry and closes all
    /// handles. The object names stay in the namespace for late readers.
    pub fn shutdown(&mut self) {
        if self.online {
            self.online = false;
            if let Some(channel) = self.channel.as_mut() {
                match channel.pair.acquire(DRAIN_LOCK_TIMEOUT) {
                    Ok(_) => {
                        let written = channel.segment.write_frame(b"{}");
                        if let Err(e) = channel.pair.release() {
                            tracing::warn!(provider = %self.name, error = %e, "drain release failed");
                        }
                        if written.is_ok() {
                            let _ = channel.pair.signal();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(provider = %self.name, error = %e, "drain lock unavailable");
                    }
                }
            }
            self.report_status(ProviderStatus::Offline);
        }
        self.channel = None;
    }

    fn report_status(&self, status: ProviderStatus) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.update_status(&self.name, status) {
                tracing::debug!(provider = %self.name, error = %e, status = %status, "status update failed");
            }
        }
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("online", &self.online)
            .field("registered", &self.registry.is_some())
            .finish()
    }
}
