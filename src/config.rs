//! Configuration for fabric participants

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};

/// Default size for payload and registry segments (1 MiB)
pub const DEFAULT_SEGMENT_SIZE: usize = 1024 * 1024;

/// Smallest segment able to hold the frame header plus a minimal JSON value
pub const MIN_SEGMENT_SIZE: usize = 16;

/// Lock deadline for writers (publish, registry mutation)
pub const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock deadline for readers inside watcher loops
pub const READ_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Signal wait used by watcher loops; bounds shutdown latency
pub const WATCH_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Lock deadline for the drain marker written during provider shutdown
pub const DRAIN_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Behavior when the privileged namespace rejects an open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrefixFallback {
    /// Retry without the privileged prefix, staying within the current session
    Lenient,
    /// Surface the access error; never change namespace silently
    Strict,
}

impl Default for PrefixFallback {
    fn default() -> Self {
        Self::Lenient
    }
}

/// Configuration shared by providers, subscribers, and registry handles
///
/// The defaults reproduce the wire-compatible deployment: objects in the
/// system-wide namespace under the `Global\` prefix, 1 MiB segments, and
/// lenient fallback to session scope when the caller lacks rights to create
/// global objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Kernel-namespace prefix attempted first when opening objects
    pub privileged_prefix: String,
    /// What to do when the privileged namespace refuses the open
    pub fallback: PrefixFallback,
    /// Segment size used when creating payload and registry segments
    pub segment_size: usize,
    /// Unix permissions for created objects
    pub permissions: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            privileged_prefix: "Global\\".to_string(),
            fallback: PrefixFallback::default(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            permissions: 0o600,
        }
    }
}

impl FabricConfig {
    /// Create a configuration with a custom namespace prefix
    ///
    /// Useful for test isolation and for deployments that partition fabrics
    /// by prefix instead of sharing the default global namespace.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            privileged_prefix: prefix.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(FabricError::invalid(format!(
                "segment size {} below minimum {}",
                self.segment_size, MIN_SEGMENT_SIZE
            )));
        }
        if self.privileged_prefix.contains('/') {
            return Err(FabricError::platform(
                "namespace prefix must not contain '/'",
            ));
        }
        Ok(())
    }
}
