//! Error types and handling for the sharing fabric

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, FabricError>;

/// Error taxonomy for the shared-memory fabric
///
/// The first seven variants carry the cross-language semantics of the wire
/// contract; `Io` and `Platform` cover OS-level failures underneath them.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// The OS refused to create or open a named object with the requested scope
    #[error("access denied: {name}")]
    AccessDenied { name: String },

    /// The handle is valid but the underlying object is gone (e.g. use after shutdown)
    #[error("not attached: {name}")]
    NotAttached { name: String },

    /// A frame does not fit in its segment
    #[error("oversize frame: {requested} bytes exceeds capacity {available}")]
    Oversize { requested: usize, available: usize },

    /// The length prefix is out of range or the payload is not valid JSON
    #[error("invalid frame: {message}")]
    Invalid { message: String },

    /// A lock or wait exceeded its deadline
    #[error("timed out after {timeout_ms} ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A mutex was left locked by a process that died
    #[error("mutex abandoned: {name}")]
    Abandoned { name: String },

    /// Read attempted when no payload has been written
    #[error("segment empty: {name}")]
    Empty { name: String },

    /// The named provider has no registry entry or active subscription
    #[error("unknown provider: {name}")]
    UnknownProvider { name: String },

    /// I/O related errors (shm objects, mapping)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Platform-specific errors (pthread, clock, name validation)
    #[error("platform error: {message}")]
    Platform { message: String },
}

impl FabricError {
    /// Create an access denied error
    pub fn access_denied(name: impl Into<String>) -> Self {
        Self::AccessDenied { name: name.into() }
    }

    /// Create a not attached error
    pub fn not_attached(name: impl Into<String>) -> Self {
        Self::NotAttached { name: name.into() }
    }

    /// Create an oversize error
    pub fn oversize(requested: usize, available: usize) -> Self {
        Self::Oversize {
            requested,
            available,
        }
    }

    /// Create an invalid frame error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create an abandoned mutex error
    pub fn abandoned(name: impl Into<String>) -> Self {
        Self::Abandoned { name: name.into() }
    }

    /// Create an empty segment error
    pub fn empty(name: impl Into<String>) -> Self {
        Self::Empty { name: name.into() }
    }

    /// Create an unknown provider error
    pub fn unknown_provider(name: impl Into<String>) -> Self {
        Self::UnknownProvider { name: name.into() }
    }

    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Whether the error is transient and worth retrying on the next watcher pass
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Abandoned { .. })
    }
}
