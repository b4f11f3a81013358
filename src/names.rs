//! Kernel object naming scheme
//!
//! Names are the wire contract for discovery: two processes share a channel
//! exactly when they compute the same object names. Given a namespace prefix
//! `P` and a base name `N`, the fabric uses
//! `P + "Sharingway." + N` for segments, with `.Lock` / `.Signal` appended
//! for the two synchronization objects, and the reserved base name
//! `Registry` for the global roster.

use crate::error::{FabricError, Result};

/// Namespace component prepended to every object name
pub const SERVICE_NAMESPACE: &str = "Sharingway.";

/// Reserved base name for the global registry
pub const REGISTRY_BASE_NAME: &str = "Registry";

/// Suffix of the mutual-exclusion object
pub const LOCK_SUFFIX: &str = ".Lock";

/// Suffix of the change-notification object
pub const SIGNAL_SUFFIX: &str = ".Signal";

/// Longest object name accepted by the shm namespace, including the leading slash
const OBJECT_NAME_MAX: usize = 255;

/// Segment name for a base name: `P + "Sharingway." + N`
pub fn segment_name(prefix: &str, base: &str) -> String {
    format!("{}{}{}", prefix, SERVICE_NAMESPACE, base)
}

/// Mutex name for a base name: `P + "Sharingway." + N + ".Lock"`
pub fn mutex_name(prefix: &str, base: &str) -> String {
    format!("{}{}{}{}", prefix, SERVICE_NAMESPACE, base, LOCK_SUFFIX)
}

/// Event name for a base name: `P + "Sharingway." + N + ".Signal"`
pub fn event_name(prefix: &str, base: &str) -> String {
    format!("{}{}{}{}", prefix, SERVICE_NAMESPACE, base, SIGNAL_SUFFIX)
}

/// Name of the registry segment: `P + "Sharingway.Registry"`
pub fn registry_segment_name(prefix: &str) -> String {
    segment_name(prefix, REGISTRY_BASE_NAME)
}

/// Map an object name to its POSIX shared-memory path
///
/// The shm namespace is flat: a path is the object name with a single
/// leading slash and no further slashes.
pub fn shm_path(object_name: &str) -> Result<String> {
    validate_object_name(object_name)?;
    Ok(format!("/{}", object_name))
}

/// Validate that a name can live in the shm namespace
pub fn validate_object_name(object_name: &str) -> Result<()> {
    if object_name.is_empty() {
        return Err(FabricError::platform("object name must not be empty"));
    }
    if object_name.contains('/') {
        return Err(FabricError::platform(format!(
            "object name `{}` must not contain '/'",
            object_name
        )));
    }
    if object_name.len() + 1 > OBJECT_NAME_MAX {
        return Err(FabricError::platform(format!(
            "object name `{}` exceeds {} bytes",
            object_name,
            OBJECT_NAME_MAX - 1
        )));
    }
    Ok(())
}

/// Strip the privileged prefix from an object name, if present
///
/// Returns `None` when the name does not carry the prefix, in which case
/// there is no session-scope fallback to attempt.
pub(crate) fn strip_prefix(object_name: &str, prefix: &str) -> Option<String> {
    if prefix.is_empty() {
        return None;
    }
    object_name
        .strip_prefix(prefix)
        .map(|stripped| stripped.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_scheme_matches_wire_contract() {
        assert_eq!(
            segment_name("Global\\", "alpha"),
            "Global\\Sharingway.alpha"
        );
        assert_eq!(
            mutex_name("Global\\", "alpha"),
            "Global\\Sharingway.alpha.Lock"
        );
        assert_eq!(
            event_name("Global\\", "alpha"),
            "Global\\Sharingway.alpha.Signal"
        );
        assert_eq!(
            registry_segment_name("Global\\"),
            "Global\\Sharingway.Registry"
        );
    }

    #[test]
    fn registry_sync_names_use_registry_base() {
        assert_eq!(
            mutex_name("Global\\", REGISTRY_BASE_NAME),
            "Global\\Sharingway.Registry.Lock"
        );
        assert_eq!(
            event_name("Global\\", REGISTRY_BASE_NAME),
            "Global\\Sharingway.Registry.Signal"
        );
    }

    #[test]
    fn shm_path_prepends_slash() {
        assert_eq!(
            shm_path("Global\\Sharingway.alpha").unwrap(),
            "/Global\\Sharingway.alpha"
        );
    }

    #[test]
    fn slash_and_empty_names_rejected() {
        assert!(shm_path("").is_err());
        assert!(shm_path("a/b").is_err());
    }

    #[test]
    fn prefix_stripping() {
        assert_eq!(
            strip_prefix("Global\\Sharingway.alpha", "Global\\").as_deref(),
            Some("Sharingway.alpha")
        );
        assert_eq!(strip_prefix("Sharingway.alpha", "Global\\"), None);
        assert_eq!(strip_prefix("Sharingway.alpha", ""), None);
    }
}
