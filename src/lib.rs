//! # Sharingway - Local-Host Shared-Memory Publish/Subscribe Fabric
//!
//! Sharingway lets independent processes on one machine publish and consume
//! named JSON data streams through shared memory. Each *provider* owns a
//! fixed-size segment holding a single current value; *subscribers* attach
//! to any number of providers by name and receive every fresh frame through
//! background watchers. A global *registry* segment catalogues the live
//! providers, their capabilities, and their liveness.
//!
//! ## Features
//!
//! - **Named shared segments**: length-prefixed JSON frames, overwrite-only
//! - **Cross-process lock/signal pairs**: robust named mutex for exclusion,
//!   named event for edge-triggered change notification
//! - **Global registry**: lazily formatted roster with change watching and
//!   a caller-driven staleness sweep
//! - **Cross-language wire contract**: object names, frame layout, and the
//!   registry document format are the whole interop surface
//! - **Bounded shutdown**: every background wait carries a timeout
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ publish  ┌──────────────────────────┐  watch ┌────────────┐
//! │  Provider  ├─────────>│ segment + lock/signal    ├───────>│ Subscriber │
//! └─────┬──────┘          │ (one per provider name)  │        └─────┬──────┘
//!       │ register        └──────────────────────────┘              │ discover
//!       ▼                                                           ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │        registry segment + lock/signal  ("Sharingway.Registry")       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use sharingway::{Provider, Subscriber};
//!
//! # fn main() -> sharingway::Result<()> {
//! let mut subscriber = Subscriber::new();
//! subscriber.set_data_handler(|provider, value| {
//!     println!("{provider}: {value}");
//! });
//! subscriber.initialize()?;
//! subscriber.subscribe("telemetry")?;
//!
//! let mut provider = Provider::new("telemetry", "engine telemetry", &[]);
//! provider.initialize(None)?;
//! provider.publish(&serde_json::json!({ "rpm": 7200 }))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod names;
pub mod provider;
pub mod registry;
pub mod segment;
pub mod subscriber;
pub mod sync;

pub use config::{FabricConfig, PrefixFallback, DEFAULT_SEGMENT_SIZE};
pub use error::{FabricError, Result};
pub use provider::Provider;
pub use registry::{ProviderDescriptor, ProviderStatus, Registry};
pub use segment::{SharedSegment, FRAME_HEADER_LEN};
pub use subscriber::{DataHandler, MembershipHandler, Subscriber};
pub use sync::{Acquired, LockSignalPair, NamedEvent, NamedMutex};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Seed the registry before any other participant touches it
///
/// Optional: every registry handle formats lazily on open. Calling this once
/// at host startup just front-loads the work.
pub fn ensure_registry_initialized(config: &FabricConfig) -> Result<()> {
    let registry = Registry::open(config)?;
    registry.initialize()
}

/// Remove a provider's kernel objects from the namespace
///
/// Shared-memory names outlive their holders, so a crashed provider leaves
/// its objects behind. Hosts call this during cleanup (or before recreating
/// a channel) to drop the names in both the privileged and session scopes.
/// Best effort: absent names are ignored.
pub fn purge_provider_objects(config: &FabricConfig, provider: &str) {
    for prefix in [config.privileged_prefix.as_str(), ""] {
        segment::unlink_object(&names::segment_name(prefix, provider));
        segment::unlink_object(&names::mutex_name(prefix, provider));
        segment::unlink_object(&names::event_name(prefix, provider));
    }
}

/// Remove the registry's kernel objects from the namespace
///
/// Only sensible when no fabric participant is running; the next registry
/// handle recreates and formats fresh objects.
pub fn purge_registry_objects(config: &FabricConfig) {
    purge_provider_objects(config, names::REGISTRY_BASE_NAME);
}
