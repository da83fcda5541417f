//! # Tether Core
//!
//! Deterministic lifecycle management for resources that live outside normal
//! memory management: memory-mapped regions, off-heap value cells, sockets.
//!
//! - **Closeable**: idempotent close with a tri-state cell and quiet batch close
//! - **Reference counting**: reserve/release with exactly-once release at zero
//! - **Tracing**: creation sites, per-owner reservations and event history,
//!   selected once per process by configuration
//! - **Leak registry**: weak tracking of tracing resources, sweeps that report
//!   resources dropped without release, teardown force-release
//! - **Unmonitor**: bounded walk removing owned resources from tracking
//! - **Off-heap values**: atomic cells in mapped memory, including a two-word
//!   cell with consistent pair reads
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          TETHER CORE                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │    values    │──▶│    region    │──▶│  lifecycle   │      │
//! │  │ (values.rs)  │   │ (region.rs)  │   │              │      │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘      │
//! │                                               ▼              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │  unmonitor   │──▶│     leak     │◀──│    tracer    │      │
//! │  │(unmonitor.rs)│   │  (leak.rs)   │   │ (tracer.rs)  │      │
//! │  └──────────────┘   └──────┬───────┘   └──────┬───────┘      │
//! │                            ▼                  ▼              │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐      │
//! │  │   watchdog   │   │  closeable   │   │  reference   │      │
//! │  └──────────────┘   └──────────────┘   └──────────────┘      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tether_core::{Closeable, LongValue, MappedRegion, ReferenceCounted, ReferenceOwner};
//!
//! let region = MappedRegion::anonymous(4096)?;
//! let counter = region.long_value(0)?;
//! counter.add_atomic_value(1)?;
//!
//! let reader = ReferenceOwner::temporary("reader");
//! counter.reserve(reader)?;
//! counter.close()?;
//! assert_eq!(counter.get_volatile_value()?, 1);
//! counter.release(reader)?;
//! assert!(counter.get_value().is_err());
//! # Ok::<(), tether_core::ResourceError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod closeable;
pub mod config;
pub mod error;
pub mod leak;
mod lifecycle;
pub mod reference;
pub mod region;
pub mod stack_trace;
pub mod tracer;
pub mod unmonitor;
pub mod values;
pub mod watchdog;

use std::sync::OnceLock;

// Re-exports
pub use closeable::{
    CloseCell, CloseQuietly, CloseState, Closeable, QueryCloseable, close_and_clear,
    is_closed_io_error,
};
pub use config::{ConfigError, TetherConfig, TetherConfigBuilder};
pub use error::{ResourceError, ResourceResult};
pub use leak::{LeakRegistry, LeakReport, MonitorId, RegistryStats, SweepReport, registry};
pub use reference::{
    ReferenceChangeListener, ReferenceCounted, ReferenceCountedTracer, ReferenceOwner,
};
pub use region::MappedRegion;
pub use stack_trace::StackTrace;
pub use tracer::{
    TracerFactory, TracingReferenceCounted, VanillaReferenceCounted, for_type, on_released,
};
pub use unmonitor::{Field, OwnedResources, UnmonitorReport, unmonitor, unmonitor_to_depth};
pub use values::{
    DoubleValue, IntValue, LongValue, NativeDoubleValue, NativeIntValue, NativeLongValue,
    NativeTwoLongValue, TwoLongValue,
};
pub use watchdog::LeakWatchdog;

/// Process-wide configuration, fixed on first use.
static CONFIG: OnceLock<TetherConfig> = OnceLock::new();

/// Install the process-wide configuration.
///
/// Fails with [`ConfigError::AlreadyInitialized`] if a configuration was
/// already installed or already read by [`config`].
pub fn init(config: TetherConfig) -> Result<(), ConfigError> {
    config.validate()?;
    CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    tracing::debug!(
        target: "tether::refcount",
        resource_tracing = is_resource_tracing(),
        "tether configured"
    );
    Ok(())
}

/// Install the configuration read from `TETHER_*` environment variables.
///
/// See [`TetherConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Result<(), ConfigError> {
    init(TetherConfig::from_env())
}

/// The process-wide configuration, read from the environment on first use if
/// [`init`] was never called.
pub fn config() -> &'static TetherConfig {
    CONFIG.get_or_init(TetherConfig::from_env)
}

/// Whether new reference counts are tracing.
pub fn is_resource_tracing() -> bool {
    config().tracing.enabled
}
