//! Workspace facade crate.
//!
//! Re-exports the engine together with the optional native bridges and
//! provider connectors, so host applications can depend on
//! `catalog-sync-workspace` and pick what they need with features.

pub use bridge_traits;
pub use core_runtime;
pub use core_sync;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;

#[cfg(feature = "boundless")]
pub use provider_boundless;

#[cfg(feature = "overdrive")]
pub use provider_overdrive;
