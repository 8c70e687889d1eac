//! MDAI core: data model, error taxonomy, static registries and the progress bus.
//!
//! Everything here is shared by the provisioning, packaging and patching crates;
//! nothing in this crate talks to a cluster.

#![forbid(unsafe_code)]

pub mod error;
pub mod model;
pub mod progress;
pub mod registry;

pub use error::{MdaiError, MdaiResult};
pub use model::{
    ChartSpec, EngineRef, FilteredServices, Freshness, KubeTarget, OutdatedRow, PatchDocument, PatchOp,
    PatchOperation, Release, RepoEntry, TelemetryFilter,
};
pub use progress::{channel, Emitter, EventStream, LogProgress, Progress, ProgressEvent};
pub use registry::Registry;

/// Read an env tunable, falling back to `default` when unset or unparsable.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

pub mod prelude {
    pub use super::{ChartSpec, Emitter, MdaiError, MdaiResult, Progress, ProgressEvent, Registry, Release, RepoEntry};
}
