//! # Stack Orchestration
//!
//! Minimal multi-service lifecycle orchestration core. Declarative service
//! manifests are resolved into a dependency graph (including implicit
//! network-namespace edges), services sharing a network identity are
//! grouped under a single owner, volumes and environment are materialized,
//! and an external runtime is driven through start, readiness gating, and
//! reverse-order teardown. Ready services are published as scrape targets
//! for an external metrics collector.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stack_orchestration::{
//!     Manifest, Orchestrator, OrchestratorOptions, Runtime, ServiceSpec,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(runtime: Arc<dyn Runtime>) -> stack_orchestration::Result<()> {
//! let mut api = ServiceSpec::new("api", "homelab/api");
//! api.depends_on.push("db".to_string());
//! let db = ServiceSpec::new("db", "postgres:16");
//!
//! let manifest = Manifest::new("homelab", vec![db, api])?;
//! let orchestrator = Orchestrator::new(manifest, runtime, OrchestratorOptions::default())?;
//! let report = orchestrator.start().await?;
//! assert!(report.all_ready());
//! orchestrator.stop().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod graph;
mod health;
mod manifest;
mod materialize;
mod network;
mod orchestrator;
mod runtime;
mod scrape;
mod state;

pub use graph::DependencyGraph;
pub use health::HealthMonitor;
pub use manifest::{
    HealthCheck, Manifest, NetworkMode, PortBinding, Probe, ServiceSpec, VolumeBinding,
    VolumeMode,
};
pub use materialize::{MaterializedService, Materializer, ResolvedVolume, ServiceAddress};
pub use network::{NetworkGroup, NetworkGroups, NetworkIdentity};
pub use orchestrator::{CancellationToken, Orchestrator, OrchestratorOptions, StartReport};
pub use runtime::{ProbeOutcome, Runtime, RuntimeError, RuntimeHandle};
pub use scrape::{ScrapeRegistry, ScrapeTarget};
pub use state::{ServiceRuntime, ServiceStatus, StateEvent, StateStore};

#[cfg(any(test, feature = "test-utils"))]
pub use runtime::MockRuntime;

/// Error types for orchestration operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Malformed or contradictory manifest; nothing was started.
    #[error("invalid manifest: {0}")]
    Validation(String),

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// The offending cycle; first and last entries are the same service.
        cycle: Vec<String>,
    },

    /// A network-sharing chain is cyclic or points outside the manifest.
    #[error("invalid network target for service '{service}': {reason}")]
    InvalidNetworkTarget {
        /// Service whose declaration is at fault.
        service: String,
        /// Why the target is invalid.
        reason: String,
    },

    /// Two members of one network group publish the same host port.
    #[error("conflicting port binding {port} between '{first}' and '{second}'")]
    ConflictingPortBinding {
        /// The doubly published host port.
        port: u16,
        /// First service publishing it.
        first: String,
        /// Second service publishing it.
        second: String,
    },

    /// An environment placeholder could not be resolved.
    #[error("unresolved reference {placeholder} for service '{service}'")]
    UnresolvedReference {
        /// Service whose environment is being materialized.
        service: String,
        /// The placeholder as written.
        placeholder: String,
    },

    /// The external runtime failed to launch, terminate, or probe.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A service name is not part of this deployment.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Host-side I/O failed during materialization.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;
