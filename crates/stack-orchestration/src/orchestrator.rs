//! Dependency-driven lifecycle orchestration.
//!
//! One coordinating loop walks the dependency graph: services whose
//! dependencies are satisfied are launched concurrently, health-checked
//! services gate their dependents on readiness rather than mere start, and
//! failures are contained to their own branch of the graph. Teardown walks
//! the exact reverse order, so a dependency never vanishes while something
//! that depends on it is still running.

use crate::health::{HealthMonitor, with_timeout};
use crate::{
    DependencyGraph, Error, Manifest, MaterializedService, Materializer, NetworkGroups, Result,
    Runtime, RuntimeHandle, ScrapeRegistry, ScrapeTarget, ServiceRuntime, ServiceStatus,
    StateEvent, StateStore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunable orchestration parameters.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Directory relative volume paths resolve against.
    pub deployment_root: PathBuf,
    /// Grace period allowed per service before forced termination.
    pub stop_grace: Duration,
    /// Total launch attempts per service before declaring it failed.
    pub launch_attempts: u32,
    /// Base delay between launch attempts; backoff grows linearly.
    pub retry_backoff: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            deployment_root: PathBuf::from("."),
            stop_grace: Duration::from_secs(10),
            launch_attempts: 1,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Cooperative cancellation signal for an in-flight deployment start.
///
/// Once raised, no new services begin Starting; launches already in flight
/// finish their runtime call before teardown begins, so nothing ends up
/// running without tracked state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an unraised token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the signal has been raised.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Outcome of a deployment start.
///
/// Partial success is a valid end state; it is reported as-is rather than
/// collapsed into an overall success or failure.
#[derive(Debug, Clone)]
pub struct StartReport {
    /// Services that reached Ready, or Running with no health check.
    pub ready: Vec<String>,
    /// Services that terminally failed, with the originating error.
    pub failed: Vec<(String, String)>,
    /// Whether the start was interrupted by cancellation.
    pub cancelled: bool,
}

impl StartReport {
    /// True when every declared service came up.
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Drives start and stop of a deployment against an external runtime.
pub struct Orchestrator {
    manifest: Manifest,
    graph: DependencyGraph,
    groups: NetworkGroups,
    start_order: Vec<String>,
    runtime: Arc<dyn Runtime>,
    materializer: Materializer,
    state: StateStore,
    events: async_channel::Receiver<StateEvent>,
    scrape: ScrapeRegistry,
    monitor: HealthMonitor,
    handles: Arc<Mutex<HashMap<String, RuntimeHandle>>>,
    options: OrchestratorOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Validate the manifest's structure and prepare an orchestrator.
    ///
    /// Structural errors (cycles, invalid network targets, port conflicts)
    /// reject the whole deployment here, before any workload starts.
    pub fn new(
        manifest: Manifest,
        runtime: Arc<dyn Runtime>,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        let groups = NetworkGroups::resolve(&manifest)?;
        let graph = DependencyGraph::from_manifest(&manifest);
        let start_order = graph.topological_order()?;
        info!(
            "deployment '{}' start order: {:?}",
            manifest.name(),
            start_order
        );

        let (state, events) = StateStore::new();
        let scrape = ScrapeRegistry::new();
        let monitor = HealthMonitor::new(runtime.clone(), state.clone(), scrape.clone());
        let materializer = Materializer::new(options.deployment_root.clone());

        Ok(Self {
            manifest,
            graph,
            groups,
            start_order,
            runtime,
            materializer,
            state,
            events,
            scrape,
            monitor,
            handles: Arc::new(Mutex::new(HashMap::new())),
            options,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that interrupts an in-flight [`start`](Self::start).
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read-only snapshot of all service runtime records.
    pub fn status(&self) -> Vec<ServiceRuntime> {
        self.state.snapshot()
    }

    /// Current scrape targets for an external metrics collector.
    pub fn scrape_targets(&self) -> Vec<ScrapeTarget> {
        self.scrape.targets()
    }

    /// Start the deployment.
    ///
    /// Walks the dependency graph, launching mutually independent services
    /// concurrently. Returns once every service has settled: Ready, Running
    /// without a health check, or Failed. A failure halts only the failed
    /// service's dependents; unrelated branches keep starting. Re-running
    /// on an already-started deployment launches nothing new.
    pub async fn start(&self) -> Result<StartReport> {
        for name in &self.start_order {
            self.state.register(name);
        }

        let mut cancelled = false;
        loop {
            if self.cancel.is_cancelled() && !cancelled {
                cancelled = true;
                info!("start cancelled; no further services will be launched");
            }

            self.propagate_failures();
            if !cancelled {
                self.launch_eligible();
            }

            if self.all_settled(cancelled) {
                break;
            }

            // Wake on the next transition, or tick to re-check cancellation.
            let _ = with_timeout(self.events.recv(), Duration::from_millis(50)).await;
        }

        if cancelled {
            // Orderly teardown of everything that was launched.
            self.stop().await?;
        }

        let mut ready = Vec::new();
        let mut failed = Vec::new();
        for record in self.state.snapshot() {
            match record.status {
                ServiceStatus::Ready | ServiceStatus::Running | ServiceStatus::Degraded => {
                    ready.push(record.name)
                }
                ServiceStatus::Failed => {
                    let reason = record.error.unwrap_or_else(|| "unknown error".to_string());
                    warn!("service '{}' failed: {}", record.name, reason);
                    failed.push((record.name, reason));
                }
                _ => {}
            }
        }
        ready.sort_by_key(|name| {
            self.start_order
                .iter()
                .position(|n| n == name)
                .unwrap_or(usize::MAX)
        });
        Ok(StartReport {
            ready,
            failed,
            cancelled,
        })
    }

    /// Stop the deployment.
    ///
    /// Walks the reverse of the start order; a service is signaled only
    /// after everything depending on it has stopped. A service that fails
    /// to stop within the grace period is reported as a warning and
    /// teardown proceeds.
    pub async fn stop(&self) -> Result<()> {
        for name in self.start_order.iter().rev() {
            let handle = { self.handles.lock().unwrap().remove(name) };
            let Some(handle) = handle else {
                // Never launched, or already torn down.
                continue;
            };

            self.monitor.unwatch(name);
            self.scrape.retract(name);
            self.state.transition(name, ServiceStatus::Stopping);
            debug!("stopping service '{}'", name);

            let grace = self.options.stop_grace;
            match self.runtime.terminate(&handle, grace).await {
                Ok(()) => info!("service '{}' stopped", name),
                Err(e) => warn!(
                    "service '{}' did not stop cleanly within {:?}: {}",
                    name, grace, e
                ),
            }
            self.state.transition(name, ServiceStatus::Stopped);
        }
        Ok(())
    }

    /// Mark Pending services whose dependencies have terminally failed.
    fn propagate_failures(&self) {
        for name in &self.start_order {
            if self.state.status_of(name) != Some(ServiceStatus::Pending) {
                continue;
            }
            let failed_dep = self
                .graph
                .dependencies_of(name)
                .into_iter()
                .find(|dep| self.state.status_of(dep) == Some(ServiceStatus::Failed));
            if let Some(dep) = failed_dep {
                warn!(
                    "service '{}' will not start: dependency '{}' failed",
                    name, dep
                );
                self.state.transition_with_error(
                    name,
                    ServiceStatus::Failed,
                    Some(format!("dependency '{dep}' failed")),
                );
            }
        }
    }

    /// Launch every Pending service whose dependencies are satisfied.
    fn launch_eligible(&self) {
        for name in &self.start_order {
            if self.state.status_of(name) != Some(ServiceStatus::Pending) {
                continue;
            }
            let deps_satisfied = self.graph.dependencies_of(name).into_iter().all(|dep| {
                let has_check = self
                    .manifest
                    .get(dep)
                    .is_some_and(|s| s.health_check.is_some());
                self.state
                    .status_of(dep)
                    .is_some_and(|status| status.satisfies_dependents(has_check))
            });
            if deps_satisfied {
                self.spawn_launch(name);
            }
        }
    }

    /// Spawn the launch task for one service.
    fn spawn_launch(&self, name: &str) {
        let spec = self
            .manifest
            .get(name)
            .expect("start order only contains declared services")
            .clone();
        let owner = self
            .groups
            .owner_of(name)
            .unwrap_or(name)
            .to_string();
        let identity = self.groups.identity(name);
        let runtime = self.runtime.clone();
        let materializer = self.materializer.clone();
        let state = self.state.clone();
        let handles = self.handles.clone();
        let attempts = self.options.launch_attempts.max(1);
        let backoff = self.options.retry_backoff;
        let watcher = self.monitor.clone();

        state.transition(name, ServiceStatus::Starting);
        info!("starting service '{}'", spec.name);

        smol::spawn(async move {
            let materialized = match materializer.materialize(&spec, &owner) {
                Ok(m) => m,
                Err(e) => {
                    state.transition_with_error(
                        &spec.name,
                        ServiceStatus::Failed,
                        Some(e.to_string()),
                    );
                    return;
                }
            };

            match launch_with_retry(
                runtime.as_ref(),
                &spec,
                &materialized,
                identity,
                attempts,
                backoff,
                &state,
            )
            .await
            {
                Ok(handle) => {
                    handles
                        .lock()
                        .unwrap()
                        .insert(spec.name.clone(), handle.clone());
                    state.transition(&spec.name, ServiceStatus::Running);
                    info!("service '{}' is running", spec.name);
                    if let Some(check) = spec.health_check.clone() {
                        watcher.watch(handle, check, materialized.address.to_endpoint());
                    }
                }
                Err(e) => {
                    state.transition_with_error(
                        &spec.name,
                        ServiceStatus::Failed,
                        Some(e.to_string()),
                    );
                }
            }
        })
        .detach();
    }

    /// Whether every service has settled for the start phase.
    ///
    /// Under cancellation only in-flight Starting services are waited for;
    /// Pending ones will never launch.
    fn all_settled(&self, cancelled: bool) -> bool {
        self.start_order.iter().all(|name| {
            match self.state.status_of(name) {
                Some(ServiceStatus::Starting) => false,
                Some(ServiceStatus::Pending) => cancelled,
                Some(ServiceStatus::Running) => {
                    // Running settles only for services without a check;
                    // checked ones are still waiting on readiness.
                    cancelled
                        || self
                            .manifest
                            .get(name)
                            .is_none_or(|s| s.health_check.is_none())
                }
                Some(_) => true,
                None => true,
            }
        })
    }
}

/// Launch with bounded retry and linear backoff.
async fn launch_with_retry(
    runtime: &dyn Runtime,
    spec: &crate::ServiceSpec,
    materialized: &MaterializedService,
    identity: crate::NetworkIdentity,
    attempts: u32,
    backoff: Duration,
    state: &StateStore,
) -> Result<RuntimeHandle> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match runtime.launch(spec, materialized, identity.clone()).await {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                warn!(
                    "launch attempt {}/{} for service '{}' failed: {}",
                    attempt, attempts, spec.name, e
                );
                last_err = Some(e);
                if attempt < attempts {
                    state.record_restart(&spec.name);
                    smol::Timer::after(backoff * attempt).await;
                }
            }
        }
    }
    Err(Error::Runtime(last_err.expect("at least one attempt was made")))
}
