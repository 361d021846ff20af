//! Health and readiness monitoring.
//!
//! Every service with a declared health check gets one periodic probe task
//! once it reaches Running. Probe results drive the Running→Ready,
//! Ready→Degraded and never-ready→Failed transitions, and maintain the
//! scrape-target list consumed by an external metrics collector.

use crate::{
    HealthCheck, Runtime, RuntimeHandle, ScrapeRegistry, ServiceStatus, StateStore,
};
use crate::runtime::ProbeOutcome;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run a future against a deadline, `None` on expiry.
pub(crate) async fn with_timeout<F: Future>(fut: F, timeout: Duration) -> Option<F::Output> {
    smol::future::or(async { Some(fut.await) }, async {
        smol::Timer::after(timeout).await;
        None
    })
    .await
}

/// Spawns and supervises probe tasks for monitored services.
///
/// Cheap to clone; clones share the same watch set.
#[derive(Clone)]
pub struct HealthMonitor {
    runtime: Arc<dyn Runtime>,
    state: StateStore,
    scrape: ScrapeRegistry,
    watched: Arc<Mutex<HashSet<String>>>,
}

impl HealthMonitor {
    /// Create a monitor writing into the given state store and registry.
    pub fn new(runtime: Arc<dyn Runtime>, state: StateStore, scrape: ScrapeRegistry) -> Self {
        Self {
            runtime,
            state,
            scrape,
            watched: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Begin periodic probing of a Running service.
    ///
    /// `address` is the endpoint published as a scrape target once the
    /// service becomes Ready.
    pub fn watch(&self, handle: RuntimeHandle, check: HealthCheck, address: String) {
        let service = handle.service.clone();
        if !self.watched.lock().unwrap().insert(service.clone()) {
            debug!("service '{}' is already monitored", service);
            return;
        }
        info!(
            "health monitoring started for service '{}' (interval {}s)",
            service, check.interval
        );

        let runtime = self.runtime.clone();
        let state = self.state.clone();
        let scrape = self.scrape.clone();
        let watched = self.watched.clone();
        smol::spawn(async move {
            probe_loop(service, handle, check, address, runtime, state, scrape, watched).await;
        })
        .detach();
    }

    /// Stop probing a service; its task exits on the next iteration.
    pub fn unwatch(&self, service: &str) {
        if self.watched.lock().unwrap().remove(service) {
            debug!("health monitoring stopped for service '{}'", service);
        }
    }

    /// Whether a service is currently monitored.
    pub fn is_watching(&self, service: &str) -> bool {
        self.watched.lock().unwrap().contains(service)
    }
}

#[allow(clippy::too_many_arguments)]
async fn probe_loop(
    service: String,
    handle: RuntimeHandle,
    check: HealthCheck,
    address: String,
    runtime: Arc<dyn Runtime>,
    state: StateStore,
    scrape: ScrapeRegistry,
    watched: Arc<Mutex<HashSet<String>>>,
) {
    // A zero interval would re-arm the timer without ever yielding and
    // starve the executor, so probing is floored to a small tick.
    let interval = Duration::from_secs(check.interval).max(Duration::from_millis(10));
    let timeout = Duration::from_secs(check.timeout);
    let mut successes = 0u32;
    let mut failures = 0u32;
    let mut startup_failures = 0u32;
    let mut ever_ready = false;

    loop {
        if !watched.lock().unwrap().contains(&service) {
            break;
        }
        match state.status_of(&service) {
            Some(ServiceStatus::Running | ServiceStatus::Ready | ServiceStatus::Degraded) => {}
            _ => break,
        }

        let outcome = match with_timeout(runtime.probe(&handle, &check.probe), timeout).await {
            Some(Ok(ProbeOutcome::Success)) => Ok(()),
            Some(Ok(ProbeOutcome::Failure(reason))) => Err(reason),
            Some(Err(e)) => Err(e.to_string()),
            None => Err(format!("probe timed out after {}s", check.timeout)),
        };

        // Transitions are guarded against the current status: a probe that
        // was in flight while the service was stopped must not revive it.
        match outcome {
            Ok(()) => {
                failures = 0;
                successes += 1;
                if successes >= check.success_threshold
                    && state.transition_if(
                        &service,
                        &[ServiceStatus::Running, ServiceStatus::Degraded],
                        ServiceStatus::Ready,
                        None,
                    )
                {
                    info!("service '{}' is ready", service);
                    ever_ready = true;
                    scrape.publish(&service, &address);
                }
            }
            Err(reason) => {
                successes = 0;
                failures += 1;
                debug!(
                    "probe failure {}/{} for service '{}': {}",
                    failures, check.failure_threshold, service, reason
                );
                if ever_ready {
                    if failures >= check.failure_threshold
                        && state.transition_if(
                            &service,
                            &[ServiceStatus::Ready],
                            ServiceStatus::Degraded,
                            Some(reason.clone()),
                        )
                    {
                        warn!("service '{}' degraded: {}", service, reason);
                        scrape.retract(&service);
                    }
                } else {
                    // Before first readiness every failure counts, whether
                    // consecutive or not, so a flapping probe still reaches
                    // a verdict within the threshold.
                    startup_failures += 1;
                    if startup_failures >= check.failure_threshold {
                        warn!(
                            "service '{}' never became healthy, marking failed: {}",
                            service, reason
                        );
                        state.transition_if(
                            &service,
                            &[ServiceStatus::Running],
                            ServiceStatus::Failed,
                            Some(reason),
                        );
                        watched.lock().unwrap().remove(&service);
                        break;
                    }
                }
            }
        }

        smol::Timer::after(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockRuntime, Probe};
    use uuid::Uuid;

    fn check(success_threshold: u32, failure_threshold: u32) -> HealthCheck {
        HealthCheck {
            probe: Probe::Command {
                command: "true".to_string(),
                args: vec![],
            },
            interval: 0,
            timeout: 5,
            success_threshold,
            failure_threshold,
        }
    }

    fn handle(service: &str) -> RuntimeHandle {
        RuntimeHandle {
            id: Uuid::new_v4(),
            service: service.to_string(),
        }
    }

    async fn wait_for_status(state: &StateStore, service: &str, status: ServiceStatus) {
        for _ in 0..200 {
            if state.status_of(service) == Some(status) {
                return;
            }
            smol::Timer::after(Duration::from_millis(10)).await;
        }
        panic!(
            "service '{}' never reached {:?}, currently {:?}",
            service,
            status,
            state.status_of(service)
        );
    }

    #[smol_potat::test]
    async fn running_becomes_ready_and_publishes_target() {
        let runtime = Arc::new(MockRuntime::new());
        let (state, _rx) = StateStore::new();
        let scrape = ScrapeRegistry::default();
        let monitor = HealthMonitor::new(runtime, state.clone(), scrape.clone());

        state.register("api");
        state.transition("api", ServiceStatus::Running);
        monitor.watch(handle("api"), check(2, 3), "api:5000".to_string());

        wait_for_status(&state, "api", ServiceStatus::Ready).await;
        let targets = scrape.targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].service, "api");
        assert_eq!(targets[0].address, "api:5000");

        monitor.unwatch("api");
    }

    #[smol_potat::test]
    async fn never_healthy_becomes_failed_without_target() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.probe_always_unhealthy("api");
        let (state, _rx) = StateStore::new();
        let scrape = ScrapeRegistry::default();
        let monitor = HealthMonitor::new(runtime.clone(), state.clone(), scrape.clone());

        state.register("api");
        state.transition("api", ServiceStatus::Running);
        monitor.watch(handle("api"), check(1, 3), "api:5000".to_string());

        wait_for_status(&state, "api", ServiceStatus::Failed).await;
        assert!(scrape.targets().is_empty());
        assert!(runtime.probe_count("api") >= 3);
        assert!(!monitor.is_watching("api"));
    }

    #[smol_potat::test]
    async fn flapping_probe_reaches_a_failed_verdict() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.probe_flaky("api");
        let (state, _rx) = StateStore::new();
        let scrape = ScrapeRegistry::default();
        let monitor = HealthMonitor::new(runtime.clone(), state.clone(), scrape.clone());

        state.register("api");
        state.transition("api", ServiceStatus::Running);
        // Needs two consecutive successes; the alternating probe never
        // delivers them, and its failures must still add up to a verdict.
        monitor.watch(handle("api"), check(2, 3), "api:5000".to_string());

        wait_for_status(&state, "api", ServiceStatus::Failed).await;
        assert!(scrape.targets().is_empty());
        assert!(!monitor.is_watching("api"));
    }

    #[smol_potat::test]
    async fn stale_probe_cannot_revive_a_stopped_service() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.delay_probe("api", Duration::from_millis(200));
        let (state, _rx) = StateStore::new();
        let scrape = ScrapeRegistry::default();
        let monitor = HealthMonitor::new(runtime.clone(), state.clone(), scrape.clone());

        state.register("api");
        state.transition("api", ServiceStatus::Running);
        monitor.watch(handle("api"), check(1, 3), "api:5000".to_string());

        // Stop the service while its first probe is still in flight.
        smol::Timer::after(Duration::from_millis(50)).await;
        monitor.unwatch("api");
        state.transition("api", ServiceStatus::Stopping);
        state.transition("api", ServiceStatus::Stopped);

        // Let the in-flight probe come back successful.
        smol::Timer::after(Duration::from_millis(400)).await;
        assert_eq!(state.status_of("api"), Some(ServiceStatus::Stopped));
        assert!(scrape.targets().is_empty());
    }

    #[smol_potat::test]
    async fn ready_service_degrades_and_recovers() {
        let runtime = Arc::new(MockRuntime::new());
        let (state, _rx) = StateStore::new();
        let scrape = ScrapeRegistry::default();
        let monitor = HealthMonitor::new(runtime.clone(), state.clone(), scrape.clone());

        state.register("api");
        state.transition("api", ServiceStatus::Running);
        monitor.watch(handle("api"), check(1, 2), "api:5000".to_string());
        wait_for_status(&state, "api", ServiceStatus::Ready).await;

        // Flip probes to failing; target must be retracted on degradation.
        runtime.probe_always_unhealthy("api");
        wait_for_status(&state, "api", ServiceStatus::Degraded).await;
        assert!(scrape.targets().is_empty());

        // And back to healthy; readiness and the target return.
        runtime.probe_healthy_after("api", 0);
        wait_for_status(&state, "api", ServiceStatus::Ready).await;
        assert_eq!(scrape.targets().len(), 1);

        monitor.unwatch("api");
    }
}
