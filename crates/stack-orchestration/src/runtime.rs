//! Runtime collaborator interface.
//!
//! The orchestrator sequences and supervises opaque units of work; actually
//! creating them (image pull, process isolation, namespaces) is delegated to
//! an external runtime behind this trait.

use crate::{MaterializedService, NetworkIdentity, Probe, ServiceSpec};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Opaque handle to a launched workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    /// Runtime-assigned identifier.
    pub id: Uuid,
    /// Name of the service this handle belongs to.
    pub service: String,
}

/// Errors surfaced by the external runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The workload could not be launched.
    #[error("launch failed: {0}")]
    Launch(String),
    /// The workload could not be terminated.
    #[error("terminate failed: {0}")]
    Terminate(String),
    /// The probe could not be executed at all.
    #[error("probe failed: {0}")]
    Probe(String),
}

/// Result of one probe execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The probe succeeded.
    Success,
    /// The probe ran and reported the service unhealthy.
    Failure(String),
}

/// External capability that launches, terminates, and probes workloads.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Launch a workload with its materialized volumes and environment.
    ///
    /// For `NetworkIdentity::Join(owner)` the runtime must reuse the owner's
    /// network namespace instead of creating a new one.
    async fn launch(
        &self,
        spec: &ServiceSpec,
        materialized: &MaterializedService,
        network: NetworkIdentity,
    ) -> std::result::Result<RuntimeHandle, RuntimeError>;

    /// Terminate a workload, allowing `grace` before forced termination.
    async fn terminate(
        &self,
        handle: &RuntimeHandle,
        grace: Duration,
    ) -> std::result::Result<(), RuntimeError>;

    /// Execute one health probe against a workload.
    async fn probe(
        &self,
        handle: &RuntimeHandle,
        probe: &Probe,
    ) -> std::result::Result<ProbeOutcome, RuntimeError>;
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockRuntime;

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted probe behavior for one service.
    #[derive(Debug, Clone)]
    enum ProbePlan {
        AlwaysHealthy,
        AlwaysUnhealthy,
        /// Unhealthy for the first N probes, healthy afterwards.
        HealthyAfter(u32),
        /// Healthy and unhealthy on alternating probes.
        Alternating,
    }

    #[derive(Default)]
    struct MockState {
        launches: Vec<String>,
        terminations: Vec<String>,
        identities: HashMap<String, NetworkIdentity>,
        envs: HashMap<String, Vec<(String, String)>>,
        launch_failures: HashMap<String, u32>,
        launch_delays: HashMap<String, Duration>,
        terminate_failures: HashMap<String, bool>,
        probe_plans: HashMap<String, ProbePlan>,
        probe_delays: HashMap<String, Duration>,
        probe_counts: HashMap<String, u32>,
    }

    /// In-memory runtime recording every call, for orchestration tests.
    #[derive(Default)]
    pub struct MockRuntime {
        state: Mutex<MockState>,
    }

    impl MockRuntime {
        /// Create a mock with no scripted behavior; everything launches and
        /// probes healthy.
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `attempts` launches of a service. Use `u32::MAX`
        /// to fail every attempt.
        pub fn fail_launch(&self, service: &str, attempts: u32) {
            self.state
                .lock()
                .unwrap()
                .launch_failures
                .insert(service.to_string(), attempts);
        }

        /// Make launches of a service take `delay` before succeeding.
        pub fn delay_launch(&self, service: &str, delay: Duration) {
            self.state
                .lock()
                .unwrap()
                .launch_delays
                .insert(service.to_string(), delay);
        }

        /// Make probes of a service take `delay` before answering.
        pub fn delay_probe(&self, service: &str, delay: Duration) {
            self.state
                .lock()
                .unwrap()
                .probe_delays
                .insert(service.to_string(), delay);
        }

        /// Make termination of a service report an error.
        pub fn fail_terminate(&self, service: &str) {
            self.state
                .lock()
                .unwrap()
                .terminate_failures
                .insert(service.to_string(), true);
        }

        /// Script a service's probes to always fail.
        pub fn probe_always_unhealthy(&self, service: &str) {
            self.state
                .lock()
                .unwrap()
                .probe_plans
                .insert(service.to_string(), ProbePlan::AlwaysUnhealthy);
        }

        /// Script a service's probes to alternate success and failure.
        pub fn probe_flaky(&self, service: &str) {
            self.state
                .lock()
                .unwrap()
                .probe_plans
                .insert(service.to_string(), ProbePlan::Alternating);
        }

        /// Script a service's probes to fail `n` times, then succeed.
        pub fn probe_healthy_after(&self, service: &str, n: u32) {
            self.state
                .lock()
                .unwrap()
                .probe_plans
                .insert(service.to_string(), ProbePlan::HealthyAfter(n));
        }

        /// Services in the order their launches succeeded.
        pub fn launch_order(&self) -> Vec<String> {
            self.state.lock().unwrap().launches.clone()
        }

        /// Number of successful launches for one service.
        pub fn launch_count(&self, service: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .launches
                .iter()
                .filter(|s| s.as_str() == service)
                .count()
        }

        /// Services in the order they were terminated.
        pub fn termination_order(&self) -> Vec<String> {
            self.state.lock().unwrap().terminations.clone()
        }

        /// Network identity a service was launched with.
        pub fn identity_of(&self, service: &str) -> Option<NetworkIdentity> {
            self.state.lock().unwrap().identities.get(service).cloned()
        }

        /// Environment a service was launched with.
        pub fn env_of(&self, service: &str) -> Option<Vec<(String, String)>> {
            self.state.lock().unwrap().envs.get(service).cloned()
        }

        /// Total probes executed against one service.
        pub fn probe_count(&self, service: &str) -> u32 {
            self.state
                .lock()
                .unwrap()
                .probe_counts
                .get(service)
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl Runtime for MockRuntime {
        async fn launch(
            &self,
            spec: &ServiceSpec,
            materialized: &MaterializedService,
            network: NetworkIdentity,
        ) -> std::result::Result<RuntimeHandle, RuntimeError> {
            let delay = self
                .state
                .lock()
                .unwrap()
                .launch_delays
                .get(&spec.name)
                .copied();
            if let Some(delay) = delay {
                smol::Timer::after(delay).await;
            }
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.launch_failures.get_mut(&spec.name) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(RuntimeError::Launch(format!(
                        "scripted launch failure for '{}'",
                        spec.name
                    )));
                }
            }
            state.launches.push(spec.name.clone());
            state.identities.insert(spec.name.clone(), network);
            state.envs.insert(
                spec.name.clone(),
                materialized
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            );
            Ok(RuntimeHandle {
                id: Uuid::new_v4(),
                service: spec.name.clone(),
            })
        }

        async fn terminate(
            &self,
            handle: &RuntimeHandle,
            _grace: Duration,
        ) -> std::result::Result<(), RuntimeError> {
            let mut state = self.state.lock().unwrap();
            state.terminations.push(handle.service.clone());
            if state
                .terminate_failures
                .get(&handle.service)
                .copied()
                .unwrap_or(false)
            {
                return Err(RuntimeError::Terminate(format!(
                    "scripted terminate failure for '{}'",
                    handle.service
                )));
            }
            Ok(())
        }

        async fn probe(
            &self,
            handle: &RuntimeHandle,
            _probe: &Probe,
        ) -> std::result::Result<ProbeOutcome, RuntimeError> {
            let delay = self
                .state
                .lock()
                .unwrap()
                .probe_delays
                .get(&handle.service)
                .copied();
            if let Some(delay) = delay {
                smol::Timer::after(delay).await;
            }
            let mut state = self.state.lock().unwrap();
            let count = state
                .probe_counts
                .entry(handle.service.clone())
                .and_modify(|c| *c += 1)
                .or_insert(1);
            let count = *count;
            let plan = state
                .probe_plans
                .get(&handle.service)
                .cloned()
                .unwrap_or(ProbePlan::AlwaysHealthy);
            let outcome = match plan {
                ProbePlan::AlwaysHealthy => ProbeOutcome::Success,
                ProbePlan::AlwaysUnhealthy => {
                    ProbeOutcome::Failure("scripted unhealthy".to_string())
                }
                ProbePlan::HealthyAfter(n) if count > n => ProbeOutcome::Success,
                ProbePlan::HealthyAfter(_) => {
                    ProbeOutcome::Failure("not yet healthy".to_string())
                }
                ProbePlan::Alternating if count % 2 == 1 => ProbeOutcome::Success,
                ProbePlan::Alternating => ProbeOutcome::Failure("flapping".to_string()),
            };
            Ok(outcome)
        }
    }
}
