//! Runtime state tracking for a deployment.
//!
//! The [`StateStore`] is an explicit owned structure handed to the
//! orchestrator and health monitor rather than ambient global state, so
//! orchestration runs stay independently testable. Every transition is also
//! published on a bounded wake-up channel that the scheduling loop listens
//! on; the store itself remains the source of truth.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Lifecycle status of a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    /// Declared but not yet scheduled.
    Pending,
    /// Launch in flight at the runtime.
    Starting,
    /// Workload launched; not yet past its health check, if it has one.
    Running,
    /// Health check passed; dependents may start.
    Ready,
    /// Previously ready, now failing its health check.
    Degraded,
    /// Termination in flight.
    Stopping,
    /// Workload terminated.
    Stopped,
    /// Unrecoverable error while starting or running.
    Failed,
}

impl ServiceStatus {
    /// Whether this status unblocks dependents, given the service's
    /// health-check configuration. A service without a health check is
    /// terminally successful at Running; one with a check must reach Ready.
    pub fn satisfies_dependents(self, has_health_check: bool) -> bool {
        match self {
            ServiceStatus::Ready => true,
            ServiceStatus::Running => !has_health_check,
            // Degraded does not revoke an already-granted start.
            ServiceStatus::Degraded => true,
            _ => false,
        }
    }

    /// Terminal for the start phase: nothing more will happen without
    /// outside intervention.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ServiceStatus::Stopped | ServiceStatus::Failed
        )
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-service runtime record.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceRuntime {
    /// Service name.
    pub name: String,
    /// Current status.
    pub status: ServiceStatus,
    /// When the status last changed.
    pub last_transition: DateTime<Utc>,
    /// Launch attempts beyond the first.
    pub restart_count: u32,
    /// Originating error for Failed/Degraded states.
    pub error: Option<String>,
}

/// A status transition, published on the state-update channel.
#[derive(Debug, Clone)]
pub struct StateEvent {
    /// Service whose status changed.
    pub service: String,
    /// The new status.
    pub status: ServiceStatus,
}

/// Shared runtime state table for one deployment.
///
/// Writes take the table lock per call, so updates for different services
/// never tear; the structure is cheap to clone and share across tasks.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<RwLock<HashMap<String, ServiceRuntime>>>,
    events: async_channel::Sender<StateEvent>,
}

impl StateStore {
    /// Create a store plus the receiving end of its wake-up channel.
    ///
    /// The channel is bounded and lossy by design: a dropped event only
    /// delays a scheduler wake-up, it never loses state.
    pub fn new() -> (Self, async_channel::Receiver<StateEvent>) {
        let (tx, rx) = async_channel::bounded(64);
        (
            Self {
                inner: Arc::new(RwLock::new(HashMap::new())),
                events: tx,
            },
            rx,
        )
    }

    /// Register a service as Pending. Idempotent; an existing record
    /// is left untouched.
    pub fn register(&self, service: &str) {
        let mut table = self.inner.write().unwrap();
        table.entry(service.to_string()).or_insert_with(|| ServiceRuntime {
            name: service.to_string(),
            status: ServiceStatus::Pending,
            last_transition: Utc::now(),
            restart_count: 0,
            error: None,
        });
    }

    /// Move a service to a new status.
    pub fn transition(&self, service: &str, status: ServiceStatus) {
        self.transition_with_error(service, status, None);
    }

    /// Move a service to a new status, recording the originating error.
    pub fn transition_with_error(
        &self,
        service: &str,
        status: ServiceStatus,
        error: Option<String>,
    ) {
        {
            let mut table = self.inner.write().unwrap();
            let Some(record) = table.get_mut(service) else {
                return;
            };
            debug!("service '{}': {} -> {}", service, record.status, status);
            record.status = status;
            record.last_transition = Utc::now();
            record.error = error;
        }
        // Wake the scheduler; dropping the event on a full or closed
        // channel is fine, the loop re-reads the table.
        let _ = self.events.try_send(StateEvent {
            service: service.to_string(),
            status,
        });
    }

    /// Move a service to a new status only if its current status is one of
    /// `allowed`; returns whether the transition happened.
    ///
    /// The check and the write happen under one lock, so a transition
    /// decided against a stale status read cannot slip in.
    pub fn transition_if(
        &self,
        service: &str,
        allowed: &[ServiceStatus],
        status: ServiceStatus,
        error: Option<String>,
    ) -> bool {
        {
            let mut table = self.inner.write().unwrap();
            let Some(record) = table.get_mut(service) else {
                return false;
            };
            if !allowed.contains(&record.status) {
                return false;
            }
            debug!("service '{}': {} -> {}", service, record.status, status);
            record.status = status;
            record.last_transition = Utc::now();
            record.error = error;
        }
        let _ = self.events.try_send(StateEvent {
            service: service.to_string(),
            status,
        });
        true
    }

    /// Count a retried launch attempt.
    pub fn record_restart(&self, service: &str) {
        let mut table = self.inner.write().unwrap();
        if let Some(record) = table.get_mut(service) {
            record.restart_count += 1;
        }
    }

    /// Current status of a service, if registered.
    pub fn status_of(&self, service: &str) -> Option<ServiceStatus> {
        self.inner.read().unwrap().get(service).map(|r| r.status)
    }

    /// Read-only snapshot of all records, sorted by service name.
    pub fn snapshot(&self) -> Vec<ServiceRuntime> {
        let mut records: Vec<ServiceRuntime> =
            self.inner.read().unwrap().values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_transition() {
        let (store, rx) = StateStore::new();
        store.register("db");
        assert_eq!(store.status_of("db"), Some(ServiceStatus::Pending));

        store.transition("db", ServiceStatus::Starting);
        store.transition("db", ServiceStatus::Running);
        assert_eq!(store.status_of("db"), Some(ServiceStatus::Running));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.service, "db");
        assert_eq!(event.status, ServiceStatus::Starting);
    }

    #[test]
    fn register_is_idempotent() {
        let (store, _rx) = StateStore::new();
        store.register("api");
        store.transition("api", ServiceStatus::Ready);
        store.register("api");
        assert_eq!(store.status_of("api"), Some(ServiceStatus::Ready));
    }

    #[test]
    fn failed_records_the_error() {
        let (store, _rx) = StateStore::new();
        store.register("api");
        store.transition_with_error(
            "api",
            ServiceStatus::Failed,
            Some("launch refused".to_string()),
        );
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, ServiceStatus::Failed);
        assert_eq!(snapshot[0].error.as_deref(), Some("launch refused"));
    }

    #[test]
    fn guarded_transition_respects_current_status() {
        let (store, _rx) = StateStore::new();
        store.register("api");
        store.transition("api", ServiceStatus::Stopped);

        // A stale decision made while the service was still running must
        // not revive it.
        let moved = store.transition_if(
            "api",
            &[ServiceStatus::Running, ServiceStatus::Degraded],
            ServiceStatus::Ready,
            None,
        );
        assert!(!moved);
        assert_eq!(store.status_of("api"), Some(ServiceStatus::Stopped));

        store.transition("api", ServiceStatus::Running);
        assert!(store.transition_if(
            "api",
            &[ServiceStatus::Running],
            ServiceStatus::Ready,
            None,
        ));
        assert_eq!(store.status_of("api"), Some(ServiceStatus::Ready));
    }

    #[test]
    fn snapshot_serializes_for_status_reporting() {
        let (store, _rx) = StateStore::new();
        store.register("db");
        store.transition("db", ServiceStatus::Ready);

        let json = serde_json::to_value(store.snapshot()).unwrap();
        assert_eq!(json[0]["name"], "db");
        assert_eq!(json[0]["status"], "Ready");
    }

    #[test]
    fn dependency_satisfaction_rules() {
        assert!(ServiceStatus::Ready.satisfies_dependents(true));
        assert!(ServiceStatus::Running.satisfies_dependents(false));
        assert!(!ServiceStatus::Running.satisfies_dependents(true));
        assert!(!ServiceStatus::Starting.satisfies_dependents(false));
        assert!(ServiceStatus::Degraded.satisfies_dependents(true));
    }
}
