//! Scrape-target publication for an external metrics collector.
//!
//! Targets are published when a service first becomes Ready and retracted
//! whenever it leaves the Running/Ready states. The list itself is a
//! read-only snapshot; storage and visualization are out of scope.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tracing::info;

/// One address an external metrics collector should poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeTarget {
    /// Owning service name.
    pub service: String,
    /// Endpoint to scrape, `host:port` form.
    pub address: String,
    /// When the target was first published.
    pub discovered_at: DateTime<Utc>,
}

/// Shared list of live scrape targets.
#[derive(Clone, Default)]
pub struct ScrapeRegistry {
    inner: Arc<RwLock<Vec<ScrapeTarget>>>,
}

impl ScrapeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a target for a ready service. Re-publishing replaces the
    /// existing entry and refreshes its discovery timestamp.
    pub fn publish(&self, service: &str, address: &str) {
        let mut targets = self.inner.write().unwrap();
        targets.retain(|t| t.service != service);
        targets.push(ScrapeTarget {
            service: service.to_string(),
            address: address.to_string(),
            discovered_at: Utc::now(),
        });
        info!("scrape target published: {} at {}", service, address);
    }

    /// Remove a service's target, if present.
    pub fn retract(&self, service: &str) {
        let mut targets = self.inner.write().unwrap();
        let before = targets.len();
        targets.retain(|t| t.service != service);
        if targets.len() != before {
            info!("scrape target retracted: {}", service);
        }
    }

    /// Snapshot of the current target list.
    pub fn targets(&self) -> Vec<ScrapeTarget> {
        self.inner.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_replace_retract() {
        let registry = ScrapeRegistry::new();
        registry.publish("api", "api:5000");
        registry.publish("db", "db:5432");
        assert_eq!(registry.targets().len(), 2);

        // Re-publication replaces rather than duplicates.
        registry.publish("api", "api:5001");
        let targets = registry.targets();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().any(|t| t.service == "api" && t.address == "api:5001"));

        registry.retract("api");
        assert_eq!(registry.targets().len(), 1);
        registry.retract("api");
        assert_eq!(registry.targets().len(), 1);
    }
}
