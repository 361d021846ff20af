//! # Stack Configuration
//!
//! YAML front end for stack-orchestration.
//!
//! Parses declarative `stack.yaml` files and converts them into the
//! orchestrator's [`Manifest`](stack_orchestration::Manifest) model. A
//! malformed file is rejected wholesale, before anything starts.

#![warn(missing_docs)]

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod parser;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse YAML
    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// The converted manifest was rejected by the orchestration core
    #[error(transparent)]
    ManifestError(#[from] stack_orchestration::Error),
}

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration structure, one `stack.yaml` file.
///
/// Service declaration order is significant: it breaks ties in the start
/// order, so services are kept in an ordered map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Configuration schema version
    pub version: String,

    /// Deployment name
    pub name: String,

    /// Service definitions, keyed by service name
    pub services: IndexMap<String, Service>,
}

/// Service definition
///
/// Unknown keys are rejected rather than silently ignored, so a typo in a
/// field name cannot quietly drop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Service {
    /// Workload image reference
    pub image: String,

    /// Service dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Network mode: absent for an own namespace, or `service:<name>` to
    /// join another service's namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    /// Published ports
    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Volume mounts, `host:container[:ro|rw]` form
    #[serde(default)]
    pub volumes: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: IndexMap<String, String>,

    /// Optional health check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

/// Port mapping notation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortMapping {
    /// Simple port number (same port on host and container)
    Simple(u16),
    /// Full mapping "host:container"
    Full(String),
}

/// Health check configuration
///
/// Exactly one of `http` or `command` must be set. Intervals and
/// thresholds carry no defaults; the orchestrator treats them as
/// deliberate operator input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheck {
    /// URL for an HTTP probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<String>,

    /// Inclusive acceptable status range for an HTTP probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_status: Option<(u16, u16)>,

    /// Command for an exec probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments for an exec probe
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Check interval in seconds
    pub interval: u64,

    /// Timeout per check in seconds
    pub timeout: u64,

    /// Consecutive successes required to become ready
    pub success_threshold: u32,

    /// Consecutive failures before degrading or failing
    pub failure_threshold: u32,
}
