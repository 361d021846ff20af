//! Typed manifest model for declared services.
//!
//! The manifest is constructed once per deployment invocation and validated
//! wholesale: if any service definition is malformed the entire set is
//! rejected before anything starts.

use crate::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Immutable, validated collection of service definitions.
///
/// Services keep their declaration order, which the scheduler uses to break
/// ties when producing a start sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    name: String,
    services: IndexMap<String, ServiceSpec>,
}

impl Manifest {
    /// Validate a set of service definitions and build the manifest.
    ///
    /// Rejects duplicate names, dangling `depends_on` references, and
    /// self-referential or dangling network-sharing targets.
    pub fn new(name: impl Into<String>, specs: Vec<ServiceSpec>) -> Result<Self> {
        let mut services = IndexMap::with_capacity(specs.len());

        for spec in specs {
            if spec.name.is_empty() {
                return Err(Error::Validation("service with empty name".to_string()));
            }
            if services.contains_key(&spec.name) {
                return Err(Error::Validation(format!(
                    "duplicate service name '{}'",
                    spec.name
                )));
            }
            services.insert(spec.name.clone(), spec);
        }

        for (name, spec) in &services {
            for dep in &spec.depends_on {
                if !services.contains_key(dep) {
                    return Err(Error::Validation(format!(
                        "service '{name}' depends on unknown service '{dep}'"
                    )));
                }
            }
            if let NetworkMode::Service(target) = &spec.network_mode {
                if target == name {
                    return Err(Error::Validation(format!(
                        "service '{name}' shares its own network namespace"
                    )));
                }
                if !services.contains_key(target) {
                    return Err(Error::Validation(format!(
                        "service '{name}' shares network with unknown service '{target}'"
                    )));
                }
            }
            if let Some(check) = &spec.health_check {
                if check.success_threshold == 0 || check.failure_threshold == 0 {
                    return Err(Error::Validation(format!(
                        "service '{name}' health check thresholds must be positive"
                    )));
                }
            }
        }

        Ok(Self {
            name: name.into(),
            services,
        })
    }

    /// Deployment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Services in declaration order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.values()
    }

    /// Service names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Number of declared services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the manifest declares no services.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// One declared unit of work: a workload reference plus its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique service name.
    pub name: String,
    /// Opaque workload reference handed to the runtime (e.g. an image).
    pub image: String,
    /// Names of services this one depends on, in declared order.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Network namespace behavior.
    #[serde(default)]
    pub network_mode: NetworkMode,
    /// Published port bindings.
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    /// Bind mounts, host path to container path.
    #[serde(default)]
    pub volumes: Vec<VolumeBinding>,
    /// Environment values, possibly containing `${...}` references.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Optional readiness probe configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
}

impl ServiceSpec {
    /// Create a minimal spec with just a name and workload reference.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            depends_on: Vec::new(),
            network_mode: NetworkMode::Own,
            ports: Vec::new(),
            volumes: Vec::new(),
            env: IndexMap::new(),
            health_check: None,
        }
    }
}

/// Network namespace behavior of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkMode {
    /// The service gets its own network identity.
    #[default]
    Own,
    /// The service joins the named service's network namespace.
    Service(String),
}

/// A published port binding, host port to container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port published on the host.
    pub host: u16,
    /// Port the workload listens on.
    pub container: u16,
}

impl FromStr for PortBinding {
    type Err = Error;

    /// Parse `"8080:80"` or the shorthand `"8080"` (same port both sides).
    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::Validation(format!("malformed port binding '{s}'"));
        match s.split_once(':') {
            Some((host, container)) => Ok(Self {
                host: host.parse().map_err(|_| malformed())?,
                container: container.parse().map_err(|_| malformed())?,
            }),
            None => {
                let port: u16 = s.parse().map_err(|_| malformed())?;
                Ok(Self {
                    host: port,
                    container: port,
                })
            }
        }
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VolumeMode {
    /// Mounted read-write.
    #[default]
    ReadWrite,
    /// Mounted read-only.
    ReadOnly,
}

/// A bind mount from a host path into the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    /// Host-side path, absolute or relative to the deployment root.
    pub host: String,
    /// Mount point inside the workload.
    pub container: String,
    /// Access mode.
    #[serde(default)]
    pub mode: VolumeMode,
}

impl FromStr for VolumeBinding {
    type Err = Error;

    /// Parse `"host:container"` or `"host:container:ro"`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (host, container, mode) = match parts.as_slice() {
            [host, container] => (host, container, VolumeMode::ReadWrite),
            [host, container, "ro"] => (host, container, VolumeMode::ReadOnly),
            [host, container, "rw"] => (host, container, VolumeMode::ReadWrite),
            _ => {
                return Err(Error::Validation(format!("malformed volume binding '{s}'")));
            }
        };
        if host.is_empty() || container.is_empty() {
            return Err(Error::Validation(format!("malformed volume binding '{s}'")));
        }
        Ok(Self {
            host: host.to_string(),
            container: container.to_string(),
            mode,
        })
    }
}

impl fmt::Display for VolumeBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)?;
        if self.mode == VolumeMode::ReadOnly {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

/// Readiness probe configuration.
///
/// Intervals and thresholds are required inputs; the orchestrator never
/// infers defaults for them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// How the service is probed.
    pub probe: Probe,
    /// Seconds between probes.
    pub interval: u64,
    /// Seconds before a single probe is counted as failed.
    pub timeout: u64,
    /// Consecutive successes required to become ready.
    pub success_threshold: u32,
    /// Consecutive failures before degrading or failing.
    pub failure_threshold: u32,
}

/// Probe kinds understood by the runtime collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Probe {
    /// HTTP request; success is a response whose status falls in the range.
    Http {
        /// Endpoint URL.
        url: String,
        /// Inclusive acceptable status range.
        #[serde(default = "default_accept_status")]
        accept_status: (u16, u16),
    },
    /// Command executed inside the workload; success is exit code zero.
    Command {
        /// Command to run.
        command: String,
        /// Command arguments.
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_accept_status() -> (u16, u16) {
    (200, 399)
}
