//! Configuration parser and conversion into the orchestration model.

use crate::{Config, ConfigError, HealthCheck, PortMapping, Result, Service};
use stack_orchestration::{
    HealthCheck as ManifestHealthCheck, Manifest, NetworkMode, PortBinding, Probe, ServiceSpec,
    VolumeBinding,
};
use std::path::Path;

/// Parse a YAML configuration file
pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_str(&content)
}

/// Parse YAML configuration from a string
pub fn parse_str(content: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load a configuration file straight into an orchestration manifest
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest> {
    to_manifest(&parse_file(path)?)
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    // Check version
    if config.version != "1.0" {
        return Err(ConfigError::ValidationError(format!(
            "Unsupported version: {}, expected 1.0",
            config.version
        )));
    }

    if config.name.is_empty() {
        return Err(ConfigError::ValidationError(
            "Deployment name must not be empty".to_string(),
        ));
    }

    for (name, service) in &config.services {
        if let Some(check) = &service.health_check {
            match (&check.http, &check.command) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::ValidationError(format!(
                        "Service '{name}' declares both http and command health checks"
                    )));
                }
                (None, None) => {
                    return Err(ConfigError::ValidationError(format!(
                        "Service '{name}' declares a health check with neither http nor command"
                    )));
                }
                _ => {}
            }
            if check.http.is_some() && !check.args.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Service '{name}': args are only valid for command health checks"
                )));
            }
        }
    }

    Ok(())
}

/// Convert a parsed configuration into an orchestration manifest.
///
/// Cross-service consistency (dangling dependencies, duplicate names,
/// network-target validity) is enforced by the manifest itself.
pub fn to_manifest(config: &Config) -> Result<Manifest> {
    // Re-validated so hand-built Config values go through the same gate.
    validate_config(config)?;
    let mut specs = Vec::with_capacity(config.services.len());
    for (name, service) in &config.services {
        specs.push(convert_service(name, service)?);
    }
    Ok(Manifest::new(config.name.clone(), specs)?)
}

fn convert_service(name: &str, service: &Service) -> Result<ServiceSpec> {
    let mut spec = ServiceSpec::new(name, service.image.clone());
    spec.depends_on = service.depends_on.clone();
    spec.network_mode = convert_network_mode(name, service.network_mode.as_deref())?;

    for port in &service.ports {
        let binding: PortBinding = match port {
            PortMapping::Simple(port) => PortBinding {
                host: *port,
                container: *port,
            },
            PortMapping::Full(mapping) => mapping.parse()?,
        };
        spec.ports.push(binding);
    }

    for volume in &service.volumes {
        let binding: VolumeBinding = volume.parse()?;
        spec.volumes.push(binding);
    }

    spec.env = service.env.clone();
    spec.health_check = service.health_check.as_ref().map(convert_health_check);
    Ok(spec)
}

fn convert_network_mode(name: &str, mode: Option<&str>) -> Result<NetworkMode> {
    match mode {
        None => Ok(NetworkMode::Own),
        Some(value) => match value.strip_prefix("service:") {
            Some(target) if !target.is_empty() => Ok(NetworkMode::Service(target.to_string())),
            _ => Err(ConfigError::ValidationError(format!(
                "Service '{name}' has invalid network_mode '{value}', expected 'service:<name>'"
            ))),
        },
    }
}

fn convert_health_check(check: &HealthCheck) -> ManifestHealthCheck {
    // validate_config guarantees exactly one probe kind is present.
    let probe = match (&check.http, &check.command) {
        (Some(url), _) => Probe::Http {
            url: url.clone(),
            accept_status: check.accept_status.unwrap_or((200, 399)),
        },
        (None, Some(command)) => Probe::Command {
            command: command.clone(),
            args: check.args.clone(),
        },
        (None, None) => unreachable!("health check validated to have a probe"),
    };
    ManifestHealthCheck {
        probe,
        interval: check.interval,
        timeout: check.timeout,
        success_threshold: check.success_threshold,
        failure_threshold: check.failure_threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
version: "1.0"
name: minimal
services:
  db:
    image: postgres:16
"#;

    #[test]
    fn minimal_config_parses() {
        let config = parse_str(MINIMAL).unwrap();
        assert_eq!(config.version, "1.0");
        assert_eq!(config.name, "minimal");
        assert_eq!(config.services.len(), 1);

        let manifest = to_manifest(&config).unwrap();
        let db = manifest.get("db").unwrap();
        assert_eq!(db.image, "postgres:16");
        assert_eq!(db.network_mode, NetworkMode::Own);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let yaml = MINIMAL.replace("\"1.0\"", "\"2.0\"");
        let err = parse_str(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn network_mode_must_name_a_service() {
        let yaml = r#"
version: "1.0"
name: bad-mode
services:
  db:
    image: postgres:16
    network_mode: "host"
"#;
        let config = parse_str(yaml).unwrap();
        let err = to_manifest(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn health_check_needs_exactly_one_probe() {
        let both = r#"
version: "1.0"
name: both
services:
  api:
    image: img/api
    health_check:
      http: http://localhost:5000/api/health
      command: curl
      interval: 5
      timeout: 3
      success_threshold: 1
      failure_threshold: 3
"#;
        assert!(matches!(
            parse_str(both).unwrap_err(),
            ConfigError::ValidationError(_)
        ));

        let neither = r#"
version: "1.0"
name: neither
services:
  api:
    image: img/api
    health_check:
      interval: 5
      timeout: 3
      success_threshold: 1
      failure_threshold: 3
"#;
        assert!(matches!(
            parse_str(neither).unwrap_err(),
            ConfigError::ValidationError(_)
        ));
    }

    #[test]
    fn malformed_port_is_rejected() {
        let yaml = r#"
version: "1.0"
name: bad-port
services:
  db:
    image: postgres:16
    ports: ["eighty:80"]
"#;
        let config = parse_str(yaml).unwrap();
        let err = to_manifest(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ManifestError(_)));
    }
}
