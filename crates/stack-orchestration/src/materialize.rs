//! Volume and environment materialization.
//!
//! Resolves each service's declared bind mounts against the deployment
//! root, creates missing host directories, and substitutes `${...}`
//! placeholders in environment values. Placeholders may reference process
//! environment (`${VAR}`, `${VAR:-default}`) or another service's resolved
//! address (`${db.host}`, `${db.port}`, `${db.addr}`); the latter resolve
//! only once that service has itself been materialized.

use crate::{Error, Result, ServiceSpec, VolumeMode};
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Resolved network address of a materialized service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    /// Hostname, the name of the service's network identity owner.
    pub host: String,
    /// First published host port, if any.
    pub port: Option<u16>,
}

impl ServiceAddress {
    /// Render as `host:port`, or bare `host` without a published port.
    pub fn to_endpoint(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }
}

/// A bind mount with its host side resolved to an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    /// Absolute host path, guaranteed to exist.
    pub host: PathBuf,
    /// Mount point inside the workload.
    pub container: String,
    /// Access mode.
    pub mode: VolumeMode,
}

/// Everything the runtime needs to launch one service.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedService {
    /// Resolved bind mounts.
    pub volumes: Vec<ResolvedVolume>,
    /// Fully substituted environment.
    pub env: IndexMap<String, String>,
    /// The service's own resolved address.
    pub address: ServiceAddress,
}

/// Materializer rooted at a deployment directory.
///
/// Cheap to clone; the table of resolved addresses is shared so that
/// concurrently launching branches see each other's registrations.
#[derive(Clone)]
pub struct Materializer {
    root: PathBuf,
    env: HashMap<String, String>,
    placeholder: Regex,
    resolved: Arc<Mutex<HashMap<String, ServiceAddress>>>,
}

impl Materializer {
    /// Create a materializer resolving relative paths against `root` and
    /// variables against the current process environment.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_env(root, std::env::vars().collect())
    }

    /// Create a materializer with an explicit variable table.
    pub fn with_env(root: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            root: root.into(),
            env,
            placeholder: Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"),
            resolved: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Materialize one service: resolve volumes, substitute environment,
    /// and register its address for later references by dependents.
    ///
    /// `network_owner` is the name of the service whose namespace this one
    /// runs in (itself, for namespace owners). No processes are started.
    pub fn materialize(
        &self,
        spec: &ServiceSpec,
        network_owner: &str,
    ) -> Result<MaterializedService> {
        let volumes = self.resolve_volumes(spec)?;

        let mut env = IndexMap::with_capacity(spec.env.len());
        for (key, value) in &spec.env {
            env.insert(key.clone(), self.resolve_value(&spec.name, value)?);
        }

        let address = ServiceAddress {
            host: network_owner.to_string(),
            port: spec.ports.first().map(|p| p.host),
        };
        self.resolved
            .lock()
            .unwrap()
            .insert(spec.name.clone(), address.clone());
        debug!(
            "materialized service '{}' at {}",
            spec.name,
            address.to_endpoint()
        );

        Ok(MaterializedService {
            volumes,
            env,
            address,
        })
    }

    /// Address of an already-materialized service.
    pub fn address_of(&self, service: &str) -> Option<ServiceAddress> {
        self.resolved.lock().unwrap().get(service).cloned()
    }

    fn resolve_volumes(&self, spec: &ServiceSpec) -> Result<Vec<ResolvedVolume>> {
        let mut volumes = Vec::with_capacity(spec.volumes.len());
        for binding in &spec.volumes {
            let host = if Path::new(&binding.host).is_absolute() {
                PathBuf::from(&binding.host)
            } else {
                self.root.join(&binding.host)
            };
            // Re-creating an existing directory is a no-op, never an error.
            std::fs::create_dir_all(&host)?;
            volumes.push(ResolvedVolume {
                host,
                container: binding.container.clone(),
                mode: binding.mode,
            });
        }
        Ok(volumes)
    }

    fn resolve_value(&self, service: &str, value: &str) -> Result<String> {
        let mut result = value.to_string();
        for cap in self.placeholder.captures_iter(value) {
            let full = &cap[0];
            let expr = &cap[1];
            let replacement = if let Some((target, field)) = expr.split_once('.') {
                self.resolve_service_ref(service, full, target, field)?
            } else {
                self.resolve_env_var(service, full, expr)?
            };
            result = result.replace(full, &replacement);
        }
        Ok(result)
    }

    fn resolve_service_ref(
        &self,
        service: &str,
        placeholder: &str,
        target: &str,
        field: &str,
    ) -> Result<String> {
        let unresolved = || Error::UnresolvedReference {
            service: service.to_string(),
            placeholder: placeholder.to_string(),
        };
        let resolved = self.resolved.lock().unwrap();
        let address = resolved.get(target).ok_or_else(unresolved)?;
        match field {
            "host" => Ok(address.host.clone()),
            "port" => address
                .port
                .map(|p| p.to_string())
                .ok_or_else(unresolved),
            "addr" => Ok(address.to_endpoint()),
            _ => Err(unresolved()),
        }
    }

    fn resolve_env_var(&self, service: &str, placeholder: &str, expr: &str) -> Result<String> {
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        if let Some(value) = self.env.get(name) {
            return Ok(value.clone());
        }
        if let Some(default) = default {
            return Ok(default.to_string());
        }
        Err(Error::UnresolvedReference {
            service: service.to_string(),
            placeholder: placeholder.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceSpec;

    fn spec(name: &str) -> ServiceSpec {
        ServiceSpec::new(name, format!("img/{name}"))
    }

    #[test]
    fn relative_volumes_resolve_against_root_and_are_created() {
        let root = tempfile::tempdir().unwrap();
        let materializer = Materializer::with_env(root.path(), HashMap::new());

        let mut db = spec("db");
        db.volumes
            .push("data/db:/var/lib/postgresql/data".parse().unwrap());

        let materialized = materializer.materialize(&db, "db").unwrap();
        assert_eq!(materialized.volumes.len(), 1);
        assert_eq!(materialized.volumes[0].host, root.path().join("data/db"));
        assert!(materialized.volumes[0].host.is_dir());

        // Second materialization over the existing directory is a no-op.
        materializer.materialize(&db, "db").unwrap();
    }

    #[test]
    fn env_vars_and_defaults_substitute() {
        let root = tempfile::tempdir().unwrap();
        let mut vars = HashMap::new();
        vars.insert("DB_USER".to_string(), "appuser".to_string());
        let materializer = Materializer::with_env(root.path(), vars);

        let mut db = spec("db");
        db.env
            .insert("POSTGRES_USER".to_string(), "${DB_USER}".to_string());
        db.env.insert(
            "POSTGRES_PASSWORD".to_string(),
            "${DB_PASS:-secret}".to_string(),
        );

        let materialized = materializer.materialize(&db, "db").unwrap();
        assert_eq!(materialized.env["POSTGRES_USER"], "appuser");
        assert_eq!(materialized.env["POSTGRES_PASSWORD"], "secret");
    }

    #[test]
    fn service_references_resolve_after_target_materializes() {
        let root = tempfile::tempdir().unwrap();
        let materializer = Materializer::with_env(root.path(), HashMap::new());

        let mut db = spec("db");
        db.ports.push("5432:5432".parse().unwrap());
        materializer.materialize(&db, "db").unwrap();

        let mut api = spec("api");
        api.env.insert("DB_HOST".to_string(), "${db.host}".to_string());
        api.env.insert("DB_PORT".to_string(), "${db.port}".to_string());
        api.env.insert(
            "DB_URL".to_string(),
            "postgres://${db.addr}/appdb".to_string(),
        );

        let materialized = materializer.materialize(&api, "api").unwrap();
        assert_eq!(materialized.env["DB_HOST"], "db");
        assert_eq!(materialized.env["DB_PORT"], "5432");
        assert_eq!(materialized.env["DB_URL"], "postgres://db:5432/appdb");
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let materializer = Materializer::with_env(root.path(), HashMap::new());

        let mut api = spec("api");
        api.env
            .insert("DB_HOST".to_string(), "${db.host}".to_string());

        let err = materializer.materialize(&api, "api").unwrap_err();
        match err {
            Error::UnresolvedReference { service, placeholder } => {
                assert_eq!(service, "api");
                assert_eq!(placeholder, "${db.host}");
            }
            other => panic!("expected UnresolvedReference, got {other:?}"),
        }
    }

    #[test]
    fn shared_namespace_uses_owner_address() {
        let root = tempfile::tempdir().unwrap();
        let materializer = Materializer::with_env(root.path(), HashMap::new());

        let mut torrent = spec("qbittorrent");
        torrent.ports.push("8080:8080".parse().unwrap());
        let materialized = materializer.materialize(&torrent, "gluetun").unwrap();
        assert_eq!(materialized.address.host, "gluetun");
        assert_eq!(materialized.address.to_endpoint(), "gluetun:8080");
    }
}
