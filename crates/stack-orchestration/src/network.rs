//! Network identity resolution.
//!
//! Services declaring `network_mode: service:X` are grouped with `X` under a
//! single network identity. Chains are followed to their root: the one
//! member that creates the namespace is the group owner, everyone else
//! attaches to it at launch time.

use crate::{Error, Manifest, NetworkMode, Result};
use std::collections::{HashMap, HashSet};

/// Network identity passed to the runtime when launching a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkIdentity {
    /// Create a fresh network namespace for this service.
    Own,
    /// Reuse the namespace created by the named owner service.
    Join(String),
}

/// One set of services sharing a single network identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkGroup {
    /// The member that creates the namespace.
    pub owner: String,
    /// Non-owner members attaching to the owner, in declaration order.
    pub members: Vec<String>,
}

impl NetworkGroup {
    /// Total group size, owner included.
    pub fn len(&self) -> usize {
        self.members.len() + 1
    }

    /// A group is never empty; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Partition of all services into network groups.
///
/// Immutable after construction; derived once from the manifest.
#[derive(Debug, Clone)]
pub struct NetworkGroups {
    groups: Vec<NetworkGroup>,
    owner_of: HashMap<String, String>,
}

impl NetworkGroups {
    /// Partition the manifest's services by following sharing chains.
    ///
    /// Fails with [`Error::InvalidNetworkTarget`] on cyclic chains or
    /// targets outside the manifest, and with
    /// [`Error::ConflictingPortBinding`] when two members of one group
    /// publish the same host port.
    pub fn resolve(manifest: &Manifest) -> Result<Self> {
        let mut owner_of = HashMap::new();

        for spec in manifest.services() {
            let mut visited = HashSet::new();
            let mut current = spec.name.as_str();
            loop {
                if !visited.insert(current.to_string()) {
                    return Err(Error::InvalidNetworkTarget {
                        service: spec.name.clone(),
                        reason: format!("network sharing chain through '{current}' is cyclic"),
                    });
                }
                let node = manifest.get(current).ok_or_else(|| Error::InvalidNetworkTarget {
                    service: spec.name.clone(),
                    reason: format!("target '{current}' is not a defined service"),
                })?;
                match &node.network_mode {
                    NetworkMode::Own => break,
                    NetworkMode::Service(target) => current = target,
                }
            }
            owner_of.insert(spec.name.clone(), current.to_string());
        }

        // Group members under their root owner, in declaration order.
        let mut groups: Vec<NetworkGroup> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();
        for spec in manifest.services() {
            let owner = owner_of[&spec.name].clone();
            let idx = *group_index.entry(owner.clone()).or_insert_with(|| {
                groups.push(NetworkGroup {
                    owner,
                    members: Vec::new(),
                });
                groups.len() - 1
            });
            if spec.name != groups[idx].owner {
                groups[idx].members.push(spec.name.clone());
            }
        }

        let resolved = Self { groups, owner_of };
        resolved.check_port_conflicts(manifest)?;
        Ok(resolved)
    }

    fn check_port_conflicts(&self, manifest: &Manifest) -> Result<()> {
        for group in &self.groups {
            let mut published: HashMap<u16, &str> = HashMap::new();
            for name in std::iter::once(&group.owner).chain(&group.members) {
                let spec = manifest.get(name).expect("group member exists in manifest");
                for binding in &spec.ports {
                    if let Some(first) = published.insert(binding.host, name.as_str()) {
                        return Err(Error::ConflictingPortBinding {
                            port: binding.host,
                            first: first.to_string(),
                            second: name.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// All groups, singletons included.
    pub fn groups(&self) -> &[NetworkGroup] {
        &self.groups
    }

    /// Root owner of a service's network identity.
    pub fn owner_of(&self, service: &str) -> Option<&str> {
        self.owner_of.get(service).map(String::as_str)
    }

    /// Network identity the runtime should use for a service.
    pub fn identity(&self, service: &str) -> NetworkIdentity {
        match self.owner_of.get(service) {
            Some(owner) if owner != service => NetworkIdentity::Join(owner.clone()),
            _ => NetworkIdentity::Own,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServiceSpec;

    fn sharing(name: &str, target: &str) -> ServiceSpec {
        let mut s = ServiceSpec::new(name, format!("img/{name}"));
        s.network_mode = NetworkMode::Service(target.to_string());
        s
    }

    #[test]
    fn vpn_group_resolves_to_single_owner() {
        let manifest = Manifest::new(
            "privacy",
            vec![
                ServiceSpec::new("gluetun", "qmcgaw/gluetun"),
                sharing("qbittorrent", "gluetun"),
                sharing("firefox", "gluetun"),
            ],
        )
        .unwrap();

        let groups = NetworkGroups::resolve(&manifest).unwrap();
        assert_eq!(groups.groups().len(), 1);
        let group = &groups.groups()[0];
        assert_eq!(group.owner, "gluetun");
        assert_eq!(group.members, vec!["qbittorrent", "firefox"]);
        assert_eq!(group.len(), 3);

        assert_eq!(groups.identity("gluetun"), NetworkIdentity::Own);
        assert_eq!(
            groups.identity("qbittorrent"),
            NetworkIdentity::Join("gluetun".to_string())
        );
    }

    #[test]
    fn chains_follow_to_root_owner() {
        let manifest = Manifest::new(
            "chained",
            vec![
                ServiceSpec::new("vpn", "img/vpn"),
                sharing("proxy", "vpn"),
                sharing("browser", "proxy"),
            ],
        )
        .unwrap();

        let groups = NetworkGroups::resolve(&manifest).unwrap();
        assert_eq!(groups.owner_of("browser"), Some("vpn"));
        assert_eq!(
            groups.identity("browser"),
            NetworkIdentity::Join("vpn".to_string())
        );
    }

    #[test]
    fn cyclic_chain_is_rejected() {
        let manifest = Manifest::new(
            "cycle",
            vec![sharing("a", "b"), sharing("b", "a")],
        )
        .unwrap();

        let err = NetworkGroups::resolve(&manifest).unwrap_err();
        assert!(matches!(err, Error::InvalidNetworkTarget { .. }));
    }

    #[test]
    fn conflicting_ports_in_group_are_rejected() {
        let mut vpn = ServiceSpec::new("vpn", "img/vpn");
        vpn.ports.push("8080:8080".parse().unwrap());
        let mut torrent = sharing("torrent", "vpn");
        torrent.ports.push("8080:8080".parse().unwrap());

        let manifest = Manifest::new("conflict", vec![vpn, torrent]).unwrap();
        let err = NetworkGroups::resolve(&manifest).unwrap_err();
        match err {
            Error::ConflictingPortBinding { port, first, second } => {
                assert_eq!(port, 8080);
                assert_eq!(first, "vpn");
                assert_eq!(second, "torrent");
            }
            other => panic!("expected ConflictingPortBinding, got {other:?}"),
        }
    }

    #[test]
    fn same_port_in_different_groups_is_fine() {
        let mut web = ServiceSpec::new("web", "img/web");
        web.ports.push("80:80".parse().unwrap());
        let mut mirror = ServiceSpec::new("mirror", "img/mirror");
        mirror.ports.push("80:80".parse().unwrap());

        let manifest = Manifest::new("two-groups", vec![web, mirror]).unwrap();
        assert!(NetworkGroups::resolve(&manifest).is_ok());
    }
}
