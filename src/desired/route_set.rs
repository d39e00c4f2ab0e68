use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::xds::cache::OwnerKey;
use crate::{Error, Result};

/// Desired routing for one owner: hosts, paths, backends, and certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSet {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub rules: Vec<HostRule>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<TlsTermination>,

    /// Extra key/value pairs forwarded to the authorization service
    #[serde(default, alias = "authz_context")]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub authz_context: BTreeMap<String, String>,
}

/// Who can reach a host rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    External,
    ClusterLocal,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::External => f.write_str("External"),
            Visibility::ClusterLocal => f.write_str("ClusterLocal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostRule {
    pub hosts: Vec<String>,

    #[serde(default)]
    pub visibility: Visibility,

    pub paths: Vec<PathRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathRule {
    #[serde(default = "default_prefix")]
    pub prefix: String,

    pub backends: Vec<Backend>,

    #[serde(default, alias = "timeout_ms")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Request headers added before forwarding
    #[serde(default, alias = "append_headers")]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub append_headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub service: String,

    /// Defaults to the route set's namespace
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    pub port: u32,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Backend {
    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(fallback)
    }

    /// Cluster name shared by every route set pointing at this backend.
    pub fn cluster_name(&self, fallback_namespace: &str) -> String {
        format!("{}/{}:{}", self.namespace_or(fallback_namespace), self.service, self.port)
    }

    pub fn address(&self, fallback_namespace: &str) -> String {
        format!("{}.{}.svc.cluster.local", self.service, self.namespace_or(fallback_namespace))
    }
}

/// Certificate for a set of hosts, as read from a secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsTermination {
    pub hosts: Vec<String>,

    #[serde(alias = "secret_namespace")]
    pub secret_namespace: String,

    #[serde(alias = "secret_name")]
    pub secret_name: String,

    #[serde(alias = "certificate_pem")]
    pub certificate_pem: String,

    #[serde(alias = "private_key_pem")]
    pub private_key_pem: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_prefix() -> String {
    "/".to_string()
}

fn default_weight() -> u32 {
    100
}

impl RouteSet {
    pub fn owner_key(&self) -> OwnerKey {
        OwnerKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Reject route sets that cannot be translated.
    ///
    /// A host may appear in one rule only, whatever its visibility: external
    /// rules are also served cluster-locally, and a route configuration with
    /// two virtual hosts for one domain is refused by the proxy. TLS hosts
    /// must be hosts this route set routes.
    pub fn validate_model(&self) -> Result<()> {
        let owner = self.owner_key();
        if self.name.is_empty() || self.namespace.is_empty() {
            return Err(Error::config("Route set requires a name and a namespace"));
        }

        let mut routed_hosts = BTreeSet::new();
        for rule in &self.rules {
            if rule.hosts.is_empty() || rule.hosts.iter().any(|host| host.trim().is_empty()) {
                return Err(Error::config(format!("{}: host rule needs non-empty hosts", owner)));
            }
            for host in &rule.hosts {
                if !routed_hosts.insert(host.to_ascii_lowercase()) {
                    return Err(Error::config(format!(
                        "{}: host '{}' is listed more than once",
                        owner, host
                    )));
                }
            }
            if rule.paths.is_empty() {
                return Err(Error::config(format!(
                    "{}: hosts {:?} have no paths",
                    owner, rule.hosts
                )));
            }
            for path in &rule.paths {
                if !path.prefix.starts_with('/') {
                    return Err(Error::config(format!(
                        "{}: path prefix '{}' must start with '/'",
                        owner, path.prefix
                    )));
                }
                if path.backends.is_empty() {
                    return Err(Error::config(format!(
                        "{}: path '{}' has no backends",
                        owner, path.prefix
                    )));
                }
                if let Some(invalid) =
                    path.backends.iter().find(|b| b.service.is_empty() || b.port == 0 || b.port > 65535)
                {
                    return Err(Error::config(format!(
                        "{}: invalid backend {}:{}",
                        owner, invalid.service, invalid.port
                    )));
                }
                if path.backends.iter().map(|b| b.weight as u64).sum::<u64>() == 0 {
                    return Err(Error::config(format!(
                        "{}: backend weights for '{}' sum to zero",
                        owner, path.prefix
                    )));
                }
            }
        }

        for tls in &self.tls {
            if tls.hosts.is_empty() {
                return Err(Error::config(format!(
                    "{}: TLS from secret {}/{} lists no hosts",
                    owner, tls.secret_namespace, tls.secret_name
                )));
            }
            if tls.certificate_pem.is_empty() || tls.private_key_pem.is_empty() {
                return Err(Error::config(format!(
                    "{}: secret {}/{} is missing certificate or key",
                    owner, tls.secret_namespace, tls.secret_name
                )));
            }
            if let Some(unrouted) =
                tls.hosts.iter().find(|host| !routed_hosts.contains(&host.to_ascii_lowercase()))
            {
                return Err(Error::config(format!(
                    "{}: TLS host '{}' is not routed by this route set",
                    owner, unrouted
                )));
            }
        }

        Ok(())
    }
}

/// Parse one or more `---` separated route sets.
pub fn parse_route_sets(yaml: &str) -> Result<Vec<RouteSet>> {
    let mut route_sets = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let route_set: RouteSet = serde_yaml::from_value(value)?;
        route_set.validate_model()?;
        route_sets.push(route_set);
    }
    Ok(route_sets)
}

pub fn load_route_sets(path: impl AsRef<Path>) -> Result<Vec<RouteSet>> {
    let contents = std::fs::read_to_string(path)?;
    parse_route_sets(&contents)
}
