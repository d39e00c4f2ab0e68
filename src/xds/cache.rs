//! Per-owner resource cache.
//!
//! Each route-set owner contributes virtual hosts, clusters, and SNI matches.
//! The cache keeps a domain index and a server-name index in step with the
//! entries so that a hostname can only ever belong to one owner, and merges
//! everything into a single [`ResourceGraph`] on demand.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::route::v3::VirtualHost;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ListenerPorts, SyncConfig};
use crate::observability::metrics::{record_domain_conflict, update_cache_owners};
use crate::xds::cluster::build_ext_authz_cluster;
use crate::xds::filters::ext_authz::ExtAuthzSettings;
use crate::xds::listener::{
    build_http_connection_manager, build_listener, CertificatePair, SniMatch, TransportSecurity,
};
use crate::xds::route::build_route_configuration;
use crate::xds::snapshot::{Resource, ResourceGraph};
use crate::{Error, Result};

/// Route configuration served to the external listeners.
pub const EXTERNAL_ROUTE_CONFIG_NAME: &str = "external_services";
/// Route configuration served to the cluster-local listener.
pub const INTERNAL_ROUTE_CONFIG_NAME: &str = "internal_services";

/// Identity of a route-set owner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerKey {
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Everything one owner contributes to the merged graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnerResources {
    pub external_virtual_hosts: Vec<VirtualHost>,
    pub internal_virtual_hosts: Vec<VirtualHost>,
    pub clusters: Vec<Cluster>,
    pub sni_matches: Vec<SniMatch>,
}

impl OwnerResources {
    /// Distinct, lower-cased domains across both virtual host sets.
    pub fn domains(&self) -> BTreeSet<String> {
        self.external_virtual_hosts
            .iter()
            .chain(&self.internal_virtual_hosts)
            .flat_map(|vhost| vhost.domains.iter())
            .map(|domain| domain.to_ascii_lowercase())
            .collect()
    }

    /// Every route configuration gets at most one virtual host per domain.
    fn check_distinct_domains(&self) -> Result<()> {
        for (route_config, virtual_hosts) in [
            (EXTERNAL_ROUTE_CONFIG_NAME, &self.external_virtual_hosts),
            (INTERNAL_ROUTE_CONFIG_NAME, &self.internal_virtual_hosts),
        ] {
            let mut seen = BTreeSet::new();
            for domain in virtual_hosts.iter().flat_map(|vhost| vhost.domains.iter()) {
                if !seen.insert(domain.to_ascii_lowercase()) {
                    return Err(Error::encoding(format!(
                        "domain '{}' appears in more than one virtual host of '{}'",
                        domain, route_config
                    )));
                }
            }
        }
        Ok(())
    }

    /// Lower-cased SNI server names; a name listed by two matches is an error.
    fn server_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for sni_match in &self.sni_matches {
            for host in &sni_match.hosts {
                if !names.insert(host.to_ascii_lowercase()) {
                    return Err(Error::encoding(format!(
                        "server name '{}' appears in more than one TLS match",
                        host
                    )));
                }
            }
        }
        Ok(names)
    }
}

/// Inputs to graph assembly that do not come from owners.
#[derive(Debug, Clone, Default)]
pub struct GraphSettings {
    pub ports: ListenerPorts,
    pub ext_authz: Option<ExtAuthzSettings>,
    /// When set, the HTTPS listener serves this certificate for every host
    /// instead of selecting per-owner certificates by SNI.
    pub default_certificate: Option<CertificatePair>,
}

impl GraphSettings {
    /// Settings derived from the runtime configuration; reads the default
    /// certificate files when configured.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let default_certificate = match &config.default_certificate {
            Some(paths) => Some(paths.load()?),
            None => None,
        };
        Ok(Self { ports: config.ports, ext_authz: config.ext_authz.clone(), default_certificate })
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<OwnerKey, OwnerResources>,
    domains: HashMap<String, OwnerKey>,
    server_names: HashMap<String, OwnerKey>,
}

impl CacheState {
    fn release(&mut self, owner: &OwnerKey) -> Option<OwnerResources> {
        let previous = self.entries.remove(owner)?;
        self.domains.retain(|_, holder| holder != owner);
        self.server_names.retain(|_, holder| holder != owner);
        Some(previous)
    }
}

/// Owner-keyed resource cache guarded by a single read/write lock.
#[derive(Debug)]
pub struct Caches {
    settings: GraphSettings,
    state: RwLock<CacheState>,
}

impl Caches {
    pub fn new(settings: GraphSettings) -> Self {
        Self { settings, state: RwLock::new(CacheState::default()) }
    }

    pub fn settings(&self) -> &GraphSettings {
        &self.settings
    }

    /// Store `resources` as the entry for `owner`, replacing any previous one.
    ///
    /// Fails with [`Error::DomainConflict`] if a domain or SNI server name is
    /// held by another owner, as either a domain or a server name. The cache
    /// is left untouched on any error.
    pub fn put(&self, owner: OwnerKey, resources: OwnerResources) -> Result<()> {
        resources.check_distinct_domains()?;
        let domains = resources.domains();
        let server_names = resources.server_names()?;

        let mut state = self.write()?;

        for hostname in domains.iter().chain(&server_names) {
            let existing = [&state.domains, &state.server_names]
                .into_iter()
                .filter_map(|index| index.get(hostname))
                .find(|holder| **holder != owner);
            if let Some(existing) = existing {
                warn!(
                    domain = %hostname,
                    owner = %owner,
                    existing_owner = %existing,
                    "Rejecting route set: domain already owned"
                );
                record_domain_conflict(&owner.to_string());
                return Err(Error::DomainConflict {
                    domain: hostname.clone(),
                    owner: owner.to_string(),
                    existing_owner: existing.to_string(),
                });
            }
        }

        state.release(&owner);
        for domain in domains {
            state.domains.insert(domain, owner.clone());
        }
        for name in server_names {
            state.server_names.insert(name, owner.clone());
        }
        debug!(
            owner = %owner,
            virtual_hosts = resources.external_virtual_hosts.len() + resources.internal_virtual_hosts.len(),
            clusters = resources.clusters.len(),
            sni_matches = resources.sni_matches.len(),
            "Cached route set"
        );
        state.entries.insert(owner, resources);
        update_cache_owners(state.entries.len());
        Ok(())
    }

    /// Drop the entry for `owner` and release its domains. Returns whether
    /// an entry existed.
    pub fn delete(&self, owner: &OwnerKey) -> Result<bool> {
        let mut state = self.write()?;
        let removed = state.release(owner).is_some();
        if removed {
            info!(owner = %owner, "Removed route set from cache");
            update_cache_owners(state.entries.len());
        }
        Ok(removed)
    }

    /// Merge every entry into one graph.
    ///
    /// Listeners are derived here because a port's listener is shared by all
    /// owners. Both route configurations are always present so listeners
    /// never reference a missing one.
    pub fn to_graph(&self) -> Result<ResourceGraph> {
        let state = self.read()?;
        let mut graph = ResourceGraph::new();

        let mut external_vhosts = Vec::new();
        let mut internal_vhosts = Vec::new();
        let mut sni_matches = Vec::new();
        for resources in state.entries.values() {
            external_vhosts.extend(resources.external_virtual_hosts.iter().cloned());
            internal_vhosts.extend(resources.internal_virtual_hosts.iter().cloned());
            sni_matches.extend(resources.sni_matches.iter().cloned());
            for cluster in &resources.clusters {
                graph.insert(Resource::Cluster(cluster.clone()))?;
            }
        }
        drop(state);

        if let Some(settings) = &self.settings.ext_authz {
            graph.insert(Resource::Cluster(build_ext_authz_cluster(settings)?))?;
        }

        graph.insert(Resource::Route(build_route_configuration(
            EXTERNAL_ROUTE_CONFIG_NAME,
            external_vhosts,
        )))?;
        graph.insert(Resource::Route(build_route_configuration(
            INTERNAL_ROUTE_CONFIG_NAME,
            internal_vhosts,
        )))?;

        let ext_authz = self.settings.ext_authz.as_ref();
        let external_manager = build_http_connection_manager(EXTERNAL_ROUTE_CONFIG_NAME, ext_authz);
        let internal_manager = build_http_connection_manager(INTERNAL_ROUTE_CONFIG_NAME, ext_authz);
        let ports = &self.settings.ports;

        if let Some(port) = ports.external_http {
            let listener = build_listener(&external_manager, port, &TransportSecurity::None)?;
            graph.insert(Resource::Listener(listener))?;
        }

        let https_security = match &self.settings.default_certificate {
            Some(pair) => Some(TransportSecurity::SingleCertificate(pair.clone())),
            None if !sni_matches.is_empty() => Some(TransportSecurity::SniMultiplexed(sni_matches)),
            None => None,
        };
        if let Some(security) = https_security {
            let listener = build_listener(&external_manager, ports.external_https, &security)?;
            graph.insert(Resource::Listener(listener))?;
        }

        if let Some(port) = ports.internal_http {
            let listener = build_listener(&internal_manager, port, &TransportSecurity::None)?;
            graph.insert(Resource::Listener(listener))?;
        }

        Ok(graph)
    }

    /// Entry currently stored for `owner`.
    pub fn get(&self, owner: &OwnerKey) -> Result<Option<OwnerResources>> {
        Ok(self.read()?.entries.get(owner).cloned())
    }

    /// Owner currently holding `domain` as a routed domain or an SNI server
    /// name (case-insensitive).
    pub fn owner_of(&self, domain: &str) -> Result<Option<OwnerKey>> {
        let state = self.read()?;
        let domain = domain.to_ascii_lowercase();
        Ok(state.domains.get(&domain).or_else(|| state.server_names.get(&domain)).cloned())
    }

    pub fn owners(&self) -> Result<Vec<OwnerKey>> {
        Ok(self.read()?.entries.keys().cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.entries.is_empty())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CacheState>> {
        self.state.read().map_err(|_| Error::internal("cache lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CacheState>> {
        self.state.write().map_err(|_| Error::internal("cache lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::cluster::{build_cluster, BackendEndpoint};
    use crate::xds::listener::{listener_name, SecretRef};
    use crate::xds::route::{build_route, build_virtual_host, RouteSpec, RouteTarget};
    use crate::xds::snapshot::{ResourceKind, Snapshot};

    fn settings() -> GraphSettings {
        GraphSettings {
            ports: ListenerPorts { external_http: Some(8080), external_https: 8443, internal_http: Some(8081) },
            ext_authz: None,
            default_certificate: None,
        }
    }

    fn owner_resources(owner: &str, domains: &[&str]) -> OwnerResources {
        let cluster_name = format!("default/{}", owner);
        let route = build_route(&RouteSpec {
            name: owner.to_string(),
            prefix: "/".into(),
            target: RouteTarget::Cluster(cluster_name.clone()),
            timeout_ms: None,
            headers_to_add: Vec::new(),
        })
        .unwrap();
        let domains: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
        let endpoint = BackendEndpoint { address: format!("{}.default.svc", owner), port: 80 };
        OwnerResources {
            external_virtual_hosts: vec![build_virtual_host(owner, domains.clone(), vec![route.clone()])],
            internal_virtual_hosts: vec![build_virtual_host(owner, domains, vec![route])],
            clusters: vec![build_cluster(&cluster_name, &[endpoint], 1000).unwrap()],
            sni_matches: Vec::new(),
        }
    }

    fn sni(hosts: &[&str], secret: &str) -> SniMatch {
        SniMatch {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            cert_source: SecretRef { namespace: "default".into(), name: secret.into() },
            certificates: CertificatePair {
                certificate_chain: format!("chain-{}", secret).into_bytes(),
                private_key: format!("key-{}", secret).into_bytes(),
            },
        }
    }

    fn external_domains(graph: &ResourceGraph) -> Vec<Vec<String>> {
        graph
            .get(ResourceKind::Route)
            .iter()
            .find_map(|resource| match resource {
                Resource::Route(rc) if rc.name == EXTERNAL_ROUTE_CONFIG_NAME => {
                    Some(rc.virtual_hosts.iter().map(|vh| vh.domains.clone()).collect())
                }
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn domain_conflict_leaves_store_unchanged() {
        let cache = Caches::new(settings());
        let a = OwnerKey::new("default", "a");
        let b = OwnerKey::new("default", "b");
        cache.put(a.clone(), owner_resources("a", &["foo.example.com"])).unwrap();
        let before = cache.to_graph().unwrap();

        let err = cache
            .put(b.clone(), owner_resources("b", &["bar.example.com", "FOO.example.com"]))
            .unwrap_err();

        match err {
            Error::DomainConflict { domain, owner, existing_owner } => {
                assert_eq!(domain, "foo.example.com");
                assert_eq!(owner, "default/b");
                assert_eq!(existing_owner, "default/a");
            }
            other => panic!("expected domain conflict, got {:?}", other),
        }
        assert_eq!(cache.owners().unwrap(), vec![a.clone()]);
        assert_eq!(cache.owner_of("foo.example.com").unwrap(), Some(a));
        assert_eq!(cache.owner_of("bar.example.com").unwrap(), None);
        assert_eq!(cache.to_graph().unwrap(), before);
        assert_eq!(external_domains(&before), vec![vec!["foo.example.com".to_string()]]);
    }

    #[test]
    fn put_replaces_previous_entry_and_releases_domains() {
        let cache = Caches::new(settings());
        let a = OwnerKey::new("default", "a");
        cache.put(a.clone(), owner_resources("a", &["old.example.com"])).unwrap();
        cache.put(a.clone(), owner_resources("a", &["new.example.com"])).unwrap();

        assert_eq!(cache.len().unwrap(), 1);
        assert_eq!(cache.owner_of("old.example.com").unwrap(), None);
        assert_eq!(cache.owner_of("new.example.com").unwrap(), Some(a));

        let b = OwnerKey::new("default", "b");
        assert!(cache.put(b, owner_resources("b", &["old.example.com"])).is_ok());
    }

    #[test]
    fn delete_releases_domains_and_is_idempotent() {
        let cache = Caches::new(settings());
        let a = OwnerKey::new("default", "a");
        cache.put(a.clone(), owner_resources("a", &["foo.example.com"])).unwrap();

        assert!(cache.delete(&a).unwrap());
        assert!(!cache.delete(&a).unwrap());
        assert!(cache.is_empty().unwrap());
        assert_eq!(cache.owner_of("foo.example.com").unwrap(), None);
    }

    #[test]
    fn empty_cache_graph_is_consistent() {
        let cache = Caches::new(settings());
        let graph = cache.to_graph().unwrap();

        assert!(graph.get(ResourceKind::Cluster).is_empty());
        assert_eq!(graph.get(ResourceKind::Route).len(), 2);
        // No certificates, so no HTTPS listener.
        let names: Vec<&str> = graph.get(ResourceKind::Listener).iter().map(Resource::name).collect();
        assert_eq!(names, vec!["listener_8080", "listener_8081"]);
        assert!(Snapshot::from_graph(graph).consistent().is_ok());
    }

    #[test]
    fn graph_merges_owners_in_key_order() {
        let cache = Caches::new(settings());
        cache.put(OwnerKey::new("default", "b"), owner_resources("b", &["b.example.com"])).unwrap();
        cache.put(OwnerKey::new("default", "a"), owner_resources("a", &["a.example.com"])).unwrap();

        let graph = cache.to_graph().unwrap();
        assert_eq!(
            external_domains(&graph),
            vec![vec!["a.example.com".to_string()], vec!["b.example.com".to_string()]]
        );
        assert_eq!(graph.get(ResourceKind::Cluster).len(), 2);
        assert!(Snapshot::from_graph(graph).consistent().is_ok());
    }

    #[test]
    fn conflicting_cluster_definitions_fail_the_merge() {
        let cache = Caches::new(settings());
        let mut a = owner_resources("a", &["a.example.com"]);
        let mut b = owner_resources("b", &["b.example.com"]);
        a.clusters = vec![build_cluster(
            "shared",
            &[BackendEndpoint { address: "one.svc".into(), port: 80 }],
            1000,
        )
        .unwrap()];
        b.clusters = vec![build_cluster(
            "shared",
            &[BackendEndpoint { address: "two.svc".into(), port: 80 }],
            1000,
        )
        .unwrap()];
        cache.put(OwnerKey::new("default", "a"), a).unwrap();
        cache.put(OwnerKey::new("default", "b"), b).unwrap();

        let err = cache.to_graph().unwrap_err();
        assert!(matches!(err, Error::DuplicateResource { kind: ResourceKind::Cluster, .. }));
    }

    #[test]
    fn sni_matches_from_all_owners_share_one_listener() {
        let cache = Caches::new(settings());
        let mut a = owner_resources("a", &["a.example.com"]);
        a.sni_matches = vec![sni(&["a.example.com"], "a-cert")];
        let mut b = owner_resources("b", &["b.example.com"]);
        b.sni_matches = vec![sni(&["b.example.com"], "b-cert")];
        cache.put(OwnerKey::new("default", "a"), a).unwrap();
        cache.put(OwnerKey::new("default", "b"), b).unwrap();

        let graph = cache.to_graph().unwrap();
        let https = graph
            .get(ResourceKind::Listener)
            .iter()
            .find_map(|resource| match resource {
                Resource::Listener(l) if l.name == listener_name(8443) => Some(l.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(https.filter_chains.len(), 2);
        assert_eq!(https.listener_filters.len(), 1);
    }

    #[test]
    fn server_name_overlap_is_rejected() {
        let cache = Caches::new(settings());
        let mut a = owner_resources("a", &["a.example.com"]);
        a.sni_matches = vec![sni(&["tls.example.com"], "a-cert")];
        cache.put(OwnerKey::new("default", "a"), a).unwrap();

        let mut b = owner_resources("b", &["b.example.com"]);
        b.sni_matches = vec![sni(&["tls.example.com"], "b-cert")];
        let err = cache.put(OwnerKey::new("default", "b"), b).unwrap_err();
        assert!(err.is_domain_conflict());

        let mut c = owner_resources("c", &["c.example.com"]);
        c.sni_matches = vec![sni(&["c.example.com"], "c1"), sni(&["C.example.com"], "c2")];
        let err = cache.put(OwnerKey::new("default", "c"), c).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn server_name_cannot_claim_another_owners_domain() {
        let cache = Caches::new(settings());
        let d = OwnerKey::new("default", "d");
        cache.put(d.clone(), owner_resources("d", &["d.example.com"])).unwrap();

        let mut e = owner_resources("e", &["e.example.com"]);
        e.sni_matches = vec![sni(&["D.example.com"], "e-cert")];
        match cache.put(OwnerKey::new("default", "e"), e).unwrap_err() {
            Error::DomainConflict { domain, existing_owner, .. } => {
                assert_eq!(domain, "d.example.com");
                assert_eq!(existing_owner, "default/d");
            }
            other => panic!("expected domain conflict, got {:?}", other),
        }

        // d can still terminate TLS for its own domain.
        let mut d_tls = owner_resources("d", &["d.example.com"]);
        d_tls.sni_matches = vec![sni(&["d.example.com"], "d-cert")];
        cache.put(d.clone(), d_tls).unwrap();
        assert_eq!(cache.owners().unwrap(), vec![d]);
    }

    #[test]
    fn domain_cannot_claim_another_owners_server_name() {
        let cache = Caches::new(settings());
        let mut a = owner_resources("a", &["a.example.com"]);
        a.sni_matches = vec![sni(&["tls.example.com"], "a-cert")];
        cache.put(OwnerKey::new("default", "a"), a).unwrap();
        assert_eq!(cache.owner_of("tls.example.com").unwrap(), Some(OwnerKey::new("default", "a")));

        let err = cache
            .put(OwnerKey::new("default", "b"), owner_resources("b", &["tls.example.com"]))
            .unwrap_err();
        assert!(err.is_domain_conflict());
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn repeated_domain_within_one_route_configuration_is_rejected() {
        let cache = Caches::new(settings());
        let mut a = owner_resources("a", &["a.example.com"]);
        let repeated = a.external_virtual_hosts[0].clone();
        a.external_virtual_hosts.push(repeated);

        let err = cache.put(OwnerKey::new("default", "a"), a).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert!(err.to_string().contains(EXTERNAL_ROUTE_CONFIG_NAME));
        assert!(cache.is_empty().unwrap());

        // The same domain once per route configuration is the normal shape.
        let b = owner_resources("b", &["b.example.com"]);
        cache.put(OwnerKey::new("default", "b"), b).unwrap();
    }

    #[test]
    fn default_certificate_overrides_sni() {
        let mut graph_settings = settings();
        graph_settings.default_certificate = Some(CertificatePair {
            certificate_chain: b"chain".to_vec(),
            private_key: b"key".to_vec(),
        });
        let cache = Caches::new(graph_settings);
        let mut a = owner_resources("a", &["a.example.com"]);
        a.sni_matches = vec![sni(&["a.example.com"], "a-cert")];
        cache.put(OwnerKey::new("default", "a"), a).unwrap();

        let graph = cache.to_graph().unwrap();
        let https = graph
            .get(ResourceKind::Listener)
            .iter()
            .find_map(|resource| match resource {
                Resource::Listener(l) if l.name == listener_name(8443) => Some(l.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(https.filter_chains.len(), 1);
        assert!(https.filter_chains[0].filter_chain_match.is_none());
        assert!(https.listener_filters.is_empty());
    }

    #[test]
    fn ext_authz_cluster_is_added() {
        let mut graph_settings = settings();
        graph_settings.ext_authz = Some(ExtAuthzSettings {
            host: "authz.svc".into(),
            port: 9000,
            timeout_ms: 2000,
            failure_mode_allow: false,
        });
        let cache = Caches::new(graph_settings);
        let graph = cache.to_graph().unwrap();

        let names: Vec<&str> = graph.get(ResourceKind::Cluster).iter().map(Resource::name).collect();
        assert_eq!(names, vec![crate::xds::filters::ext_authz::EXT_AUTHZ_CLUSTER_NAME]);
    }
}
