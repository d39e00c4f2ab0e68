//! Route set → cache entry translation.

use std::collections::{BTreeMap, HashMap};

use envoy_types::pb::envoy::config::route::v3::{Route, VirtualHost};
use tracing::debug;

use crate::desired::route_set::{HostRule, PathRule, RouteSet, Visibility};
use crate::xds::cache::{OwnerKey, OwnerResources};
use crate::xds::cluster::{build_cluster, BackendEndpoint, DEFAULT_CONNECT_TIMEOUT_MS};
use crate::xds::listener::{CertificatePair, SecretRef, SniMatch};
use crate::xds::route::{
    build_route, build_virtual_host, build_virtual_host_with_authz_context, RouteSpec, RouteTarget,
    WeightedTarget,
};
use crate::Result;

/// Context extension naming the caller of the authorization service.
pub const AUTHZ_CLIENT_KEY: &str = "client";
/// Context extension carrying the rule's visibility.
pub const AUTHZ_VISIBILITY_KEY: &str = "visibility";
pub const AUTHZ_CLIENT_NAME: &str = "edgesync";

/// Builds cache entries from route sets.
#[derive(Debug, Clone)]
pub struct Translator {
    ext_authz_enabled: bool,
    connect_timeout_ms: u64,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Translator {
    pub fn new(ext_authz_enabled: bool) -> Self {
        Self { ext_authz_enabled, connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS }
    }

    pub fn with_connect_timeout_ms(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }

    /// Translate a validated route set.
    ///
    /// External hosts are served on both the external and the cluster-local
    /// route configuration; cluster-local hosts only on the latter.
    pub fn translate(&self, route_set: &RouteSet) -> Result<(OwnerKey, OwnerResources)> {
        route_set.validate_model()?;
        let owner = route_set.owner_key();

        let mut resources = OwnerResources::default();
        let mut backends: BTreeMap<String, BackendEndpoint> = BTreeMap::new();

        for (rule_index, rule) in route_set.rules.iter().enumerate() {
            let routes = rule
                .paths
                .iter()
                .enumerate()
                .map(|(path_index, path)| {
                    for backend in &path.backends {
                        backends.entry(backend.cluster_name(&route_set.namespace)).or_insert_with(|| {
                            BackendEndpoint {
                                address: backend.address(&route_set.namespace),
                                port: backend.port,
                            }
                        });
                    }
                    build_route(&self.route_spec(route_set, rule_index, path_index, path))
                })
                .collect::<Result<Vec<Route>>>()?;

            let vhost_name = format!("{}/{}-{}", route_set.namespace, route_set.name, rule_index);
            let virtual_host = self.virtual_host(&vhost_name, route_set, rule, routes);
            if rule.visibility == Visibility::External {
                resources.external_virtual_hosts.push(virtual_host.clone());
            }
            resources.internal_virtual_hosts.push(virtual_host);
        }

        for (cluster_name, endpoint) in &backends {
            resources.clusters.push(build_cluster(
                cluster_name,
                std::slice::from_ref(endpoint),
                self.connect_timeout_ms,
            )?);
        }

        resources.sni_matches = route_set
            .tls
            .iter()
            .map(|tls| SniMatch {
                hosts: tls.hosts.clone(),
                cert_source: SecretRef {
                    namespace: tls.secret_namespace.clone(),
                    name: tls.secret_name.clone(),
                },
                certificates: CertificatePair {
                    certificate_chain: tls.certificate_pem.as_bytes().to_vec(),
                    private_key: tls.private_key_pem.as_bytes().to_vec(),
                },
            })
            .collect();

        debug!(
            owner = %owner,
            external_virtual_hosts = resources.external_virtual_hosts.len(),
            internal_virtual_hosts = resources.internal_virtual_hosts.len(),
            clusters = resources.clusters.len(),
            sni_matches = resources.sni_matches.len(),
            "Translated route set"
        );
        Ok((owner, resources))
    }

    fn route_spec(
        &self,
        route_set: &RouteSet,
        rule_index: usize,
        path_index: usize,
        path: &PathRule,
    ) -> RouteSpec {
        let target = match path.backends.as_slice() {
            [only] => RouteTarget::Cluster(only.cluster_name(&route_set.namespace)),
            several => RouteTarget::Weighted(
                several
                    .iter()
                    .map(|backend| WeightedTarget {
                        cluster: backend.cluster_name(&route_set.namespace),
                        weight: backend.weight,
                    })
                    .collect(),
            ),
        };

        RouteSpec {
            name: format!("{}/{}-{}-{}", route_set.namespace, route_set.name, rule_index, path_index),
            prefix: path.prefix.clone(),
            target,
            timeout_ms: path.timeout_ms,
            headers_to_add: path
                .append_headers
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }

    fn virtual_host(
        &self,
        name: &str,
        route_set: &RouteSet,
        rule: &HostRule,
        routes: Vec<Route>,
    ) -> VirtualHost {
        if !self.ext_authz_enabled {
            return build_virtual_host(name, rule.hosts.clone(), routes);
        }

        let mut context: HashMap<String, String> = route_set
            .authz_context
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        context.insert(AUTHZ_CLIENT_KEY.to_string(), AUTHZ_CLIENT_NAME.to_string());
        context.insert(AUTHZ_VISIBILITY_KEY.to_string(), rule.visibility.to_string());
        build_virtual_host_with_authz_context(name, &context, rule.hosts.clone(), routes)
    }
}
