//! Snapshots: immutable, versioned collections of xDS resources.
//!
//! A [`ResourceGraph`] is the merged configuration produced by the cache; a
//! [`Snapshot`] is that graph frozen under a version and handed to the proxy
//! control endpoint. Snapshots are never mutated: warming produces a new one.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;
use sha2::{Digest, Sha256};

use crate::xds::cluster::eds_service_name;
use crate::xds::filters::any_from_message;
use crate::xds::listener::rds_route_names;
use crate::xds::route::route_cluster_names;
use crate::{Error, Result};

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";

/// Suffix distinguishing the intermediate warm-up snapshot's version.
pub const WARM_VERSION_SUFFIX: &str = "-warm";

/// Resource kinds carried by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    Cluster,
    Endpoint,
    Listener,
    Route,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] =
        [ResourceKind::Cluster, ResourceKind::Endpoint, ResourceKind::Listener, ResourceKind::Route];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => CLUSTER_TYPE_URL,
            ResourceKind::Endpoint => ENDPOINT_TYPE_URL,
            ResourceKind::Listener => LISTENER_TYPE_URL,
            ResourceKind::Route => ROUTE_TYPE_URL,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::Listener => "listener",
            ResourceKind::Route => "route",
        };
        f.write_str(name)
    }
}

/// A single xDS resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Cluster(Cluster),
    Endpoint(ClusterLoadAssignment),
    Listener(Listener),
    Route(RouteConfiguration),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Cluster(_) => ResourceKind::Cluster,
            Resource::Endpoint(_) => ResourceKind::Endpoint,
            Resource::Listener(_) => ResourceKind::Listener,
            Resource::Route(_) => ResourceKind::Route,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Cluster(cluster) => &cluster.name,
            Resource::Endpoint(assignment) => &assignment.cluster_name,
            Resource::Listener(listener) => &listener.name,
            Resource::Route(route) => &route.name,
        }
    }

    /// Pack the resource for an xDS response.
    pub fn to_any(&self) -> Any {
        let type_url = self.kind().type_url();
        match self {
            Resource::Cluster(msg) => any_from_message(type_url, msg),
            Resource::Endpoint(msg) => any_from_message(type_url, msg),
            Resource::Listener(msg) => any_from_message(type_url, msg),
            Resource::Route(msg) => any_from_message(type_url, msg),
        }
    }

    fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            Resource::Cluster(msg) => msg.encode_to_vec(),
            Resource::Endpoint(msg) => msg.encode_to_vec(),
            Resource::Listener(msg) => msg.encode_to_vec(),
            Resource::Route(msg) => msg.encode_to_vec(),
        }
    }
}

/// Resources grouped by kind, unique by name within a kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceGraph {
    resources: BTreeMap<ResourceKind, Vec<Resource>>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource, merging exact duplicates.
    ///
    /// A second resource with the same kind and name but different contents
    /// is an error.
    pub fn insert(&mut self, resource: Resource) -> Result<()> {
        let items = self.resources.entry(resource.kind()).or_default();
        match items.iter().find(|existing| existing.name() == resource.name()) {
            Some(existing) if *existing == resource => Ok(()),
            Some(_) => Err(Error::DuplicateResource {
                kind: resource.kind(),
                name: resource.name().to_string(),
            }),
            None => {
                items.push(resource);
                Ok(())
            }
        }
    }

    pub fn extend<I: IntoIterator<Item = Resource>>(&mut self, resources: I) -> Result<()> {
        resources.into_iter().try_for_each(|resource| self.insert(resource))
    }

    pub fn get(&self, kind: ResourceKind) -> &[Resource] {
        self.resources.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An immutable, versioned set of resources for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    version: String,
    resources: BTreeMap<ResourceKind, Vec<Resource>>,
}

impl Snapshot {
    /// Snapshot with no resources of any kind.
    pub fn empty() -> Self {
        Self { version: String::new(), resources: BTreeMap::new() }
    }

    /// Freeze a graph; the version is derived from the encoded contents, so
    /// equal graphs always produce equal versions.
    pub fn from_graph(graph: ResourceGraph) -> Self {
        let version = content_version(&graph.resources);
        Self { version, resources: graph.resources }
    }

    /// Snapshot with an explicit version, for callers that manage versions.
    pub fn with_version(version: impl Into<String>, graph: ResourceGraph) -> Self {
        Self { version: version.into(), resources: graph.resources }
    }

    /// Intermediate snapshot that pre-registers the new clusters.
    ///
    /// Every kind except clusters is copied from `old` unchanged. Clusters
    /// are the union of both snapshots keyed by name, new definitions taking
    /// precedence; clusters only present in `old` stay until the commit.
    pub fn warm(old: &Snapshot, new: &Snapshot) -> Self {
        let mut resources = old.resources.clone();

        let new_clusters = new.get(ResourceKind::Cluster);
        let mut clusters: Vec<Resource> = old
            .get(ResourceKind::Cluster)
            .iter()
            .map(|old_cluster| {
                new_clusters
                    .iter()
                    .find(|candidate| candidate.name() == old_cluster.name())
                    .unwrap_or(old_cluster)
                    .clone()
            })
            .collect();
        for cluster in new_clusters {
            if !clusters.iter().any(|existing| existing.name() == cluster.name()) {
                clusters.push(cluster.clone());
            }
        }

        if clusters.is_empty() {
            resources.remove(&ResourceKind::Cluster);
        } else {
            resources.insert(ResourceKind::Cluster, clusters);
        }

        Self { version: format!("{}{}", new.version, WARM_VERSION_SUFFIX), resources }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, kind: ResourceKind) -> &[Resource] {
        self.resources.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn names(&self, kind: ResourceKind) -> Vec<&str> {
        self.get(kind).iter().map(Resource::name).collect()
    }

    pub fn total_resources(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_resources() == 0
    }

    /// Check that every cross-kind reference resolves inside this snapshot:
    /// listener RDS names to routes, route actions to clusters, and EDS
    /// clusters to endpoints.
    pub fn consistent(&self) -> Result<()> {
        let routes = self.name_set(ResourceKind::Route);
        let clusters = self.name_set(ResourceKind::Cluster);
        let endpoints = self.name_set(ResourceKind::Endpoint);

        for resource in self.get(ResourceKind::Listener) {
            if let Resource::Listener(listener) = resource {
                for route_name in rds_route_names(listener)? {
                    if !routes.contains(route_name.as_str()) {
                        return Err(dangling(resource, route_name));
                    }
                }
            }
        }

        for resource in self.get(ResourceKind::Route) {
            if let Resource::Route(route_config) = resource {
                for cluster_name in route_cluster_names(route_config) {
                    if !clusters.contains(cluster_name.as_str()) {
                        return Err(dangling(resource, cluster_name));
                    }
                }
            }
        }

        for resource in self.get(ResourceKind::Cluster) {
            if let Resource::Cluster(cluster) = resource {
                if let Some(service_name) = eds_service_name(cluster) {
                    if !endpoints.contains(service_name.as_str()) {
                        return Err(dangling(resource, service_name));
                    }
                }
            }
        }

        Ok(())
    }

    fn name_set(&self, kind: ResourceKind) -> HashSet<&str> {
        self.get(kind).iter().map(Resource::name).collect()
    }
}

fn dangling(resource: &Resource, reference: String) -> Error {
    Error::InconsistentSnapshot {
        kind: resource.kind(),
        resource: resource.name().to_string(),
        reference,
    }
}

fn content_version(resources: &BTreeMap<ResourceKind, Vec<Resource>>) -> String {
    let mut hasher = Sha256::new();
    for (kind, items) in resources {
        hasher.update(kind.type_url().as_bytes());
        for item in items {
            let encoded = item.encode_to_vec();
            hasher.update((encoded.len() as u64).to_be_bytes());
            hasher.update(&encoded);
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::cluster::{build_cluster, BackendEndpoint};
    use envoy_types::pb::envoy::config::cluster::v3::cluster::{ClusterDiscoveryType, DiscoveryType};
    use crate::xds::listener::{build_http_connection_manager, build_plain_listener};
    use crate::xds::route::{
        build_route, build_route_configuration, build_virtual_host, RouteSpec, RouteTarget,
    };

    fn cluster(name: &str) -> Resource {
        let endpoint = BackendEndpoint { address: format!("{}.svc", name), port: 80 };
        Resource::Cluster(build_cluster(name, &[endpoint], 1000).expect("cluster"))
    }

    fn route_config(name: &str, cluster_name: &str) -> Resource {
        let route = build_route(&RouteSpec {
            name: "r".into(),
            prefix: "/".into(),
            target: RouteTarget::Cluster(cluster_name.into()),
            timeout_ms: None,
            headers_to_add: Vec::new(),
        })
        .expect("route");
        Resource::Route(build_route_configuration(
            name,
            vec![build_virtual_host("vh", vec!["*".into()], vec![route])],
        ))
    }

    fn listener(port: u32, route_name: &str) -> Resource {
        let hcm = build_http_connection_manager(route_name, None);
        Resource::Listener(build_plain_listener(&hcm, port).expect("listener"))
    }

    fn snapshot(resources: Vec<Resource>) -> Snapshot {
        let mut graph = ResourceGraph::new();
        graph.extend(resources).expect("graph");
        Snapshot::from_graph(graph)
    }

    #[test]
    fn graph_merges_identical_duplicates_and_rejects_conflicts() {
        let mut graph = ResourceGraph::new();
        graph.insert(cluster("a")).unwrap();
        graph.insert(cluster("a")).unwrap();
        assert_eq!(graph.get(ResourceKind::Cluster).len(), 1);

        let endpoint = BackendEndpoint { address: "other.svc".into(), port: 81 };
        let conflicting = Resource::Cluster(build_cluster("a", &[endpoint], 1000).unwrap());
        let err = graph.insert(conflicting).expect_err("conflict");
        assert!(matches!(err, Error::DuplicateResource { kind: ResourceKind::Cluster, .. }));
    }

    #[test]
    fn version_tracks_content() {
        let first = snapshot(vec![cluster("a")]);
        let same = snapshot(vec![cluster("a")]);
        let different = snapshot(vec![cluster("b")]);

        assert_eq!(first.version(), same.version());
        assert_ne!(first.version(), different.version());
        assert_eq!(first.version().len(), 64);
    }

    #[test]
    fn consistent_snapshot_passes() {
        let snap = snapshot(vec![
            cluster("a"),
            route_config("external_services", "a"),
            listener(8080, "external_services"),
        ]);
        assert!(snap.consistent().is_ok());
    }

    #[test]
    fn missing_route_configuration_is_reported() {
        let snap = snapshot(vec![listener(8080, "external_services")]);
        match snap.consistent() {
            Err(Error::InconsistentSnapshot { kind, resource, reference }) => {
                assert_eq!(kind, ResourceKind::Listener);
                assert_eq!(resource, "listener_8080");
                assert_eq!(reference, "external_services");
            }
            other => panic!("expected inconsistency, got {:?}", other),
        }
    }

    #[test]
    fn missing_cluster_is_reported() {
        let snap = snapshot(vec![route_config("external_services", "gone")]);
        let err = snap.consistent().expect_err("dangling cluster");
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn eds_cluster_needs_endpoints() {
        let eds = Resource::Cluster(Cluster {
            name: "eds".into(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            ..Default::default()
        });
        assert!(snapshot(vec![eds.clone()]).consistent().is_err());

        let assignment = Resource::Endpoint(ClusterLoadAssignment {
            cluster_name: "eds".into(),
            ..Default::default()
        });
        assert!(snapshot(vec![eds, assignment]).consistent().is_ok());
    }

    #[test]
    fn warm_snapshot_unions_clusters_and_keeps_everything_else() {
        let old = snapshot(vec![
            cluster("a"),
            cluster("b"),
            route_config("external_services", "a"),
            listener(8080, "external_services"),
        ]);
        let new = snapshot(vec![
            cluster("b"),
            cluster("c"),
            route_config("external_services", "c"),
            listener(8080, "external_services"),
        ]);

        let warm = Snapshot::warm(&old, &new);

        assert_eq!(warm.names(ResourceKind::Cluster), vec!["a", "b", "c"]);
        for kind in [ResourceKind::Listener, ResourceKind::Route, ResourceKind::Endpoint] {
            assert_eq!(warm.get(kind), old.get(kind));
        }
        assert_eq!(warm.version(), format!("{}-warm", new.version()));
        assert!(warm.consistent().is_ok());
    }

    #[test]
    fn to_any_uses_kind_type_url() {
        let any = cluster("a").to_any();
        assert_eq!(any.type_url, CLUSTER_TYPE_URL);
        let decoded = Cluster::decode(any.value.as_slice()).expect("decode");
        assert_eq!(decoded.name, "a");
    }
}
