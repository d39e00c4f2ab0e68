//! Virtual host and route construction using envoy-types

use std::collections::HashMap;

use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::config::route::v3::{
    route::Action, route_action::ClusterSpecifier, route_match::PathSpecifier,
    weighted_cluster::ClusterWeight, Route, RouteAction, RouteConfiguration, RouteMatch,
    VirtualHost, WeightedCluster,
};
use envoy_types::pb::google::protobuf::{Duration, UInt32Value};
use serde::{Deserialize, Serialize};

use crate::xds::filters::ext_authz::{build_ext_authz_per_route, EXT_AUTHZ_FILTER_NAME};
use crate::{Error, Result};

/// One backend of a weighted split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedTarget {
    pub cluster: String,
    pub weight: u32,
}

/// Where a route sends matching requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Cluster(String),
    Weighted(Vec<WeightedTarget>),
}

/// Inputs for a single prefix route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub name: String,
    pub prefix: String,
    pub target: RouteTarget,
    pub timeout_ms: Option<u64>,
    pub headers_to_add: Vec<(String, String)>,
}

/// Virtual host without per-filter overrides.
pub fn build_virtual_host(name: &str, domains: Vec<String>, routes: Vec<Route>) -> VirtualHost {
    VirtualHost { name: name.to_string(), domains, routes, ..Default::default() }
}

/// Virtual host whose requests carry `context_extensions` to the external
/// authorization service.
pub fn build_virtual_host_with_authz_context(
    name: &str,
    context_extensions: &HashMap<String, String>,
    domains: Vec<String>,
    routes: Vec<Route>,
) -> VirtualHost {
    let mut virtual_host = build_virtual_host(name, domains, routes);
    virtual_host
        .typed_per_filter_config
        .insert(EXT_AUTHZ_FILTER_NAME.to_string(), build_ext_authz_per_route(context_extensions));
    virtual_host
}

/// Prefix route forwarding to a single cluster or a weighted split.
pub fn build_route(spec: &RouteSpec) -> Result<Route> {
    let cluster_specifier = match &spec.target {
        RouteTarget::Cluster(name) => {
            if name.is_empty() {
                return Err(Error::encoding(format!("route '{}' has an empty cluster", spec.name)));
            }
            ClusterSpecifier::Cluster(name.clone())
        }
        RouteTarget::Weighted(targets) => {
            if targets.is_empty() || targets.iter().all(|t| t.weight == 0) {
                return Err(Error::encoding(format!(
                    "route '{}' needs at least one backend with a positive weight",
                    spec.name
                )));
            }
            ClusterSpecifier::WeightedClusters(WeightedCluster {
                clusters: targets
                    .iter()
                    .map(|target| ClusterWeight {
                        name: target.cluster.clone(),
                        weight: Some(UInt32Value { value: target.weight }),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            })
        }
    };

    #[allow(deprecated)]
    let route_action = RouteAction {
        cluster_specifier: Some(cluster_specifier),
        timeout: spec.timeout_ms.map(|ms| Duration {
            seconds: (ms / 1000) as i64,
            nanos: ((ms % 1000) * 1_000_000) as i32,
        }),
        ..Default::default()
    };

    Ok(Route {
        name: spec.name.clone(),
        r#match: Some(RouteMatch {
            path_specifier: Some(PathSpecifier::Prefix(spec.prefix.clone())),
            ..Default::default()
        }),
        action: Some(Action::Route(route_action)),
        request_headers_to_add: spec
            .headers_to_add
            .iter()
            .map(|(key, value)| HeaderValueOption {
                header: Some(HeaderValue {
                    key: key.clone(),
                    value: value.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    })
}

pub fn build_route_configuration(name: &str, virtual_hosts: Vec<VirtualHost>) -> RouteConfiguration {
    RouteConfiguration { name: name.to_string(), virtual_hosts, ..Default::default() }
}

/// Clusters referenced by the route actions of a route configuration.
pub fn route_cluster_names(route_config: &RouteConfiguration) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    };

    for virtual_host in &route_config.virtual_hosts {
        for route in &virtual_host.routes {
            let Some(Action::Route(action)) = &route.action else {
                continue;
            };
            match &action.cluster_specifier {
                Some(ClusterSpecifier::Cluster(name)) => push(name),
                Some(ClusterSpecifier::WeightedClusters(weighted)) => {
                    for cluster in &weighted.clusters {
                        push(&cluster.name);
                    }
                }
                _ => {}
            }
        }
    }
    names
}
