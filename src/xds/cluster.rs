//! Cluster construction using envoy-types
//!
//! Backends are addressed by hostname, so route-set clusters use STRICT_DNS
//! discovery with an inline load assignment.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType,
    socket_address::{PortSpecifier, Protocol},
    Address, Http2ProtocolOptions, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions},
    HttpProtocolOptions,
};
use envoy_types::pb::google::protobuf::{Any, Duration};
use serde::{Deserialize, Serialize};

use crate::xds::filters::any_from_message;
use crate::xds::filters::ext_authz::{ExtAuthzSettings, EXT_AUTHZ_CLUSTER_NAME};
use crate::{Error, Result};

pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// Default connect timeout for route-set clusters.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// A host:port a cluster load-balances over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendEndpoint {
    pub address: String,
    pub port: u32,
}

fn duration_from_millis(ms: u64) -> Duration {
    Duration { seconds: (ms / 1000) as i64, nanos: ((ms % 1000) * 1_000_000) as i32 }
}

/// STRICT_DNS cluster balancing round-robin over `endpoints`.
pub fn build_cluster(
    name: &str,
    endpoints: &[BackendEndpoint],
    connect_timeout_ms: u64,
) -> Result<Cluster> {
    if endpoints.is_empty() {
        return Err(Error::encoding(format!("cluster '{}' has no endpoints", name)));
    }
    if let Some(endpoint) = endpoints.iter().find(|e| e.address.is_empty() || e.port == 0) {
        return Err(Error::encoding(format!(
            "cluster '{}' has an invalid endpoint '{}:{}'",
            name, endpoint.address, endpoint.port
        )));
    }

    Ok(Cluster {
        name: name.to_string(),
        connect_timeout: Some(duration_from_millis(connect_timeout_ms)),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32)),
        lb_policy: LbPolicy::RoundRobin as i32,
        load_assignment: Some(load_assignment(name, endpoints)),
        ..Default::default()
    })
}

/// HTTP/2 cluster for the gRPC authorization service.
pub fn build_ext_authz_cluster(settings: &ExtAuthzSettings) -> Result<Cluster> {
    let endpoint = BackendEndpoint { address: settings.host.clone(), port: settings.port };
    let mut cluster =
        build_cluster(EXT_AUTHZ_CLUSTER_NAME, &[endpoint], DEFAULT_CONNECT_TIMEOUT_MS)?;
    cluster.typed_extension_protocol_options = http2_protocol_options();
    Ok(cluster)
}

/// Name of the ClusterLoadAssignment an EDS cluster waits for. Route sets
/// only produce STRICT_DNS clusters, but a snapshot already held by the
/// control endpoint may carry EDS ones.
pub fn eds_service_name(cluster: &Cluster) -> Option<String> {
    match cluster.cluster_discovery_type {
        Some(ClusterDiscoveryType::Type(kind)) if kind == DiscoveryType::Eds as i32 => {
            let service_name = cluster
                .eds_cluster_config
                .as_ref()
                .map(|config| config.service_name.clone())
                .unwrap_or_default();
            Some(if service_name.is_empty() { cluster.name.clone() } else { service_name })
        }
        _ => None,
    }
}

fn load_assignment(cluster_name: &str, endpoints: &[BackendEndpoint]) -> ClusterLoadAssignment {
    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![LocalityLbEndpoints {
            lb_endpoints: endpoints
                .iter()
                .map(|endpoint| LbEndpoint {
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                        address: Some(Address {
                            address: Some(AddressType::SocketAddress(SocketAddress {
                                protocol: Protocol::Tcp as i32,
                                address: endpoint.address.clone(),
                                port_specifier: Some(PortSpecifier::PortValue(endpoint.port)),
                                ..Default::default()
                            })),
                        }),
                        ..Default::default()
                    })),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn http2_protocol_options() -> HashMap<String, Any> {
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions::default(),
                )),
            },
        )),
        ..Default::default()
    };

    let mut map = HashMap::new();
    map.insert(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        any_from_message(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::config::cluster::v3::cluster::EdsClusterConfig;

    fn endpoint(address: &str, port: u32) -> BackendEndpoint {
        BackendEndpoint { address: address.to_string(), port }
    }

    #[test]
    fn strict_dns_cluster_lists_all_endpoints() {
        let cluster = build_cluster(
            "default/hello:80",
            &[endpoint("hello.default.svc", 80), endpoint("hello-2.default.svc", 80)],
            1500,
        )
        .expect("cluster");

        assert_eq!(cluster.name, "default/hello:80");
        assert_eq!(
            cluster.cluster_discovery_type,
            Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32))
        );
        let assignment = cluster.load_assignment.expect("load assignment");
        assert_eq!(assignment.endpoints[0].lb_endpoints.len(), 2);
        assert_eq!(eds_service_name(&Cluster::default()), None);
    }

    #[test]
    fn cluster_without_endpoints_is_rejected() {
        assert!(matches!(build_cluster("empty", &[], 1000), Err(Error::Encoding(_))));
        assert!(build_cluster("zero-port", &[endpoint("svc", 0)], 1000).is_err());
    }

    #[test]
    fn eds_service_name_falls_back_to_cluster_name() {
        let mut cluster = Cluster {
            name: "default/eds".into(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            ..Default::default()
        };
        assert_eq!(eds_service_name(&cluster), Some("default/eds".to_string()));

        cluster.eds_cluster_config = Some(EdsClusterConfig {
            service_name: "default/eds-assignment".into(),
            ..Default::default()
        });
        assert_eq!(eds_service_name(&cluster), Some("default/eds-assignment".to_string()));
    }

    #[test]
    fn ext_authz_cluster_speaks_http2() {
        let settings = ExtAuthzSettings {
            host: "authz.auth-system".into(),
            port: 6000,
            timeout_ms: 2000,
            failure_mode_allow: false,
        };
        let cluster = build_ext_authz_cluster(&settings).expect("ext_authz cluster");
        assert_eq!(cluster.name, EXT_AUTHZ_CLUSTER_NAME);
        assert!(cluster.typed_extension_protocol_options.contains_key(HTTP_PROTOCOL_OPTIONS_KEY));
    }
}
