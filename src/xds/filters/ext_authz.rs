//! External Authorization (ext_authz) HTTP filter configuration
//!
//! The HTTP connection manager carries one gRPC ext_authz filter when an
//! authorization service is configured; virtual hosts then forward opaque
//! context extensions to that service through a per-filter override.

use std::collections::HashMap;

use crate::xds::filters::any_from_message;
use envoy_types::pb::envoy::config::core::v3::{grpc_service, ApiVersion, GrpcService};
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3::{
    ext_authz::Services, ext_authz_per_route::Override, CheckSettings, ExtAuthz as ExtAuthzProto,
    ExtAuthzPerRoute as ExtAuthzPerRouteProto,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_filter::ConfigType as HttpFilterConfigType, HttpFilter,
};
use envoy_types::pb::google::protobuf::{Any as EnvoyAny, Duration};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Filter identifier used both in the HCM filter list and as the key of
/// per-filter overrides.
pub const EXT_AUTHZ_FILTER_NAME: &str = "envoy.filters.http.ext_authz";
pub const EXT_AUTHZ_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
pub const EXT_AUTHZ_PER_ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthzPerRoute";
/// Name of the cluster that fronts the authorization service.
pub const EXT_AUTHZ_CLUSTER_NAME: &str = "extAuthz";

/// Location and behaviour of the external authorization service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ExtAuthzSettings {
    /// Hostname or IP of the gRPC authorization service
    #[validate(length(min = 1, message = "ext_authz host cannot be empty"))]
    pub host: String,

    /// Port of the authorization service
    #[validate(range(min = 1, max = 65535, message = "ext_authz port must be between 1 and 65535"))]
    pub port: u32,

    /// Timeout for each check call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Let requests through when the service cannot be reached
    #[serde(default)]
    pub failure_mode_allow: bool,
}

fn default_timeout_ms() -> u64 {
    2000
}

fn duration_from_millis(ms: u64) -> Duration {
    Duration { seconds: (ms / 1000) as i64, nanos: ((ms % 1000) * 1_000_000) as i32 }
}

/// Build the ext_authz HTTP filter that calls the authorization cluster over gRPC.
pub fn build_ext_authz_filter(settings: &ExtAuthzSettings) -> HttpFilter {
    let proto = ExtAuthzProto {
        services: Some(Services::GrpcService(GrpcService {
            target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                grpc_service::EnvoyGrpc {
                    cluster_name: EXT_AUTHZ_CLUSTER_NAME.to_string(),
                    ..Default::default()
                },
            )),
            timeout: Some(duration_from_millis(settings.timeout_ms)),
            ..Default::default()
        })),
        transport_api_version: ApiVersion::V3 as i32,
        failure_mode_allow: settings.failure_mode_allow,
        ..Default::default()
    };

    HttpFilter {
        name: EXT_AUTHZ_FILTER_NAME.to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(any_from_message(
            EXT_AUTHZ_TYPE_URL,
            &proto,
        ))),
        ..Default::default()
    }
}

/// Per-filter override carrying context extensions for the check request.
pub fn build_ext_authz_per_route(context_extensions: &HashMap<String, String>) -> EnvoyAny {
    let proto = ExtAuthzPerRouteProto {
        r#override: Some(Override::CheckSettings(CheckSettings {
            context_extensions: context_extensions.clone(),
            ..Default::default()
        })),
    };
    any_from_message(EXT_AUTHZ_PER_ROUTE_TYPE_URL, &proto)
}
