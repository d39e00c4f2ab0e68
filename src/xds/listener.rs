//! Listener construction using envoy-types
//!
//! Every listener this control plane emits is an HTTP listener backed by an
//! `HttpConnectionManager`. The only thing that varies between them is how the
//! transport is secured, which is captured by [`TransportSecurity`]: plain
//! text, a single certificate, or several certificates selected by SNI.

use std::collections::HashMap;
use std::fmt;

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, config_source::ConfigSourceSpecifier, data_source,
    socket_address::{PortSpecifier, Protocol},
    transport_socket::ConfigType as TransportSocketConfigType, Address, AggregatedConfigSource,
    ApiVersion, ConfigSource, DataSource, SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType, listener_filter::ConfigType as ListenerFilterConfigType,
    Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, DownstreamTlsContext, TlsCertificate,
};
use envoy_types::pb::google::protobuf::Any as EnvoyAny;
use serde::{Deserialize, Serialize};

use crate::xds::filters::ext_authz::{build_ext_authz_filter, ExtAuthzSettings};
use crate::xds::filters::{
    any_from_message, message_from_any, DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
    HTTP_CONNECTION_MANAGER_FILTER_NAME, HTTP_CONNECTION_MANAGER_TYPE_URL, ROUTER_FILTER_NAME,
    ROUTER_TYPE_URL, TLS_INSPECTOR_FILTER_NAME, TLS_INSPECTOR_TYPE_URL, TLS_TRANSPORT_SOCKET_NAME,
};
use crate::{Error, Result};

/// ALPN protocols advertised on every TLS filter chain.
pub const ALPN_PROTOCOLS: [&str; 2] = ["h2", "http/1.1"];

const LISTENER_BIND_ADDRESS: &str = "0.0.0.0";

/// Identity of the secret a certificate pair was read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Certificate chain and private key, kept as opaque bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificatePair {
    pub certificate_chain: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl fmt::Debug for CertificatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificatePair")
            .field("certificate_chain", &format_args!("<{} bytes>", self.certificate_chain.len()))
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// One SNI-selected filter chain: the server names it answers for and the
/// certificate it presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniMatch {
    pub hosts: Vec<String>,
    pub cert_source: SecretRef,
    pub certificates: CertificatePair,
}

/// How a listener secures its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
    /// Plain text, one filter chain
    None,
    /// TLS with one certificate on one filter chain
    SingleCertificate(CertificatePair),
    /// One filter chain per match, selected by SNI before TLS termination
    SniMultiplexed(Vec<SniMatch>),
}

/// Deterministic listener name for a port.
pub fn listener_name(port: u32) -> String {
    format!("listener_{}", port)
}

/// Build a listener on `port` whose filter chains all run `manager`.
///
/// Construction is all-or-nothing: if any chain fails to build, no listener
/// is returned.
pub fn build_listener(
    manager: &HttpConnectionManager,
    port: u32,
    security: &TransportSecurity,
) -> Result<Listener> {
    let (filter_chains, listener_filters) = match security {
        TransportSecurity::None => {
            (vec![FilterChain { filters: create_filters(manager), ..Default::default() }], Vec::new())
        }
        TransportSecurity::SingleCertificate(pair) => (
            vec![FilterChain {
                filters: create_filters(manager),
                transport_socket: Some(create_transport_socket(pair)?),
                ..Default::default()
            }],
            Vec::new(),
        ),
        TransportSecurity::SniMultiplexed(matches) => {
            validate_sni_matches(matches)?;
            let chains = matches
                .iter()
                .map(|sni_match| {
                    create_transport_socket(&sni_match.certificates)
                        .map_err(|err| {
                            Error::encoding(format!(
                                "certificate from secret {}: {}",
                                sni_match.cert_source, err
                            ))
                        })
                        .map(|socket| FilterChain {
                            filter_chain_match: Some(FilterChainMatch {
                                server_names: sni_match.hosts.clone(),
                                ..Default::default()
                            }),
                            filters: create_filters(manager),
                            transport_socket: Some(socket),
                            ..Default::default()
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            // SNI is only visible before TLS termination, hence the inspector.
            (chains, vec![tls_inspector()])
        }
    };

    Ok(Listener {
        name: listener_name(port),
        address: Some(create_address(port)),
        filter_chains,
        listener_filters,
        ..Default::default()
    })
}

/// Plain-text listener with a single filter chain.
pub fn build_plain_listener(manager: &HttpConnectionManager, port: u32) -> Result<Listener> {
    build_listener(manager, port, &TransportSecurity::None)
}

/// TLS listener serving one certificate pair.
pub fn build_tls_listener(
    manager: &HttpConnectionManager,
    port: u32,
    certificate_chain: &[u8],
    private_key: &[u8],
) -> Result<Listener> {
    let pair = CertificatePair {
        certificate_chain: certificate_chain.to_vec(),
        private_key: private_key.to_vec(),
    };
    build_listener(manager, port, &TransportSecurity::SingleCertificate(pair))
}

/// TLS listener with one filter chain per SNI match.
pub fn build_sni_listener(
    manager: &HttpConnectionManager,
    port: u32,
    matches: &[SniMatch],
) -> Result<Listener> {
    build_listener(manager, port, &TransportSecurity::SniMultiplexed(matches.to_vec()))
}

/// HTTP connection manager that fetches `route_config_name` over ADS.
///
/// The ext_authz filter, when configured, runs before the router.
pub fn build_http_connection_manager(
    route_config_name: &str,
    ext_authz: Option<&ExtAuthzSettings>,
) -> HttpConnectionManager {
    let mut http_filters: Vec<HttpFilter> = Vec::with_capacity(2);
    if let Some(settings) = ext_authz {
        http_filters.push(build_ext_authz_filter(settings));
    }
    http_filters.push(HttpFilter {
        name: ROUTER_FILTER_NAME.to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(any_from_message(
            ROUTER_TYPE_URL,
            &Router::default(),
        ))),
        ..Default::default()
    });

    HttpConnectionManager {
        codec_type: CodecType::Auto as i32,
        stat_prefix: route_config_name.to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            route_config_name: route_config_name.to_string(),
            config_source: Some(ConfigSource {
                config_source_specifier: Some(ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource::default(),
                )),
                resource_api_version: ApiVersion::V3 as i32,
                ..Default::default()
            }),
        })),
        http_filters,
        ..Default::default()
    }
}

/// Route configuration names a listener's connection managers fetch via RDS.
pub fn rds_route_names(listener: &Listener) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for chain in &listener.filter_chains {
        for filter in &chain.filters {
            if filter.name != HTTP_CONNECTION_MANAGER_FILTER_NAME {
                continue;
            }
            let Some(FilterConfigType::TypedConfig(any)) = &filter.config_type else {
                continue;
            };
            let manager: HttpConnectionManager =
                message_from_any(any, HTTP_CONNECTION_MANAGER_TYPE_URL)?;
            if let Some(RouteSpecifier::Rds(rds)) = manager.route_specifier {
                if !names.contains(&rds.route_config_name) {
                    names.push(rds.route_config_name);
                }
            }
        }
    }
    Ok(names)
}

/// Port a listener binds to, if it has a socket address.
pub fn listener_port(listener: &Listener) -> Option<u32> {
    match listener.address.as_ref()?.address.as_ref()? {
        AddressType::SocketAddress(socket) => match socket.port_specifier {
            Some(PortSpecifier::PortValue(port)) => Some(port),
            _ => None,
        },
        _ => None,
    }
}

fn validate_sni_matches(matches: &[SniMatch]) -> Result<()> {
    if matches.is_empty() {
        return Err(Error::encoding("SNI listener requires at least one match"));
    }

    let mut seen: HashMap<String, &SecretRef> = HashMap::new();
    for sni_match in matches {
        if sni_match.hosts.is_empty() {
            return Err(Error::encoding(format!(
                "SNI match for secret {} has no hosts",
                sni_match.cert_source
            )));
        }
        for host in &sni_match.hosts {
            if let Some(previous) = seen.insert(host.to_ascii_lowercase(), &sni_match.cert_source) {
                return Err(Error::encoding(format!(
                    "server name '{}' is matched by both secret {} and secret {}",
                    host, previous, sni_match.cert_source
                )));
            }
        }
    }
    Ok(())
}

fn create_address(port: u32) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            protocol: Protocol::Tcp as i32,
            address: LISTENER_BIND_ADDRESS.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

fn create_filters(manager: &HttpConnectionManager) -> Vec<Filter> {
    vec![Filter {
        name: HTTP_CONNECTION_MANAGER_FILTER_NAME.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(any_from_message(
            HTTP_CONNECTION_MANAGER_TYPE_URL,
            manager,
        ))),
    }]
}

fn create_transport_socket(pair: &CertificatePair) -> Result<TransportSocket> {
    let tls_context = create_tls_context(pair)?;
    Ok(TransportSocket {
        name: TLS_TRANSPORT_SOCKET_NAME.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
            DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
            &tls_context,
        ))),
    })
}

fn create_tls_context(pair: &CertificatePair) -> Result<DownstreamTlsContext> {
    if pair.certificate_chain.is_empty() {
        return Err(Error::encoding("certificate chain is empty"));
    }
    if pair.private_key.is_empty() {
        return Err(Error::encoding("private key is empty"));
    }

    Ok(DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            alpn_protocols: ALPN_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            tls_certificates: vec![TlsCertificate {
                certificate_chain: Some(inline_bytes(&pair.certificate_chain)),
                private_key: Some(inline_bytes(&pair.private_key)),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn inline_bytes(bytes: &[u8]) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(bytes.to_vec())),
        ..Default::default()
    }
}

fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: TLS_INSPECTOR_FILTER_NAME.to_string(),
        config_type: Some(ListenerFilterConfigType::TypedConfig(EnvoyAny {
            type_url: TLS_INSPECTOR_TYPE_URL.to_string(),
            value: Vec::new(),
        })),
        ..Default::default()
    }
}
