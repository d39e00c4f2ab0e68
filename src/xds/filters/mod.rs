//! Typed-config helpers shared by the listener, route and cluster builders.
//!
//! Envoy carries filter and extension configuration as `google.protobuf.Any`
//! payloads; everything that needs to pack a prost message goes through
//! [`any_from_message`] so the type URL and the encoded bytes never drift.

pub mod ext_authz;

use envoy_types::pb::google::protobuf::Any;
use prost::Message;

pub const HTTP_CONNECTION_MANAGER_FILTER_NAME: &str =
    "envoy.filters.network.http_connection_manager";
pub const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
pub const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
pub const TLS_INSPECTOR_FILTER_NAME: &str = "envoy.filters.listener.tls_inspector";
pub const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
pub const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
pub const TLS_TRANSPORT_SOCKET_NAME: &str = "envoy.transport_sockets.tls";

/// Pack a prost message into an Envoy `Any`.
pub fn any_from_message<M: Message>(type_url: impl Into<String>, msg: &M) -> Any {
    Any { type_url: type_url.into(), value: msg.encode_to_vec() }
}

/// Decode the payload of an `Any`, checking its type URL first.
pub fn message_from_any<M: Message + Default>(any: &Any, type_url: &str) -> crate::Result<M> {
    if any.type_url != type_url {
        return Err(crate::Error::encoding(format!(
            "expected typed config '{}', found '{}'",
            type_url, any.type_url
        )));
    }
    M::decode(any.value.as_slice())
        .map_err(|err| crate::Error::encoding(format!("failed to decode '{}': {}", type_url, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;

    #[test]
    fn any_round_trips_through_type_url() {
        let any = any_from_message(ROUTER_TYPE_URL, &Router::default());
        assert_eq!(any.type_url, ROUTER_TYPE_URL);
        let decoded: Router = message_from_any(&any, ROUTER_TYPE_URL).expect("decode router");
        assert_eq!(decoded, Router::default());
    }

    #[test]
    fn mismatched_type_url_is_rejected() {
        let any = any_from_message(ROUTER_TYPE_URL, &Router::default());
        let result: crate::Result<Router> = message_from_any(&any, TLS_INSPECTOR_TYPE_URL);
        assert!(matches!(result, Err(crate::Error::Encoding(_))));
    }
}
