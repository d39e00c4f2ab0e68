//! # Structured Logging
//!
//! Subscriber setup and span macros for the synchronizer.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{ObservabilityConfig, SyncConfig};

/// Create a tracing span for xDS operations
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $node_id:expr) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $node_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns `false`
/// when a subscriber was already installed (e.g. by a test harness).
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let installed = if config.json_logging {
        tracing::subscriber::set_global_default(
            fmt().json().with_env_filter(filter).with_current_span(true).finish(),
        )
    } else {
        tracing::subscriber::set_global_default(fmt().with_env_filter(filter).finish())
    };

    installed.is_ok()
}

/// Log configuration at startup
pub fn log_config_info(config: &SyncConfig) {
    tracing::info!(
        node_id = %config.node_id,
        external_http_port = ?config.ports.external_http,
        external_https_port = config.ports.external_https,
        internal_http_port = ?config.ports.internal_http,
        publish_timeout_ms = config.publish_timeout_ms,
        ext_authz_enabled = config.ext_authz.is_some(),
        default_certificate = config.default_certificate.is_some(),
        metrics_enabled = config.observability.enable_metrics,
        "edgesync configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xds_span_creation() {
        let _span = crate::xds_span!("sync_pass", "node-a");
        let _span = crate::xds_span!("sync_pass", "node-a", phase = "warming");
    }

    #[test]
    fn test_second_init_reports_existing_subscriber() {
        let config = ObservabilityConfig::default();
        init_logging(&config);
        assert!(!init_logging(&config));
    }
}
