//! # Configuration Management
//!
//! Runtime configuration for the synchronizer, read from `EDGESYNC_*`
//! environment variables and validated with the `validator` crate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::xds::filters::ext_authz::ExtAuthzSettings;
use crate::xds::listener::CertificatePair;
use crate::{Error, Result};

/// Ports of the listeners derived from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerPorts {
    /// Plain-text listener for externally visible hosts (`None` disables it)
    pub external_http: Option<u32>,

    /// TLS listener for externally visible hosts
    pub external_https: u32,

    /// Plain-text listener for cluster-local hosts (`None` disables it)
    pub internal_http: Option<u32>,
}

impl Default for ListenerPorts {
    fn default() -> Self {
        Self { external_http: Some(8080), external_https: 8443, internal_http: Some(8081) }
    }
}

impl ListenerPorts {
    /// Every enabled port, in listener order.
    pub fn enabled(&self) -> Vec<u32> {
        let mut ports = Vec::with_capacity(3);
        ports.extend(self.external_http);
        ports.push(self.external_https);
        ports.extend(self.internal_http);
        ports
    }
}

/// Files holding the certificate served when no per-host SNI is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultCertificatePaths {
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
}

impl DefaultCertificatePaths {
    /// Read both files; failures surface as I/O errors.
    pub fn load(&self) -> Result<CertificatePair> {
        Ok(CertificatePair {
            certificate_chain: std::fs::read(&self.certificate_path)?,
            private_key: std::fs::read(&self.private_key_path)?,
        })
    }
}

/// Logging and metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Prometheus exporter port (0 = disabled)
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}

/// Synchronizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SyncConfig {
    /// Node identity snapshots are published under
    #[validate(length(min = 1, message = "Node id cannot be empty"))]
    pub node_id: String,

    pub ports: ListenerPorts,

    /// Upper bound for each SetSnapshot call
    #[validate(range(min = 1, message = "Publish timeout must be at least 1ms"))]
    pub publish_timeout_ms: u64,

    /// External authorization service, when requests must be checked
    #[validate(nested)]
    pub ext_authz: Option<ExtAuthzSettings>,

    pub default_certificate: Option<DefaultCertificatePaths>,

    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            node_id: "edge-gateway".to_string(),
            ports: ListenerPorts::default(),
            publish_timeout_ms: 5000,
            ext_authz: None,
            default_certificate: None,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any variable source; unset variables fall
    /// back to defaults, unparseable ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let node_id = lookup("EDGESYNC_NODE_ID").unwrap_or(defaults.node_id);

        let ports = ListenerPorts {
            external_http: optional_port(&lookup, "EDGESYNC_HTTP_PORT", defaults.ports.external_http)?,
            external_https: parse_var(&lookup, "EDGESYNC_HTTPS_PORT")?
                .unwrap_or(defaults.ports.external_https),
            internal_http: optional_port(
                &lookup,
                "EDGESYNC_INTERNAL_HTTP_PORT",
                defaults.ports.internal_http,
            )?,
        };

        let publish_timeout_ms = parse_var(&lookup, "EDGESYNC_PUBLISH_TIMEOUT_MS")?
            .unwrap_or(defaults.publish_timeout_ms);

        let ext_authz = match lookup("EDGESYNC_EXT_AUTHZ_HOST") {
            Some(host) => Some(ExtAuthzSettings {
                host,
                port: parse_var(&lookup, "EDGESYNC_EXT_AUTHZ_PORT")?.ok_or_else(|| {
                    Error::config("EDGESYNC_EXT_AUTHZ_PORT is required when EDGESYNC_EXT_AUTHZ_HOST is set")
                })?,
                timeout_ms: parse_var(&lookup, "EDGESYNC_EXT_AUTHZ_TIMEOUT_MS")?.unwrap_or(2000),
                failure_mode_allow: parse_bool(&lookup, "EDGESYNC_EXT_AUTHZ_FAILURE_MODE_ALLOW")
                    .unwrap_or(false),
            }),
            None => None,
        };

        let default_certificate = match (
            lookup("EDGESYNC_DEFAULT_CERT_PATH"),
            lookup("EDGESYNC_DEFAULT_KEY_PATH"),
        ) {
            (Some(cert), Some(key)) => Some(DefaultCertificatePaths {
                certificate_path: PathBuf::from(cert),
                private_key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::config(
                    "EDGESYNC_DEFAULT_CERT_PATH and EDGESYNC_DEFAULT_KEY_PATH must be set together",
                ))
            }
        };

        let observability = ObservabilityConfig {
            log_level: lookup("EDGESYNC_LOG_LEVEL").unwrap_or(defaults.observability.log_level),
            json_logging: parse_bool(&lookup, "EDGESYNC_JSON_LOGGING")
                .unwrap_or(defaults.observability.json_logging),
            enable_metrics: parse_bool(&lookup, "EDGESYNC_ENABLE_METRICS")
                .unwrap_or(defaults.observability.enable_metrics),
            metrics_port: parse_var(&lookup, "EDGESYNC_METRICS_PORT")?
                .unwrap_or(defaults.observability.metrics_port),
        };

        Ok(Self {
            node_id,
            ports,
            publish_timeout_ms,
            ext_authz,
            default_certificate,
            observability,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        let ports = self.ports.enabled();
        for (i, port) in ports.iter().enumerate() {
            if *port == 0 || *port > 65535 {
                return Err(Error::config(format!("Listener port {} is out of range", port)));
            }
            if ports[..i].contains(port) {
                return Err(Error::config(format!("Listener port {} is used twice", port)));
            }
        }
        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::config(format!("Invalid {} '{}': {}", key, raw, e)))
        })
        .transpose()
}

/// A port variable where `0` disables the listener.
fn optional_port<F>(lookup: &F, key: &str, default: Option<u32>) -> Result<Option<u32>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(match parse_var::<F, u32>(lookup, key)? {
        Some(0) => None,
        Some(port) => Some(port),
        None => default,
    })
}

fn parse_bool<F>(lookup: &F, key: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).map(|s| s.to_lowercase() == "true" || s == "1")
}
