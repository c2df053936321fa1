//! Operator configuration loaded from environment variables

use std::net::SocketAddr;

use thiserror::Error;

/// Health and metrics port when `HEALTH_PORT` is unset
pub const DEFAULT_HEALTH_PORT: u16 = 8080;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Namespace credential secrets must live in, also used for the lease
    pub admin_namespace: String,
    /// Leader election identity and event reporter instance
    pub pod_name: String,
    pub health_addr: SocketAddr,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            admin_namespace: DEFAULT_NAMESPACE.to_string(),
            pod_name: "unknown".to_string(),
            health_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HEALTH_PORT)),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment.
    ///
    /// - `WATCH_NAMESPACE`, then `POD_NAMESPACE`: administrative namespace
    ///   (default `default`)
    /// - `POD_NAME`: holder identity (default: hostname)
    /// - `HEALTH_PORT`: health server port (default 8080)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let admin_namespace = non_empty("WATCH_NAMESPACE")
            .or_else(|| non_empty("POD_NAMESPACE"))
            .unwrap_or_else(|| {
                tracing::warn!("WATCH_NAMESPACE and POD_NAMESPACE not set, using 'default'");
                DEFAULT_NAMESPACE.to_string()
            });

        let pod_name = non_empty("POD_NAME").unwrap_or_else(|| {
            tracing::warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });

        let health_port = match non_empty("HEALTH_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid("HEALTH_PORT", raw.clone()))?,
            None => DEFAULT_HEALTH_PORT,
        };

        Ok(Self {
            admin_namespace,
            pod_name,
            health_addr: SocketAddr::from(([0, 0, 0, 0], health_port)),
        })
    }
}
