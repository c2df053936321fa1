//! Database drivers and their per-instance lifecycle.
//!
//! Every engine implements the same lifecycle:
//! - `init` stores the configuration (no network I/O)
//! - `connect` proves the instance is reachable and in a supported state
//! - `prepare` captures settings that `quiesce` is about to change
//! - `quiesce` freezes writes for a consistent snapshot
//! - `unquiesce` resumes writes and restores captured settings
//!
//! The engine set is closed, so [`Driver`] is a sum type dispatched by
//! exhaustive match. Each engine reaches the network through a narrow
//! connector trait so its protocol logic can run against in-memory fakes.

pub mod manager;
pub mod mongo;
pub mod mysql;
pub mod poll;
pub mod postgres;
pub mod redis;
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use thiserror::Error;

use crate::crd::{AppHookSpec, PARAM_QUIESCE_FROM_PRIMARY, PreservedConfig, Provider, QuiesceResult};

pub use manager::DriverManager;
pub use mongo::MongoDriver;
pub use mysql::MySqlDriver;
pub use poll::{PollPolicy, Poller};
pub use postgres::PgDriver;
pub use redis::RedisDriver;
pub use registry::{InstanceRegistry, SharedManager};

/// Timeout for establishing a connection to any engine
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors reported by drivers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// Spec or credential problem; retrying without a change will not help
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },
}

/// Coarse classification used by the reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connectivity,
    Operation,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Configuration(_) => ErrorKind::Configuration,
            DriverError::Connectivity(_) => ErrorKind::Connectivity,
            DriverError::Operation(_) | DriverError::Timeout { .. } => ErrorKind::Operation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Configuration
    }

    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        DriverError::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

/// Username and password read from the credential secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Everything a driver needs to reach one instance
#[derive(Clone, Debug, PartialEq)]
pub struct DriverConfig {
    pub name: String,
    pub provider: Provider,
    /// Endpoint as `host[:port]`
    pub host: String,
    pub databases: Vec<String>,
    pub username: String,
    pub password: String,
    pub quiesce_from_primary: bool,
    pub params: BTreeMap<String, String>,
    /// Upper bound for long running engine operations
    pub operation_timeout: Option<Duration>,
}

impl DriverConfig {
    pub fn from_spec(spec: &AppHookSpec, provider: Provider, credentials: &Credentials) -> Self {
        let operation_timeout = spec
            .timeout_seconds
            .and_then(|t| u64::try_from(t).ok())
            .filter(|t| *t > 0)
            .map(Duration::from_secs);

        Self {
            name: spec.name.clone(),
            provider,
            host: spec.end_point.clone(),
            databases: spec.databases.clone(),
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            quiesce_from_primary: spec
                .params
                .get(PARAM_QUIESCE_FROM_PRIMARY)
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            params: spec.params.clone(),
            operation_timeout,
        }
    }

    /// Whether `other` reaches the instance differently and needs a reconnect.
    ///
    /// Databases compare as sets.
    pub fn connection_changed(&self, other: &DriverConfig) -> bool {
        let ours: BTreeSet<&String> = self.databases.iter().collect();
        let theirs: BTreeSet<&String> = other.databases.iter().collect();

        self.host != other.host
            || ours != theirs
            || self.username != other.username
            || self.password != other.password
            || self.params != other.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Split the endpoint into host and port
    pub fn endpoint(&self) -> Result<(String, u16), DriverError> {
        split_endpoint(&self.host, self.provider.default_port())
    }

    pub fn password(&self) -> Option<&str> {
        if self.password.is_empty() {
            None
        } else {
            Some(&self.password)
        }
    }
}

/// Split `host[:port]`, falling back to `default_port`.
///
/// Bracketed IPv6 literals (`[::1]:5432`) are accepted.
pub fn split_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16), DriverError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(DriverError::Configuration("endpoint is empty".to_string()));
    }

    if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            DriverError::Configuration(format!("invalid endpoint '{}'", endpoint))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(endpoint, port)?,
            None if tail.is_empty() => default_port,
            None => {
                return Err(DriverError::Configuration(format!(
                    "invalid endpoint '{}'",
                    endpoint
                )));
            }
        };
        return Ok((host.to_string(), port));
    }

    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(DriverError::Configuration(format!(
                    "invalid endpoint '{}'",
                    endpoint
                )));
            }
            Ok((host.to_string(), parse_port(endpoint, port)?))
        }
        Some(_) => Ok((endpoint.to_string(), default_port)),
        None => Ok((endpoint.to_string(), default_port)),
    }
}

fn parse_port(endpoint: &str, port: &str) -> Result<u16, DriverError> {
    port.parse::<u16>()
        .map_err(|_| DriverError::Configuration(format!("invalid port in endpoint '{}'", endpoint)))
}

/// One engine driver
pub enum Driver {
    MySql(MySqlDriver),
    Postgres(PgDriver),
    MongoDb(MongoDriver),
    Redis(RedisDriver),
}

impl Driver {
    /// Build the live driver for a provider
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::MySql => Driver::MySql(MySqlDriver::live()),
            Provider::Postgres => Driver::Postgres(PgDriver::live()),
            Provider::MongoDb => Driver::MongoDb(MongoDriver::live()),
            Provider::Redis => Driver::Redis(RedisDriver::live()),
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            Driver::MySql(_) => Provider::MySql,
            Driver::Postgres(_) => Provider::Postgres,
            Driver::MongoDb(_) => Provider::MongoDb,
            Driver::Redis(_) => Provider::Redis,
        }
    }

    pub fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        match self {
            Driver::MySql(d) => d.init(config),
            Driver::Postgres(d) => d.init(config),
            Driver::MongoDb(d) => d.init(config),
            Driver::Redis(d) => d.init(config),
        }
    }

    /// Whether the driver owns sessions whose loss would end a quiesce
    pub fn holds_sessions(&self) -> bool {
        match self {
            Driver::MySql(d) => !d.locked_databases().is_empty(),
            Driver::Postgres(d) => !d.held_databases().is_empty(),
            Driver::MongoDb(_) | Driver::Redis(_) => false,
        }
    }

    /// Close every connection the driver holds
    pub async fn close(&mut self) {
        match self {
            Driver::MySql(d) => d.close().await,
            Driver::Postgres(d) => d.close(),
            Driver::MongoDb(d) => d.close(),
            Driver::Redis(d) => d.close().await,
        }
    }

    pub async fn connect(&mut self) -> Result<(), DriverError> {
        match self {
            Driver::MySql(d) => d.connect().await,
            Driver::Postgres(d) => d.connect().await,
            Driver::MongoDb(d) => d.connect().await,
            Driver::Redis(d) => d.connect().await,
        }
    }

    pub async fn prepare(&mut self) -> Result<Option<PreservedConfig>, DriverError> {
        match self {
            Driver::Redis(d) => d.prepare().await,
            Driver::MySql(_) | Driver::Postgres(_) | Driver::MongoDb(_) => Ok(None),
        }
    }

    pub async fn quiesce(&mut self) -> Result<QuiesceResult, DriverError> {
        match self {
            Driver::MySql(d) => Ok(QuiesceResult {
                mysql: Some(d.quiesce().await?),
                ..Default::default()
            }),
            Driver::Postgres(d) => Ok(QuiesceResult {
                pg: Some(d.quiesce().await?),
                ..Default::default()
            }),
            Driver::MongoDb(d) => Ok(QuiesceResult {
                mongo: Some(d.quiesce().await?),
                ..Default::default()
            }),
            Driver::Redis(d) => Ok(QuiesceResult {
                redis: Some(d.quiesce().await?),
                ..Default::default()
            }),
        }
    }

    pub async fn unquiesce(
        &mut self,
        preserved: Option<&PreservedConfig>,
    ) -> Result<(), DriverError> {
        match self {
            Driver::MySql(d) => d.unquiesce().await,
            Driver::Postgres(d) => d.unquiesce().await,
            Driver::MongoDb(d) => d.unquiesce().await,
            Driver::Redis(d) => d.unquiesce(preserved).await,
        }
    }
}

/// Fetch the stored configuration or fail with a configuration error
pub(crate) fn require_config(config: Option<&DriverConfig>) -> Result<&DriverConfig, DriverError> {
    config.ok_or_else(|| DriverError::Configuration("driver used before init".to_string()))
}
