use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Param key: run quiesce against the primary instead of a secondary.
pub const PARAM_QUIESCE_FROM_PRIMARY: &str = "QuiesceFromPrimary";
/// Param key: MySQL lock method (`table` or `instance`).
pub const PARAM_MYSQL_LOCK_METHOD: &str = "mysql-lock-method";
/// Param key: Redis backup method (`rdb` or `aof`).
pub const PARAM_REDIS_BACKUP_METHOD: &str = "redis-backup-method";

pub const MYSQL_TABLE_LOCK: &str = "table";
pub const MYSQL_INSTANCE_LOCK: &str = "instance";
pub const REDIS_BACKUP_RDB: &str = "rdb";
pub const REDIS_BACKUP_AOF: &str = "aof";

/// AppHook describes one database instance and the freeze/resume operation
/// requested against it.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "storage.example.com",
    version = "v1alpha1",
    kind = "AppHook",
    plural = "apphooks",
    shortname = "hook",
    namespaced,
    status = "AppHookStatus",
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.appProvider"}"#,
    printcolumn = r#"{"name":"Operation", "type":"string", "jsonPath":".spec.operationType"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppHookSpec {
    /// Logical name of the backup job this hook belongs to
    pub name: String,

    /// Database engine: mysql, postgres, mongodb or redis
    #[serde(default)]
    pub app_provider: String,

    /// Service endpoint as `host[:port]`
    #[serde(default)]
    pub end_point: String,

    /// Databases to quiesce (MySQL and PostgreSQL)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,

    /// Requested operation: empty, `quiesce` or `unquiesce`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation_type: String,

    /// Seconds after which a quiesced instance is resumed automatically (0 disables)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,

    /// Secret holding `username` and `password`
    #[serde(default)]
    pub secret: SecretReference,

    /// Engine specific options
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// Reference to the credential secret
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    #[serde(default)]
    pub name: String,

    /// Defaults to the operator namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Observed state of an AppHook
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppHookStatus {
    #[serde(default)]
    pub phase: HookPhase,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err_msg: String,

    /// RFC 3339 time at which the instance entered Quiesced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiesced_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<QuiesceResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_config: Option<PreservedConfig>,

    /// Generation whose quiesce request was resumed by the timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_generation: Option<i64>,
}

/// Hook lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum HookPhase {
    #[default]
    Created,
    Ready,
    NotReady,
    #[serde(rename = "Quiesce In Progress")]
    QuiesceInProgress,
    Quiesced,
    #[serde(rename = "Unquiesce In Progress")]
    UnquiesceInProgress,
    Unquiesced,
}

impl HookPhase {
    pub const ALL: [HookPhase; 7] = [
        HookPhase::Created,
        HookPhase::Ready,
        HookPhase::NotReady,
        HookPhase::QuiesceInProgress,
        HookPhase::Quiesced,
        HookPhase::UnquiesceInProgress,
        HookPhase::Unquiesced,
    ];

    /// Whether the instance may be holding a lock or a modified setting
    pub fn may_hold_lock(&self) -> bool {
        matches!(self, HookPhase::Quiesced | HookPhase::QuiesceInProgress)
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Created => write!(f, "Created"),
            HookPhase::Ready => write!(f, "Ready"),
            HookPhase::NotReady => write!(f, "NotReady"),
            HookPhase::QuiesceInProgress => write!(f, "Quiesce In Progress"),
            HookPhase::Quiesced => write!(f, "Quiesced"),
            HookPhase::UnquiesceInProgress => write!(f, "Unquiesce In Progress"),
            HookPhase::Unquiesced => write!(f, "Unquiesced"),
        }
    }
}

/// Engine settings captured before quiesce changes them
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct PreservedConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Per-node settings keyed by `host:port`, for engines whose nodes are
    /// configured independently
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, BTreeMap<String, String>>,
}

impl PreservedConfig {
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.nodes.values().all(BTreeMap::is_empty)
    }

    /// Settings to restore on `address`, falling back to the shared ones
    pub fn settings_for(&self, address: &str) -> &BTreeMap<String, String> {
        self.nodes.get(address).unwrap_or(&self.params)
    }
}

/// Informational outcome of a successful quiesce
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct QuiesceResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongo: Option<MongoResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MySqlResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg: Option<PgResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisResult>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MongoResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mongo_endpoint: String,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MySqlResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locked_databases: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_method: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backup_label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<String>,
    /// Start LSN reported per database, in database order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_lsn: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RedisResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub topology: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
}

/// Errors produced while interpreting spec strings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecParseError {
    #[error("unsupported app provider '{0}'")]
    UnknownProvider(String),

    #[error("unsupported operation type '{0}'")]
    UnknownOperation(String),
}

/// Operation requested through `spec.operationType`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    None,
    Quiesce,
    Unquiesce,
}

impl FromStr for Operation {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Operation::None),
            "quiesce" => Ok(Operation::Quiesce),
            "unquiesce" => Ok(Operation::Unquiesce),
            other => Err(SpecParseError::UnknownOperation(other.to_string())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::None => write!(f, ""),
            Operation::Quiesce => write!(f, "quiesce"),
            Operation::Unquiesce => write!(f, "unquiesce"),
        }
    }
}

/// Supported database engines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Provider {
    MySql,
    Postgres,
    MongoDb,
    Redis,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::MySql => "mysql",
            Provider::Postgres => "postgres",
            Provider::MongoDb => "mongodb",
            Provider::Redis => "redis",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Provider::MySql => 3306,
            Provider::Postgres => 5432,
            Provider::MongoDb => 27017,
            Provider::Redis => 6379,
        }
    }

    /// Engines that operate on an explicit database list
    pub fn requires_databases(&self) -> bool {
        matches!(self, Provider::MySql | Provider::Postgres)
    }
}

impl FromStr for Provider {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Provider::MySql),
            "postgres" => Ok(Provider::Postgres),
            "mongodb" => Ok(Provider::MongoDb),
            "redis" => Ok(Provider::Redis),
            _ => Err(SpecParseError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppHook {
    /// Current phase, `Created` before the first status write
    pub fn phase(&self) -> HookPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Timeout in seconds, negative values treated as disabled
    pub fn timeout_seconds(&self) -> u64 {
        self.spec
            .timeout_seconds
            .map(|t| u64::try_from(t).unwrap_or(0))
            .unwrap_or(0)
    }
}
