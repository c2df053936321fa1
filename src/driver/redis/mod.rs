//! Redis driver
//!
//! Quiesce makes the persistence files on disk consistent rather than
//! blocking writes: with `redis-backup-method=rdb` (the default) a fresh
//! `BGSAVE` is taken on every target node; with `aof` automatic AOF
//! rewrites are disabled and any running rewrite is awaited. Standalone
//! servers are a single target, clusters target every node.

pub mod parsing;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::{InfoKind, Value};
use tracing::{debug, info, instrument, warn};

use super::{CONNECTION_TIMEOUT, DriverConfig, DriverError, PollPolicy, Poller, require_config};
use crate::crd::{
    PARAM_REDIS_BACKUP_METHOD, PreservedConfig, REDIS_BACKUP_AOF, REDIS_BACKUP_RDB, RedisResult,
};
use parsing::{
    ClusterInfo, ParseError, RedisMode, ServerInfo, parse_cluster_nodes, parse_info_int,
    validate_cluster,
};

pub const APPENDONLY: &str = "appendonly";
pub const SAVE: &str = "save";
pub const AOF_REWRITE_PERCENTAGE: &str = "auto-aof-rewrite-percentage";

/// Interval between persistence checks
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Ceiling for persistence checks when the hook sets no timeout
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(180);

/// `INFO` sections the driver reads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoSection {
    Server,
    Cluster,
    Persistence,
}

/// Opens a connection to one Redis node
#[async_trait]
pub trait RedisConnector: Send + Sync {
    async fn open(
        &self,
        host: &str,
        port: u16,
        password: Option<&str>,
    ) -> Result<Box<dyn RedisNode>, DriverError>;
}

/// Commands issued against a single node
#[async_trait]
pub trait RedisNode: Send + Sync {
    async fn ping(&self) -> Result<(), DriverError>;
    async fn info(&self, section: InfoSection) -> Result<String, DriverError>;
    async fn cluster_info(&self) -> Result<String, DriverError>;
    async fn cluster_nodes(&self) -> Result<String, DriverError>;
    async fn config_get(&self, key: &str) -> Result<Option<String>, DriverError>;
    async fn config_set(&self, key: &str, value: &str) -> Result<(), DriverError>;
    async fn bgsave(&self) -> Result<(), DriverError>;
    async fn lastsave(&self) -> Result<i64, DriverError>;
    async fn close(&self) -> Result<(), DriverError>;
}

/// Persistence mechanism quiesce coordinates with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupMethod {
    Rdb,
    Aof,
    /// Unrecognised method; the instance is not supported
    None,
}

impl BackupMethod {
    pub fn from_config(config: &DriverConfig) -> Self {
        match config.param(PARAM_REDIS_BACKUP_METHOD) {
            None | Some(REDIS_BACKUP_RDB) => BackupMethod::Rdb,
            Some(REDIS_BACKUP_AOF) => BackupMethod::Aof,
            Some(_) => BackupMethod::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMethod::Rdb => REDIS_BACKUP_RDB,
            BackupMethod::Aof => REDIS_BACKUP_AOF,
            BackupMethod::None => "none",
        }
    }
}

struct Member {
    address: String,
    node: Box<dyn RedisNode>,
}

struct Topology {
    server: ServerInfo,
    seed: Member,
    /// Every cluster node; empty for standalone servers
    cluster: Vec<Member>,
}

impl Topology {
    fn targets(&self) -> Vec<&Member> {
        if self.cluster.is_empty() {
            vec![&self.seed]
        } else {
            self.cluster.iter().collect()
        }
    }

    fn addresses(&self) -> Vec<String> {
        self.targets().iter().map(|m| m.address.clone()).collect()
    }

    async fn close(self) {
        close_members(std::iter::once(self.seed).chain(self.cluster)).await;
    }
}

async fn close_members(members: impl IntoIterator<Item = Member>) {
    for member in members {
        if let Err(e) = member.node.close().await {
            debug!(node = %member.address, error = %e, "Failed to close redis connection");
        }
    }
}

pub struct RedisDriver {
    connector: Arc<dyn RedisConnector>,
    config: Option<DriverConfig>,
    poll_override: Option<PollPolicy>,
    topology: Option<Topology>,
    /// Set when the connection settings changed since `topology` was built
    stale: bool,
}

impl RedisDriver {
    pub fn new(connector: Arc<dyn RedisConnector>) -> Self {
        Self {
            connector,
            config: None,
            poll_override: None,
            topology: None,
            stale: false,
        }
    }

    pub fn live() -> Self {
        Self::new(Arc::new(LiveRedisConnector::default()))
    }

    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_override = Some(policy);
        self
    }

    /// Addresses quiesce acts on, known after `connect`
    pub fn target_addresses(&self) -> Vec<String> {
        self.topology
            .as_ref()
            .map(Topology::addresses)
            .unwrap_or_default()
    }

    pub fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        config.endpoint()?;
        if self
            .config
            .as_ref()
            .is_some_and(|current| current.connection_changed(config))
        {
            // Connections are rebuilt, and the old ones closed, by the next connect
            self.stale = true;
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn poll_policy(&self) -> Result<PollPolicy, DriverError> {
        if let Some(policy) = self.poll_override {
            return Ok(policy);
        }
        let config = require_config(self.config.as_ref())?;
        Ok(PollPolicy::new(
            POLL_INTERVAL,
            config.operation_timeout.unwrap_or(DEFAULT_POLL_CEILING),
        ))
    }

    fn backup_method(&self) -> Result<BackupMethod, DriverError> {
        match BackupMethod::from_config(require_config(self.config.as_ref())?) {
            BackupMethod::None => Err(DriverError::Configuration(format!(
                "unsupported {}",
                PARAM_REDIS_BACKUP_METHOD
            ))),
            method => Ok(method),
        }
    }

    /// Discover the topology and open a connection to every target node.
    ///
    /// Connections opened by a failed attempt are closed before returning.
    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), DriverError> {
        self.backup_method()?;
        let config = require_config(self.config.as_ref())?;
        let (host, port) = config.endpoint()?;
        let password = config.password().map(str::to_string);

        let seed = Member {
            address: format!("{}:{}", host, port),
            node: self.connector.open(&host, port, password.as_deref()).await?,
        };
        let server = match inspect_seed(seed.node.as_ref()).await {
            Ok(server) => server,
            Err(e) => {
                close_members([seed]).await;
                return Err(e);
            }
        };
        let cluster = match open_cluster(
            self.connector.as_ref(),
            seed.node.as_ref(),
            &server,
            password.as_deref(),
        )
        .await
        {
            Ok(cluster) => cluster,
            Err(e) => {
                close_members([seed]).await;
                return Err(e);
            }
        };

        let topology = Topology {
            server,
            seed,
            cluster,
        };
        info!(
            version = %topology.server.version,
            mode = topology.server.mode.as_str(),
            nodes = topology.targets().len(),
            "Connected to redis"
        );

        if let Some(previous) = self.topology.replace(topology) {
            previous.close().await;
        }
        self.stale = false;
        Ok(())
    }

    /// Close every open connection
    pub async fn close(&mut self) {
        self.stale = false;
        if let Some(topology) = self.topology.take() {
            topology.close().await;
        }
    }

    async fn topology(&mut self) -> Result<&Topology, DriverError> {
        if self.topology.is_none() || self.stale {
            self.connect().await?;
        }
        self.topology
            .as_ref()
            .ok_or_else(|| DriverError::Connectivity("redis topology unavailable".to_string()))
    }

    /// Capture the settings quiesce may change.
    ///
    /// Cluster nodes are captured one by one since their settings may
    /// differ. Returns `None` when nothing was captured.
    #[instrument(skip(self))]
    pub async fn prepare(&mut self) -> Result<Option<PreservedConfig>, DriverError> {
        let topology = self.topology().await?;
        let version = &topology.server.version;

        let mut preserved = PreservedConfig::default();
        if topology.cluster.is_empty() {
            preserved.params = capture_settings(&topology.seed, version).await?;
        } else {
            for member in &topology.cluster {
                let settings = capture_settings(member, version).await?;
                if !settings.is_empty() {
                    preserved.nodes.insert(member.address.clone(), settings);
                }
            }
        }

        if preserved.is_empty() {
            debug!("Prepared redis without saved settings");
            Ok(None)
        } else {
            Ok(Some(preserved))
        }
    }

    #[instrument(skip(self))]
    pub async fn quiesce(&mut self) -> Result<RedisResult, DriverError> {
        let method = self.backup_method()?;
        let policy = self.poll_policy()?;
        let topology = self.topology().await?;

        match method {
            BackupMethod::Aof => {
                if appendonly_enabled(topology.seed.node.as_ref()).await? {
                    for member in topology.targets() {
                        if topology.server.version.tunes_aof_rewrite() {
                            member.node.config_set(AOF_REWRITE_PERCENTAGE, "0").await?;
                        }
                        wait_for_zero(
                            member,
                            InfoSection::Persistence,
                            "aof_rewrite_in_progress",
                            policy,
                        )
                        .await?;
                    }
                } else {
                    warn!("AOF is disabled, nothing to quiesce");
                }
            }
            BackupMethod::Rdb => {
                for member in topology.targets() {
                    snapshot(member, policy).await?;
                }
            }
            BackupMethod::None => {
                return Err(DriverError::Configuration(format!(
                    "unsupported {}",
                    PARAM_REDIS_BACKUP_METHOD
                )));
            }
        }

        Ok(RedisResult {
            topology: topology.server.mode.as_str().to_string(),
            nodes: topology.addresses(),
            method: method.as_str().to_string(),
        })
    }

    /// Restore preserved settings on every target node
    #[instrument(skip(self, preserved))]
    pub async fn unquiesce(
        &mut self,
        preserved: Option<&PreservedConfig>,
    ) -> Result<(), DriverError> {
        let Some(preserved) = preserved.filter(|p| !p.is_empty()) else {
            debug!("No preserved config, nothing to restore");
            return Ok(());
        };

        let topology = self.topology().await?;
        for member in topology.targets() {
            let settings = preserved.settings_for(&member.address);
            for (key, value) in settings {
                member.node.config_set(key, value).await.map_err(|e| {
                    DriverError::Operation(format!("restore {} on {}: {}", key, member.address, e))
                })?;
            }
            debug!(node = %member.address, keys = ?settings.keys().collect::<Vec<_>>(), "Restored redis config");
        }
        info!(nodes = topology.targets().len(), "Restored redis config");
        Ok(())
    }
}

/// Ping the seed and check its version and mode
async fn inspect_seed(seed: &dyn RedisNode) -> Result<ServerInfo, DriverError> {
    seed.ping().await.map_err(connectivity)?;

    let server = ServerInfo::parse(&seed.info(InfoSection::Server).await?).map_err(topology_error)?;
    if !server.version.is_supported() {
        return Err(DriverError::Configuration(format!(
            "redis {} is older than the minimum supported {}",
            server.version,
            parsing::RedisVersion::MIN_SUPPORTED
        )));
    }
    if server.mode == RedisMode::Sentinel {
        return Err(DriverError::Configuration(
            "sentinel deployments are not supported".to_string(),
        ));
    }
    Ok(server)
}

/// Validate the cluster seen from the seed and open every node.
///
/// Empty for standalone servers.
async fn open_cluster(
    connector: &dyn RedisConnector,
    seed: &dyn RedisNode,
    server: &ServerInfo,
    password: Option<&str>,
) -> Result<Vec<Member>, DriverError> {
    if server.mode != RedisMode::Cluster {
        return Ok(Vec::new());
    }
    let enabled = parse_info_int(&seed.info(InfoSection::Cluster).await?, "cluster_enabled");
    if enabled != Some(1) {
        return Ok(Vec::new());
    }

    let info = ClusterInfo::parse(&seed.cluster_info().await?).map_err(topology_error)?;
    let nodes = parse_cluster_nodes(&seed.cluster_nodes().await?).map_err(topology_error)?;
    validate_cluster(&info, &nodes).map_err(topology_error)?;

    let mut cluster = Vec::with_capacity(nodes.len());
    for node in nodes {
        match connector.open(&node.host, node.port, password).await {
            Ok(client) => cluster.push(Member {
                address: node.address(),
                node: client,
            }),
            Err(e) => {
                close_members(cluster).await;
                return Err(e);
            }
        }
    }
    Ok(cluster)
}

/// Read the settings one node's quiesce may change.
///
/// `appendonly` is recorded alongside, but only the rewrite percentage and
/// the save schedule make the result non-empty.
async fn capture_settings(
    member: &Member,
    version: &parsing::RedisVersion,
) -> Result<BTreeMap<String, String>, DriverError> {
    let node = member.node.as_ref();
    let aof_enabled = appendonly_enabled(node).await?;
    let mut settings = BTreeMap::new();

    if aof_enabled
        && version.tunes_aof_rewrite()
        && let Some(percentage) = node.config_get(AOF_REWRITE_PERCENTAGE).await?
    {
        settings.insert(AOF_REWRITE_PERCENTAGE.to_string(), percentage);
    }
    if let Some(save) = node.config_get(SAVE).await?
        && !save.is_empty()
    {
        settings.insert(SAVE.to_string(), save);
    }

    if !settings.is_empty() && aof_enabled {
        settings.insert(APPENDONLY.to_string(), "yes".to_string());
    }
    debug!(node = %member.address, aof_enabled, preserved = ?settings.keys().collect::<Vec<_>>(), "Captured redis settings");
    Ok(settings)
}

async fn appendonly_enabled(node: &dyn RedisNode) -> Result<bool, DriverError> {
    match node.config_get(APPENDONLY).await?.as_deref() {
        Some("yes") => Ok(true),
        Some("no") => Ok(false),
        other => Err(DriverError::Operation(format!(
            "unexpected appendonly value {:?}",
            other
        ))),
    }
}

async fn wait_for_zero(
    member: &Member,
    section: InfoSection,
    key: &str,
    policy: PollPolicy,
) -> Result<(), DriverError> {
    let mut poller = Poller::new(policy);
    loop {
        match parse_info_int(&member.node.info(section).await?, key) {
            Some(0) => return Ok(()),
            Some(_) => debug!(node = %member.address, key, "Waiting for persistence"),
            None => {
                return Err(DriverError::Operation(format!(
                    "{} missing from INFO on {}",
                    key, member.address
                )));
            }
        }
        poller.wait(key).await?;
    }
}

/// Take a fresh RDB snapshot and wait until `LASTSAVE` moves
async fn snapshot(member: &Member, policy: PollPolicy) -> Result<(), DriverError> {
    wait_for_zero(member, InfoSection::Persistence, "rdb_bgsave_in_progress", policy).await?;

    let before = member.node.lastsave().await?;
    match member.node.bgsave().await {
        Ok(()) => {}
        Err(e) if e.to_string().contains("already in progress") => {
            debug!(node = %member.address, "Background save already running");
        }
        Err(e) => return Err(e),
    }

    let mut poller = Poller::new(policy);
    loop {
        poller.wait("bgsave").await?;
        if member.node.lastsave().await? != before {
            info!(node = %member.address, "Snapshot written");
            return Ok(());
        }
    }
}

fn connectivity(error: DriverError) -> DriverError {
    match error {
        DriverError::Operation(m) => DriverError::Connectivity(m),
        other => other,
    }
}

fn topology_error(error: ParseError) -> DriverError {
    DriverError::Connectivity(error.to_string())
}

/// Connector backed by `fred`
#[derive(Clone, Debug)]
pub struct LiveRedisConnector {
    connection_timeout: Duration,
    command_timeout: Duration,
}

impl Default for LiveRedisConnector {
    fn default() -> Self {
        Self {
            connection_timeout: CONNECTION_TIMEOUT,
            command_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl RedisConnector for LiveRedisConnector {
    #[instrument(skip(self, password))]
    async fn open(
        &self,
        host: &str,
        port: u16,
        password: Option<&str>,
    ) -> Result<Box<dyn RedisNode>, DriverError> {
        let mut redis_config = Config {
            server: ServerConfig::Centralized {
                server: Server::new(host, port),
            },
            ..Default::default()
        };
        redis_config.password = password.map(str::to_string);

        let command_timeout = self.command_timeout;
        let connection_timeout = self.connection_timeout;
        let client = Builder::from_config(redis_config)
            .with_performance_config(|perf| {
                perf.default_command_timeout = command_timeout;
            })
            .with_connection_config(|conn| {
                conn.connection_timeout = connection_timeout;
            })
            .build()
            .map_err(|e| DriverError::Configuration(e.to_string()))?;

        client
            .init()
            .await
            .map_err(|e| DriverError::Connectivity(format!("{}:{}: {}", host, port, e)))?;
        Ok(Box::new(LiveRedisNode { client }))
    }
}

struct LiveRedisNode {
    client: Client,
}

fn op_error(error: fred::error::Error) -> DriverError {
    DriverError::Operation(error.to_string())
}

#[async_trait]
impl RedisNode for LiveRedisNode {
    async fn ping(&self) -> Result<(), DriverError> {
        let _: String = self
            .client
            .ping(None)
            .await
            .map_err(|e| DriverError::Connectivity(e.to_string()))?;
        Ok(())
    }

    async fn info(&self, section: InfoSection) -> Result<String, DriverError> {
        let kind = match section {
            InfoSection::Server => InfoKind::Server,
            InfoSection::Cluster => InfoKind::Cluster,
            InfoSection::Persistence => InfoKind::Persistence,
        };
        self.client.info(Some(kind)).await.map_err(op_error)
    }

    async fn cluster_info(&self) -> Result<String, DriverError> {
        self.client.cluster_info().await.map_err(op_error)
    }

    async fn cluster_nodes(&self) -> Result<String, DriverError> {
        self.client.cluster_nodes().await.map_err(op_error)
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, DriverError> {
        let values: HashMap<String, String> =
            self.client.config_get(key).await.map_err(op_error)?;
        Ok(values.get(key).cloned())
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), DriverError> {
        let _: () = self.client.config_set(key, value).await.map_err(op_error)?;
        Ok(())
    }

    async fn bgsave(&self) -> Result<(), DriverError> {
        let _: Value = self.client.bgsave().await.map_err(op_error)?;
        Ok(())
    }

    async fn lastsave(&self) -> Result<i64, DriverError> {
        self.client.lastsave().await.map_err(op_error)
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.client.quit().await.map_err(op_error)
    }
}
