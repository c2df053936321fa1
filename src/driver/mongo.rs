//! MongoDB driver
//!
//! Quiesce flushes and locks one replica set member with `fsync` + `lock`.
//! Members are discovered from the seed's `hello` reply; the first
//! secondary is locked unless `QuiesceFromPrimary=true` is set, so the
//! primary keeps serving writes while the snapshot is taken. A standalone
//! server is locked through the seed itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{Document, doc};
use mongodb::options::{ClientOptions, Credential, ReadPreference, SelectionCriteria};
use mongodb::Client;
use tracing::{debug, info, instrument, warn};

use super::{
    CONNECTION_TIMEOUT, DriverConfig, DriverError, PollPolicy, Poller, require_config,
    split_endpoint,
};
use crate::crd::MongoResult;

/// Unlock retries every second for at most thirty attempts
pub const UNLOCK_POLICY: PollPolicy =
    PollPolicy::new(Duration::from_secs(1), Duration::from_secs(30));

const DEFAULT_PORT: u16 = 27017;
const NOT_LOCKED: &str = "not locked";

/// Direct connection target for one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MongoTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl MongoTarget {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Opens sessions to a single MongoDB node
#[async_trait]
pub trait MongoConnector: Send + Sync {
    async fn open(&self, target: &MongoTarget) -> Result<Box<dyn MongoSession>, DriverError>;
}

#[async_trait]
pub trait MongoSession: Send + Sync {
    async fn list_database_names(&self) -> Result<Vec<String>, DriverError>;
    /// Run a command against the `admin` database
    async fn admin_command(&self, command: Document) -> Result<Document, DriverError>;
}

/// Whether a `lockInfo` reply reports a held fsync lock
pub fn is_locked(lock_info: &Document) -> bool {
    lock_info
        .get_array("lockInfo")
        .map(|locks| !locks.is_empty())
        .unwrap_or(false)
}

/// Role and membership details from a `hello` reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRole {
    pub is_secondary: bool,
    pub is_primary: bool,
    pub me: Option<String>,
    pub set_name: Option<String>,
    pub primary: Option<String>,
    /// Data bearing members as `host:port`
    pub hosts: Vec<String>,
}

impl NodeRole {
    pub fn from_hello(reply: &Document) -> Self {
        let hosts = reply
            .get_array("hosts")
            .map(|hosts| {
                hosts
                    .iter()
                    .filter_map(|h| h.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            is_secondary: reply.get_bool("secondary").unwrap_or(false),
            is_primary: reply.get_bool("isWritablePrimary").unwrap_or(false),
            me: reply.get_str("me").ok().map(str::to_string),
            set_name: reply.get_str("setName").ok().map(str::to_string),
            primary: reply.get_str("primary").ok().map(str::to_string),
            hosts,
        }
    }

    /// Member quiesce should lock, or `None` to lock the seed.
    ///
    /// Secondaries are taken in `hosts` order so the same member is chosen
    /// again after a restart.
    pub fn select_member(&self, from_primary: bool) -> Option<String> {
        self.set_name.as_ref()?;
        if from_primary {
            return self.primary.clone();
        }
        self.hosts
            .iter()
            .find(|host| Some(*host) != self.primary.as_ref())
            .cloned()
            .or_else(|| self.primary.clone())
    }
}

/// The node fsync locks are taken on
struct LockTarget {
    address: String,
    session: Box<dyn MongoSession>,
}

pub struct MongoDriver {
    connector: Arc<dyn MongoConnector>,
    config: Option<DriverConfig>,
    target: Option<LockTarget>,
    unlock_policy: PollPolicy,
}

impl MongoDriver {
    pub fn new(connector: Arc<dyn MongoConnector>) -> Self {
        Self {
            connector,
            config: None,
            target: None,
            unlock_policy: UNLOCK_POLICY,
        }
    }

    pub fn live() -> Self {
        Self::new(Arc::new(LiveMongoConnector::default()))
    }

    pub fn with_unlock_policy(mut self, policy: PollPolicy) -> Self {
        self.unlock_policy = policy;
        self
    }

    /// Address of the member quiesce acts on, known after `connect`
    pub fn target_address(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.address.as_str())
    }

    pub fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        config.endpoint()?;
        if self
            .config
            .as_ref()
            .is_some_and(|current| current.connection_changed(config))
        {
            self.target = None;
        }
        self.config = Some(config.clone());
        Ok(())
    }

    fn node(&self, host: String, port: u16) -> Result<MongoTarget, DriverError> {
        let config = require_config(self.config.as_ref())?;
        Ok(MongoTarget {
            host,
            port,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Discover the members through the seed and open the lock target
    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), DriverError> {
        let config = require_config(self.config.as_ref())?;
        let from_primary = config.quiesce_from_primary;
        let (host, port) = config.endpoint()?;
        let seed_target = self.node(host, port)?;
        let seed = self.connector.open(&seed_target).await?;

        let databases = seed
            .list_database_names()
            .await
            .map_err(|e| DriverError::Connectivity(e.to_string()))?;
        debug!(count = databases.len(), "Listed mongodb databases");

        let hello = seed
            .admin_command(doc! { "hello": 1 })
            .await
            .map_err(|e| DriverError::Connectivity(e.to_string()))?;
        let role = NodeRole::from_hello(&hello);

        let target = match role.select_member(from_primary) {
            Some(member) if Some(&member) != role.me.as_ref() => {
                let (host, port) = split_endpoint(&member, DEFAULT_PORT)?;
                let session = self.connector.open(&self.node(host, port)?).await?;
                let member_role = NodeRole::from_hello(
                    &session
                        .admin_command(doc! { "hello": 1 })
                        .await
                        .map_err(|e| DriverError::Connectivity(e.to_string()))?,
                );
                if !from_primary && !member_role.is_secondary {
                    warn!(member = %member, "Selected member is not a secondary");
                }
                LockTarget {
                    address: member,
                    session,
                }
            }
            selected => {
                if role.set_name.is_none() {
                    debug!("Standalone server, locking the seed");
                } else if !from_primary && !role.is_secondary {
                    warn!("No secondary available, quiesce will lock the primary");
                }
                LockTarget {
                    address: selected.or(role.me).unwrap_or_else(|| seed_target.address()),
                    session: seed,
                }
            }
        };

        info!(member = %target.address, from_primary, "Selected mongodb lock target");
        self.target = Some(target);
        Ok(())
    }

    async fn target(&mut self) -> Result<&LockTarget, DriverError> {
        if self.target.is_none() {
            self.connect().await?;
        }
        self.target
            .as_ref()
            .ok_or_else(|| DriverError::Connectivity("mongodb session unavailable".to_string()))
    }

    #[instrument(skip(self))]
    pub async fn quiesce(&mut self) -> Result<MongoResult, DriverError> {
        let target = self.target().await?;
        let session = target.session.as_ref();

        let role = NodeRole::from_hello(&session.admin_command(doc! { "hello": 1 }).await?);
        let result = MongoResult {
            mongo_endpoint: role.me.unwrap_or_else(|| target.address.clone()),
            is_primary: role.is_primary,
        };

        if is_locked(&session.admin_command(doc! { "lockInfo": 1 }).await?) {
            info!(endpoint = %result.mongo_endpoint, "Node already locked");
            return Ok(result);
        }

        session
            .admin_command(doc! { "fsync": 1, "lock": true })
            .await
            .map_err(|e| DriverError::Operation(format!("fsync lock: {}", e)))?;
        info!(endpoint = %result.mongo_endpoint, is_primary = result.is_primary, "Locked mongodb node");
        Ok(result)
    }

    /// Release the fsync lock on the lock target.
    ///
    /// fsync locks nest, so `fsyncUnlock` repeats until `lockInfo` reports
    /// no lock, bounded by the unlock policy.
    #[instrument(skip(self))]
    pub async fn unquiesce(&mut self) -> Result<(), DriverError> {
        let mut poller = Poller::new(self.unlock_policy);
        let session = self.target().await?.session.as_ref();

        loop {
            if !is_locked(&session.admin_command(doc! { "lockInfo": 1 }).await?) {
                info!("Mongodb node unlocked");
                return Ok(());
            }

            match session.admin_command(doc! { "fsyncUnlock": 1 }).await {
                Ok(reply) => debug!(reply = %reply, "fsyncUnlock"),
                Err(e) if e.to_string().contains(NOT_LOCKED) => {
                    info!("Mongodb node was not locked");
                    return Ok(());
                }
                Err(e) => return Err(DriverError::Operation(format!("fsyncUnlock: {}", e))),
            }

            poller.wait("mongodb unlock").await?;
        }
    }

    /// Drop the sessions; a held fsync lock stays on the server
    pub fn close(&mut self) {
        self.target = None;
    }
}

/// Connector backed by the official `mongodb` driver
#[derive(Clone, Debug)]
pub struct LiveMongoConnector {
    connect_timeout: Duration,
}

impl Default for LiveMongoConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECTION_TIMEOUT,
        }
    }
}

#[async_trait]
impl MongoConnector for LiveMongoConnector {
    #[instrument(skip(self, target), fields(host = %target.host, port = target.port))]
    async fn open(&self, target: &MongoTarget) -> Result<Box<dyn MongoSession>, DriverError> {
        let uri = format!("mongodb://{}:{}/", target.host, target.port);
        let mut options = ClientOptions::parse(&uri)
            .await
            .map_err(|e| DriverError::Configuration(e.to_string()))?;

        options.app_name = Some("apphook-operator".to_string());
        options.direct_connection = Some(true);
        options.connect_timeout = Some(self.connect_timeout);
        options.server_selection_timeout = Some(self.connect_timeout);
        if !target.username.is_empty() {
            options.credential = Some(
                Credential::builder()
                    .username(target.username.clone())
                    .password(target.password.clone())
                    .build(),
            );
        }

        // Direct connections still need secondaryOk to run commands on a secondary
        let selection =
            SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred { options: None });
        options.selection_criteria = Some(selection.clone());

        let client =
            Client::with_options(options).map_err(|e| DriverError::Connectivity(e.to_string()))?;
        Ok(Box::new(LiveMongoSession { client, selection }))
    }
}

struct LiveMongoSession {
    client: Client,
    selection: SelectionCriteria,
}

#[async_trait]
impl MongoSession for LiveMongoSession {
    async fn list_database_names(&self) -> Result<Vec<String>, DriverError> {
        self.client
            .list_database_names()
            .await
            .map_err(|e| DriverError::Connectivity(e.to_string()))
    }

    async fn admin_command(&self, command: Document) -> Result<Document, DriverError> {
        self.client
            .database("admin")
            .run_command(command)
            .selection_criteria(self.selection.clone())
            .await
            .map_err(|e| DriverError::Operation(e.to_string()))
    }
}
