//! MySQL driver
//!
//! Quiesce takes a global read lock through one dedicated connection per
//! configured database. The connections are held until unquiesce; a table
//! lock is released by closing its connection, an instance backup lock by
//! `UNLOCK INSTANCE` followed by close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder};
use tracing::{debug, info, instrument, warn};

use super::{CONNECTION_TIMEOUT, DriverConfig, DriverError, require_config};
use crate::crd::{MYSQL_INSTANCE_LOCK, MYSQL_TABLE_LOCK, MySqlResult, PARAM_MYSQL_LOCK_METHOD};

/// Time allowed for every per-database lock to be acquired
pub const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection target for a single database
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MySqlTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Opens sessions to a MySQL server
#[async_trait]
pub trait MySqlConnector: Send + Sync {
    async fn open(&self, target: &MySqlTarget) -> Result<Box<dyn MySqlSession>, DriverError>;
}

/// A single server connection
#[async_trait]
pub trait MySqlSession: Send {
    async fn ping(&mut self) -> Result<(), DriverError>;
    async fn execute(&mut self, statement: &str) -> Result<(), DriverError>;
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// How quiesce freezes writes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMethod {
    /// `FLUSH TABLES WITH READ LOCK`
    Table,
    /// `LOCK INSTANCE FOR BACKUP`
    Instance,
}

impl LockMethod {
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        match config.param(PARAM_MYSQL_LOCK_METHOD) {
            None | Some("") | Some(MYSQL_TABLE_LOCK) => Ok(LockMethod::Table),
            Some(MYSQL_INSTANCE_LOCK) => Ok(LockMethod::Instance),
            Some(other) => Err(DriverError::Configuration(format!(
                "unsupported {} '{}'",
                PARAM_MYSQL_LOCK_METHOD, other
            ))),
        }
    }

    pub fn lock_statement(&self) -> &'static str {
        match self {
            LockMethod::Table => "FLUSH TABLES WITH READ LOCK",
            LockMethod::Instance => "LOCK INSTANCE FOR BACKUP",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMethod::Table => MYSQL_TABLE_LOCK,
            LockMethod::Instance => MYSQL_INSTANCE_LOCK,
        }
    }
}

struct HeldLock {
    database: String,
    session: Box<dyn MySqlSession>,
}

pub struct MySqlDriver {
    connector: Arc<dyn MySqlConnector>,
    config: Option<DriverConfig>,
    lock_method: LockMethod,
    lock_timeout: Duration,
    held: Vec<HeldLock>,
}

impl MySqlDriver {
    pub fn new(connector: Arc<dyn MySqlConnector>) -> Self {
        Self {
            connector,
            config: None,
            lock_method: LockMethod::Table,
            lock_timeout: LOCK_ACQUIRE_TIMEOUT,
            held: Vec::new(),
        }
    }

    pub fn live() -> Self {
        Self::new(Arc::new(LiveMySqlConnector::default()))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Databases currently holding a lock
    pub fn locked_databases(&self) -> Vec<String> {
        self.held.iter().map(|h| h.database.clone()).collect()
    }

    pub fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        if config.databases.is_empty() {
            return Err(DriverError::Configuration(
                "mysql requires at least one database".to_string(),
            ));
        }
        let lock_method = LockMethod::from_config(config)?;
        config.endpoint()?;

        if self
            .config
            .as_ref()
            .is_some_and(|current| current.connection_changed(config))
            && !self.held.is_empty()
        {
            return Err(DriverError::Configuration(format!(
                "connection settings cannot change while {:?} are locked",
                self.locked_databases()
            )));
        }

        self.lock_method = lock_method;
        self.config = Some(config.clone());
        Ok(())
    }

    fn targets(&self) -> Result<Vec<MySqlTarget>, DriverError> {
        let config = require_config(self.config.as_ref())?;
        let (host, port) = config.endpoint()?;
        Ok(config
            .databases
            .iter()
            .map(|database| MySqlTarget {
                host: host.clone(),
                port,
                username: config.username.clone(),
                password: config.password.clone(),
                database: database.clone(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), DriverError> {
        for target in self.targets()? {
            let mut session = self.connector.open(&target).await?;
            let pinged = session.ping().await;
            if let Err(e) = session.close().await {
                debug!(database = %target.database, error = %e, "Failed to close check connection");
            }
            pinged.map_err(|e| {
                DriverError::Connectivity(format!("ping {} failed: {}", target.database, e))
            })?;
        }
        debug!("Connected to all mysql databases");
        Ok(())
    }

    /// Lock every configured database.
    ///
    /// Either all locks are acquired within the acquire timeout or every
    /// acquired lock is released and the first error is returned.
    #[instrument(skip(self), fields(method = self.lock_method.as_str()))]
    pub async fn quiesce(&mut self) -> Result<MySqlResult, DriverError> {
        if !self.held.is_empty() {
            info!("Locks already held, skipping quiesce");
            return Ok(self.result());
        }

        let statement = self.lock_method.lock_statement();
        let acquisitions = self
            .targets()?
            .into_iter()
            .map(|target| acquire(Arc::clone(&self.connector), target, statement));

        // A pending acquisition dropped by the timeout drops its connection,
        // which releases any lock it already took.
        let outcomes = tokio::time::timeout(self.lock_timeout, join_all(acquisitions))
            .await
            .map_err(|_| DriverError::timeout("mysql lock acquisition", self.lock_timeout))?;

        let mut acquired = Vec::new();
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(lock) => acquired.push(lock),
                Err(e) => {
                    warn!(error = %e, "Lock acquisition failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(err) = first_error {
            release_all(self.lock_method, acquired).await;
            return Err(err);
        }

        self.held = acquired;
        info!(databases = ?self.locked_databases(), "Acquired mysql locks");
        Ok(self.result())
    }

    #[instrument(skip(self))]
    pub async fn unquiesce(&mut self) -> Result<(), DriverError> {
        if self.held.is_empty() {
            debug!("No locks held, nothing to release");
            return Ok(());
        }

        let held = std::mem::take(&mut self.held);
        let errors = release_all(self.lock_method, held).await;
        if errors.is_empty() {
            info!("Released mysql locks");
            Ok(())
        } else {
            Err(DriverError::Operation(errors.join("; ")))
        }
    }

    /// Close every session, releasing any lock still held
    pub async fn close(&mut self) {
        let held = std::mem::take(&mut self.held);
        for error in release_all(self.lock_method, held).await {
            debug!(%error, "Failed to release mysql session");
        }
    }

    fn result(&self) -> MySqlResult {
        MySqlResult {
            locked_databases: self.locked_databases(),
            lock_method: self.lock_method.as_str().to_string(),
        }
    }
}

async fn acquire(
    connector: Arc<dyn MySqlConnector>,
    target: MySqlTarget,
    statement: &'static str,
) -> Result<HeldLock, DriverError> {
    let mut session = connector.open(&target).await?;
    match session.execute(statement).await {
        Ok(()) => Ok(HeldLock {
            database: target.database,
            session,
        }),
        Err(e) => {
            let _ = session.close().await;
            Err(match e {
                DriverError::Operation(message) => DriverError::Operation(format!(
                    "lock {} failed: {}",
                    target.database, message
                )),
                other => other,
            })
        }
    }
}

async fn release_all(method: LockMethod, held: Vec<HeldLock>) -> Vec<String> {
    let releases = held.into_iter().map(|mut lock| async move {
        let mut errors = Vec::new();
        if method == LockMethod::Instance
            && let Err(e) = lock.session.execute("UNLOCK INSTANCE").await
        {
            errors.push(format!("unlock {}: {}", lock.database, e));
        }
        if let Err(e) = lock.session.close().await {
            errors.push(format!("close {}: {}", lock.database, e));
        }
        errors
    });
    join_all(releases).await.into_iter().flatten().collect()
}

/// Connector backed by `mysql_async`
#[derive(Clone, Debug)]
pub struct LiveMySqlConnector {
    connect_timeout: Duration,
}

impl Default for LiveMySqlConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECTION_TIMEOUT,
        }
    }
}

#[async_trait]
impl MySqlConnector for LiveMySqlConnector {
    #[instrument(skip(self, target), fields(host = %target.host, database = %target.database))]
    async fn open(&self, target: &MySqlTarget) -> Result<Box<dyn MySqlSession>, DriverError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.username.clone()))
            .pass(Some(target.password.clone()))
            .db_name(Some(target.database.clone()));

        let conn = tokio::time::timeout(self.connect_timeout, Conn::new(opts))
            .await
            .map_err(|_| DriverError::timeout("mysql connect", self.connect_timeout))?
            .map_err(|e| DriverError::Connectivity(e.to_string()))?;

        Ok(Box::new(LiveMySqlSession { conn: Some(conn) }))
    }
}

struct LiveMySqlSession {
    conn: Option<Conn>,
}

impl LiveMySqlSession {
    fn conn(&mut self) -> Result<&mut Conn, DriverError> {
        self.conn
            .as_mut()
            .ok_or_else(|| DriverError::Connectivity("connection already closed".to_string()))
    }
}

#[async_trait]
impl MySqlSession for LiveMySqlSession {
    async fn ping(&mut self) -> Result<(), DriverError> {
        self.conn()?
            .ping()
            .await
            .map_err(|e| DriverError::Connectivity(e.to_string()))
    }

    async fn execute(&mut self, statement: &str) -> Result<(), DriverError> {
        self.conn()?
            .query_drop(statement)
            .await
            .map_err(|e| DriverError::Operation(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        match self.conn.take() {
            Some(conn) => conn
                .disconnect()
                .await
                .map_err(|e| DriverError::Connectivity(e.to_string())),
            None => Ok(()),
        }
    }
}
