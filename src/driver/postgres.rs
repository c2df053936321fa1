//! PostgreSQL driver
//!
//! Quiesce starts an online backup in every configured database so the
//! server writes a consistent checkpoint. PostgreSQL 15 replaced the
//! exclusive `pg_start_backup`/`pg_stop_backup` pair with the
//! session-scoped `pg_backup_start`/`pg_backup_stop`; for those servers the
//! session that started the backup is held until unquiesce.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::NoTls;
use tokio_postgres::types::ToSql;
use tracing::{debug, info, instrument, trace};

use super::{CONNECTION_TIMEOUT, DriverConfig, DriverError, require_config};
use crate::crd::PgResult;

/// First major version with session-scoped backup functions
pub const SESSION_BACKUP_MIN_VERSION: u32 = 15;

const BACKUP_ALREADY_RUNNING: &str = "already in progress";
const BACKUP_NOT_RUNNING: &str = "not in progress";

/// Connection target for a single database
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PgTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

/// Opens sessions to a PostgreSQL server
#[async_trait]
pub trait PgConnector: Send + Sync {
    async fn open(&self, target: &PgTarget) -> Result<Box<dyn PgSession>, DriverError>;
}

/// A single server session.
///
/// Dropping the session closes the connection.
#[async_trait]
pub trait PgSession: Send + Sync {
    /// Run a statement returning one text column of one row
    async fn query_text(&self, statement: &str, args: &[String]) -> Result<String, DriverError>;
}

/// Backup function flavour for a server version
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackupApi {
    /// `pg_start_backup` / `pg_stop_backup`
    Exclusive,
    /// `pg_backup_start` / `pg_backup_stop`
    Session,
}

impl BackupApi {
    pub fn for_version(major: u32) -> Self {
        if major >= SESSION_BACKUP_MIN_VERSION {
            BackupApi::Session
        } else {
            BackupApi::Exclusive
        }
    }

    pub fn start_statement(&self) -> &'static str {
        match self {
            BackupApi::Exclusive => "SELECT pg_start_backup($1, true)::text",
            BackupApi::Session => "SELECT pg_backup_start($1, true)::text",
        }
    }

    pub fn stop_statement(&self) -> &'static str {
        match self {
            BackupApi::Exclusive => "SELECT pg_stop_backup()::text",
            BackupApi::Session => "SELECT lsn::text FROM pg_backup_stop(true)",
        }
    }
}

/// Parse the major version from `SHOW server_version` output.
///
/// Accepts values such as `16.2`, `9.6.24` and `15.4 (Debian 15.4-1.pgdg120+1)`.
pub fn parse_major_version(version: &str) -> Option<u32> {
    version
        .split_whitespace()
        .next()?
        .split('.')
        .next()?
        .parse()
        .ok()
}

pub struct PgDriver {
    connector: Arc<dyn PgConnector>,
    config: Option<DriverConfig>,
    versions: HashMap<String, u32>,
    /// Sessions owning a session-scoped backup, keyed by database
    held: HashMap<String, Box<dyn PgSession>>,
}

impl PgDriver {
    pub fn new(connector: Arc<dyn PgConnector>) -> Self {
        Self {
            connector,
            config: None,
            versions: HashMap::new(),
            held: HashMap::new(),
        }
    }

    pub fn live() -> Self {
        Self::new(Arc::new(LivePgConnector::default()))
    }

    /// Major version per database, as discovered by `connect`
    pub fn versions(&self) -> &HashMap<String, u32> {
        &self.versions
    }

    /// Databases whose backup session is currently held
    pub fn held_databases(&self) -> Vec<String> {
        let mut databases: Vec<String> = self.held.keys().cloned().collect();
        databases.sort();
        databases
    }

    pub fn init(&mut self, config: &DriverConfig) -> Result<(), DriverError> {
        if config.databases.is_empty() {
            return Err(DriverError::Configuration(
                "postgres requires at least one database".to_string(),
            ));
        }
        config.endpoint()?;

        if self
            .config
            .as_ref()
            .is_some_and(|current| current.connection_changed(config))
        {
            if !self.held.is_empty() {
                return Err(DriverError::Configuration(format!(
                    "connection settings cannot change while backups run on {:?}",
                    self.held_databases()
                )));
            }
            self.versions.clear();
        }

        self.config = Some(config.clone());
        Ok(())
    }

    fn target(&self, database: &str) -> Result<PgTarget, DriverError> {
        let config = require_config(self.config.as_ref())?;
        let (host, port) = config.endpoint()?;
        Ok(PgTarget {
            host,
            port,
            username: config.username.clone(),
            password: config.password.clone(),
            database: database.to_string(),
        })
    }

    fn databases(&self) -> Result<Vec<String>, DriverError> {
        Ok(require_config(self.config.as_ref())?.databases.clone())
    }

    fn backup_label(&self) -> Result<String, DriverError> {
        Ok(format!("apphook-{}", require_config(self.config.as_ref())?.name))
    }

    #[instrument(skip(self))]
    pub async fn connect(&mut self) -> Result<(), DriverError> {
        for database in self.databases()? {
            let major = self.discover_version(&database).await?;
            debug!(database = %database, major, "Connected to postgres");
        }
        Ok(())
    }

    async fn discover_version(&mut self, database: &str) -> Result<u32, DriverError> {
        let session = self.connector.open(&self.target(database)?).await?;
        let raw = session
            .query_text("SHOW server_version", &[])
            .await
            .map_err(|e| DriverError::Connectivity(format!("{}: {}", database, e)))?;
        let major = parse_major_version(&raw).ok_or_else(|| {
            DriverError::Connectivity(format!("unrecognised server_version '{}'", raw))
        })?;
        self.versions.insert(database.to_string(), major);
        Ok(major)
    }

    async fn version(&mut self, database: &str) -> Result<u32, DriverError> {
        match self.versions.get(database) {
            Some(major) => Ok(*major),
            None => self.discover_version(database).await,
        }
    }

    /// Start a backup in every database; a backup already running counts
    /// as success.
    #[instrument(skip(self))]
    pub async fn quiesce(&mut self) -> Result<PgResult, DriverError> {
        let label = self.backup_label()?;
        let databases = self.databases()?;
        let mut start_lsn = Vec::with_capacity(databases.len());

        for database in &databases {
            let api = BackupApi::for_version(self.version(database).await?);

            if api == BackupApi::Session && self.held.contains_key(database) {
                debug!(database = %database, "Backup session already held");
                start_lsn.push(String::new());
                continue;
            }

            let session = self.connector.open(&self.target(database)?).await?;
            match session
                .query_text(api.start_statement(), std::slice::from_ref(&label))
                .await
            {
                Ok(lsn) => {
                    info!(database = %database, lsn = %lsn, "Started backup");
                    start_lsn.push(lsn);
                    if api == BackupApi::Session {
                        self.held.insert(database.clone(), session);
                    }
                }
                Err(e) if error_contains(&e, BACKUP_ALREADY_RUNNING) => {
                    info!(database = %database, "Backup already in progress");
                    start_lsn.push(String::new());
                }
                Err(e) => {
                    return Err(DriverError::Operation(format!(
                        "start backup in {}: {}",
                        database,
                        error_message(&e)
                    )));
                }
            }
        }

        Ok(PgResult {
            backup_label: label,
            databases,
            start_lsn,
        })
    }

    /// Drop held backup sessions, which ends their backups on the server
    pub fn close(&mut self) {
        self.held.clear();
    }

    /// Stop the backup in every database; no backup running counts as success.
    #[instrument(skip(self))]
    pub async fn unquiesce(&mut self) -> Result<(), DriverError> {
        for database in self.databases()? {
            let api = BackupApi::for_version(self.version(&database).await?);

            let outcome = match api {
                BackupApi::Session => match self.held.remove(&database) {
                    Some(session) => session.query_text(api.stop_statement(), &[]).await,
                    None => {
                        debug!(database = %database, "No backup session held, backup ended with its session");
                        continue;
                    }
                },
                BackupApi::Exclusive => {
                    let session = self.connector.open(&self.target(&database)?).await?;
                    session.query_text(api.stop_statement(), &[]).await
                }
            };

            match outcome {
                Ok(lsn) => info!(database = %database, lsn = %lsn, "Stopped backup"),
                Err(e) if error_contains(&e, BACKUP_NOT_RUNNING) => {
                    info!(database = %database, "Backup not in progress");
                }
                Err(e) => {
                    return Err(DriverError::Operation(format!(
                        "stop backup in {}: {}",
                        database,
                        error_message(&e)
                    )));
                }
            }
        }
        Ok(())
    }
}

fn error_message(error: &DriverError) -> String {
    match error {
        DriverError::Configuration(m) | DriverError::Connectivity(m) | DriverError::Operation(m) => {
            m.clone()
        }
        DriverError::Timeout { .. } => error.to_string(),
    }
}

fn error_contains(error: &DriverError, needle: &str) -> bool {
    error_message(error).contains(needle)
}

/// Connector backed by `tokio-postgres`
#[derive(Clone, Debug)]
pub struct LivePgConnector {
    connect_timeout: Duration,
}

impl Default for LivePgConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECTION_TIMEOUT,
        }
    }
}

#[async_trait]
impl PgConnector for LivePgConnector {
    #[instrument(skip(self, target), fields(host = %target.host, database = %target.database))]
    async fn open(&self, target: &PgTarget) -> Result<Box<dyn PgSession>, DriverError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .user(&target.username)
            .password(&target.password)
            .dbname(&target.database)
            .application_name("apphook-operator")
            .connect_timeout(self.connect_timeout);

        let (client, connection) = tokio::time::timeout(self.connect_timeout, config.connect(NoTls))
            .await
            .map_err(|_| DriverError::timeout("postgres connect", self.connect_timeout))?
            .map_err(|e| DriverError::Connectivity(pg_message(&e)))?;

        let database = target.database.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                trace!(database = %database, "Postgres connection closed: {}", e);
            }
        });

        Ok(Box::new(LivePgSession { client }))
    }
}

struct LivePgSession {
    client: tokio_postgres::Client,
}

#[async_trait]
impl PgSession for LivePgSession {
    async fn query_text(&self, statement: &str, args: &[String]) -> Result<String, DriverError> {
        let params: Vec<&(dyn ToSql + Sync)> =
            args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();
        let row = self
            .client
            .query_one(statement, &params)
            .await
            .map_err(|e| DriverError::Operation(pg_message(&e)))?;
        row.try_get::<_, String>(0)
            .map_err(|e| DriverError::Operation(pg_message(&e)))
    }
}

/// Prefer the server's message over the client's wrapper text
fn pg_message(error: &tokio_postgres::Error) -> String {
    error
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| error.to_string())
}
