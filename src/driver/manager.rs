//! Binds one driver to one instance configuration

use tracing::{info, instrument, warn};

use super::{Driver, DriverConfig, DriverError};
use crate::crd::{HookPhase, PreservedConfig, Provider, QuiesceResult};

/// Owns the driver for one AppHook instance.
///
/// Not persisted: after a restart it is rebuilt from the resource and its
/// credential secret.
pub struct DriverManager {
    config: DriverConfig,
    driver: Driver,
    /// Connection change held back until the instance is unquiesced
    pending: Option<DriverConfig>,
}

impl DriverManager {
    /// Build the live driver for `config.provider` and initialize it
    pub fn new(config: DriverConfig) -> Result<Self, DriverError> {
        let driver = Driver::for_provider(config.provider);
        Self::with_driver(config, driver)
    }

    /// Use a prebuilt driver, typically one backed by test connectors
    pub fn with_driver(config: DriverConfig, mut driver: Driver) -> Result<Self, DriverError> {
        if driver.provider() != config.provider {
            return Err(DriverError::Configuration(format!(
                "driver for {} cannot serve provider {}",
                driver.provider(),
                config.provider
            )));
        }
        if config.provider.requires_databases() && config.databases.is_empty() {
            return Err(DriverError::Configuration(format!(
                "{} requires at least one database",
                config.provider
            )));
        }
        driver.init(&config)?;
        Ok(Self {
            config,
            driver,
            pending: None,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn provider(&self) -> Provider {
        self.config.provider
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn pending_config(&self) -> Option<&DriverConfig> {
        self.pending.as_ref()
    }

    /// Apply a new configuration.
    ///
    /// Name and provider are fixed for the manager's lifetime. Connection
    /// changes re-initialize the driver and reconnect, except while the
    /// instance may be quiesced: then the change is kept pending and applied
    /// by the next successful unquiesce. Returns whether a reconnect happened.
    #[instrument(skip(self, config), fields(name = %self.config.name, provider = %self.config.provider))]
    pub async fn update(
        &mut self,
        config: DriverConfig,
        phase: HookPhase,
    ) -> Result<bool, DriverError> {
        if config.name != self.config.name {
            return Err(DriverError::Configuration(format!(
                "name cannot change from '{}' to '{}'",
                self.config.name, config.name
            )));
        }
        if config.provider != self.config.provider {
            return Err(DriverError::Configuration(format!(
                "provider cannot change from {} to {}",
                self.config.provider, config.provider
            )));
        }
        if config.provider.requires_databases() && config.databases.is_empty() {
            return Err(DriverError::Configuration(format!(
                "{} requires at least one database",
                config.provider
            )));
        }

        let changed = self.config.connection_changed(&config);
        if changed && (phase.may_hold_lock() || self.driver.holds_sessions()) {
            if self.pending.as_ref() != Some(&config) {
                warn!(%phase, "Configuration changed while quiesced, deferring until unquiesce");
            }
            self.pending = Some(config);
            return Ok(false);
        }
        self.pending = None;

        if !changed {
            if config != self.config {
                self.driver.init(&config)?;
                self.config = config;
            }
            return Ok(false);
        }

        info!("Configuration changed, reconnecting");
        self.driver.init(&config)?;
        self.config = config;
        self.driver.connect().await?;
        Ok(true)
    }

    pub async fn connect(&mut self) -> Result<(), DriverError> {
        self.driver.connect().await
    }

    pub async fn prepare(&mut self) -> Result<Option<PreservedConfig>, DriverError> {
        self.driver.prepare().await
    }

    pub async fn quiesce(&mut self) -> Result<QuiesceResult, DriverError> {
        self.driver.quiesce().await
    }

    /// Resume the instance, then apply any deferred configuration
    pub async fn unquiesce(
        &mut self,
        preserved: Option<&PreservedConfig>,
    ) -> Result<(), DriverError> {
        self.driver.unquiesce(preserved).await?;

        if let Some(pending) = self.pending.take() {
            match self.driver.init(&pending) {
                Ok(()) => {
                    info!("Applied configuration deferred while quiesced");
                    self.config = pending;
                }
                Err(e) => warn!(error = %e, "Deferred configuration rejected"),
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        self.driver.close().await;
    }
}
