//! Validation of AppHook specs before any driver is built

use crate::controller::error::{Error, Result};
use crate::crd::{AppHook, Provider};
use crate::driver::split_endpoint;

/// Validate the spec and return the parsed provider.
///
/// The operation string is not checked here; unknown operations are
/// rejected by the planner so the phase is left alone.
pub fn validate_spec(hook: &AppHook) -> Result<Provider> {
    let spec = &hook.spec;

    if spec.name.trim().is_empty() {
        return Err(Error::InvalidConfig("spec.name must not be empty".into()));
    }

    let provider: Provider = spec
        .app_provider
        .parse()
        .map_err(|e: crate::crd::SpecParseError| Error::InvalidConfig(e.to_string()))?;

    validate_endpoint(&spec.end_point, provider)?;
    validate_databases(&spec.databases, provider)?;

    if spec.secret.name.trim().is_empty() {
        return Err(Error::InvalidConfig("spec.secret.name must not be empty".into()));
    }

    if let Some(timeout) = spec.timeout_seconds
        && timeout < 0
    {
        return Err(Error::InvalidConfig(format!(
            "spec.timeoutSeconds must not be negative: {}",
            timeout
        )));
    }

    Ok(provider)
}

fn validate_endpoint(endpoint: &str, provider: Provider) -> Result<()> {
    if endpoint.trim().is_empty() {
        return Err(Error::InvalidConfig("spec.endPoint must not be empty".into()));
    }
    split_endpoint(endpoint, provider.default_port())
        .map(|_| ())
        .map_err(|e| Error::InvalidConfig(e.to_string()))
}

fn validate_databases(databases: &[String], provider: Provider) -> Result<()> {
    if provider.requires_databases() && databases.is_empty() {
        return Err(Error::InvalidConfig(format!(
            "{} requires at least one database in spec.databases",
            provider
        )));
    }
    if databases.iter().any(|db| db.trim().is_empty()) {
        return Err(Error::InvalidConfig(
            "spec.databases must not contain empty names".into(),
        ));
    }
    Ok(())
}
