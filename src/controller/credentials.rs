//! Credential lookup from the administrative namespace

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{Provider, SecretReference};
use crate::driver::Credentials;

pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";

/// Namespace the referenced secret must be read from.
///
/// Secrets are only read from the operator's own namespace; a reference to
/// any other namespace is rejected.
pub fn secret_namespace(reference: &SecretReference, admin_namespace: &str) -> Result<String> {
    match reference.namespace.as_deref().map(str::trim) {
        None | Some("") => Ok(admin_namespace.to_string()),
        Some(ns) if ns == admin_namespace => Ok(ns.to_string()),
        Some(ns) => Err(Error::InvalidConfig(format!(
            "secret '{}' must be in namespace '{}', not '{}'",
            reference.name, admin_namespace, ns
        ))),
    }
}

fn read_key(secret: &Secret, key: &str) -> Option<String> {
    if let Some(value) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(String::from_utf8_lossy(&value.0).trim_end_matches('\n').to_string());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}

/// Extract credentials; Redis may run without a username or password
pub fn credentials_from_secret(secret: &Secret, provider: Provider) -> Result<Credentials> {
    let username = read_key(secret, USERNAME_KEY);
    let password = read_key(secret, PASSWORD_KEY);

    if provider == Provider::Redis {
        return Ok(Credentials::new(
            username.unwrap_or_default(),
            password.unwrap_or_default(),
        ));
    }

    let username = username
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::InvalidConfig(format!("secret is missing '{}'", USERNAME_KEY)))?;
    let password =
        password.ok_or_else(|| Error::InvalidConfig(format!("secret is missing '{}'", PASSWORD_KEY)))?;
    Ok(Credentials::new(username, password))
}

/// Read the credential secret referenced by a hook
pub async fn fetch_credentials(
    client: Client,
    reference: &SecretReference,
    admin_namespace: &str,
    provider: Provider,
) -> Result<Credentials> {
    let namespace = secret_namespace(reference, admin_namespace)?;
    let api: Api<Secret> = Api::namespaced(client, &namespace);

    let secret = api.get_opt(&reference.name).await?.ok_or_else(|| {
        Error::TransientError(format!(
            "secret {}/{} not found",
            namespace, reference.name
        ))
    })?;
    debug!(secret = %reference.name, %namespace, "Loaded credential secret");

    credentials_from_secret(&secret, provider)
}
