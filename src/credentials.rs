//! Credentials for the ingestion service and for the storage objects it reads.
//!
//! Values are read once at startup, either from the process environment or
//! from a mounted YAML secret. Secrets never appear in `Debug` output.
use serde::Deserialize;
use std::fmt;
use std::fs;
use tracing::info;

use crate::config::{ConfigError, CredentialSource};

pub const APP_ID_VAR: &str = "AppId";
pub const APP_KEY_VAR: &str = "AppKey";
pub const TENANT_VAR: &str = "AppTenant";
pub const SOURCE_CREDENTIALS_VAR: &str = "AwsCredentials";

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub app_id: String,
    pub app_key: String,
    pub tenant: String,
    /// Appended to every source URI so the backend can read the object.
    pub source_credentials: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("app_id", &self.app_id)
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct SecretFile {
    app_id: Option<String>,
    app_key: Option<String>,
    tenant: Option<String>,
    aws_credentials: Option<String>,
}

/// Resolve the credential from the configured source.
pub fn load(source: &CredentialSource) -> Result<Credential, ConfigError> {
    let credential = match source {
        CredentialSource::Env => from_lookup(|name| std::env::var(name).ok())?,
        CredentialSource::File { path } => {
            let content = fs::read_to_string(path)?;
            let secret: SecretFile = serde_yaml::from_str(&content)?;
            build(
                secret.app_id,
                secret.app_key,
                secret.tenant,
                secret.aws_credentials,
            )?
        }
    };
    info!(app_id = %credential.app_id, tenant = %credential.tenant, "loaded ingestion credentials");
    Ok(credential)
}

pub fn from_lookup<F>(lookup: F) -> Result<Credential, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    build(
        lookup(APP_ID_VAR),
        lookup(APP_KEY_VAR),
        lookup(TENANT_VAR),
        lookup(SOURCE_CREDENTIALS_VAR),
    )
}

fn build(
    app_id: Option<String>,
    app_key: Option<String>,
    tenant: Option<String>,
    source_credentials: Option<String>,
) -> Result<Credential, ConfigError> {
    fn require(value: Option<String>, name: &'static str) -> Result<String, ConfigError> {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingCredential(name))
    }

    Ok(Credential {
        app_id: require(app_id, APP_ID_VAR)?,
        app_key: require(app_key, APP_KEY_VAR)?,
        tenant: require(tenant, TENANT_VAR)?,
        source_credentials: require(source_credentials, SOURCE_CREDENTIALS_VAR)?,
    })
}
