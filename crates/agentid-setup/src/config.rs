use std::env;

use thiserror::Error;

pub const ENV_TENANT_ID: &str = "AGENTID_TENANT_ID";
pub const ENV_CLIENT_ID: &str = "AGENTID_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "AGENTID_CLIENT_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Client-credentials material for the live directory session. Read from the
/// environment so the secret never appears on a command line.
#[derive(Clone, Debug)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl GraphCredentials {
    /// A `--tenant` flag overrides the environment's tenant, letting one
    /// credential set target guest tenants.
    pub fn from_env(tenant_override: Option<&str>) -> Result<Self, ConfigError> {
        let tenant_id = match tenant_override {
            Some(tenant) => tenant.to_string(),
            None => require(ENV_TENANT_ID)?,
        };
        if tenant_id.trim().is_empty() {
            return Err(ConfigError::Invalid("tenant id must not be empty".into()));
        }
        Ok(Self {
            tenant_id,
            client_id: require(ENV_CLIENT_ID)?,
            client_secret: require(ENV_CLIENT_SECRET)?,
        })
    }
}

fn require(key: &'static str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnv(key)),
    }
}
