use anyhow::{bail, Result};
use std::env;
use std::fmt;

pub const DEFAULT_DB_POOL_MAX_SIZE: usize = 20;
pub const DEFAULT_SUBSCRIBE_LIMIT: usize = 100;

pub fn env_int(name: &str) -> Option<usize> {
    match env::var(name) {
        Ok(str) => str.parse::<usize>().ok(),
        _ => None,
    }
}

pub fn env_str(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(str) if !str.is_empty() => Some(str),
        _ => None,
    }
}

#[derive(Clone)]
pub struct LabelerConfig {
    /// Service DID, used as `src` when a label doesn't name one.
    pub did: String,
    /// Hex-encoded secp256k1 private key.
    pub signing_key: String,
    /// Postgres URL. Labels are kept in memory when unset.
    pub database_url: Option<String>,
    pub db_pool_max_size: usize,
    /// Page size for cursor catch-up.
    pub subscribe_limit: usize,
}

impl fmt::Debug for LabelerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelerConfig")
            .field("did", &self.did)
            .field("signing_key", &"<redacted>")
            .field("database_url", &self.database_url.as_ref().map(|_| "<redacted>"))
            .field("db_pool_max_size", &self.db_pool_max_size)
            .field("subscribe_limit", &self.subscribe_limit)
            .finish()
    }
}

/// Values given explicitly, e.g. on the command line. Each one wins over its
/// environment variable.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub did: Option<String>,
    pub signing_key: Option<String>,
    pub database_url: Option<String>,
    pub db_pool_max_size: Option<usize>,
    pub subscribe_limit: Option<usize>,
}

impl LabelerConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(ConfigOverrides::default())
    }

    pub fn load(overrides: ConfigOverrides) -> Result<Self> {
        let Some(did) = overrides.did.or_else(|| env_str("LABELER_DID")) else {
            bail!("LABELER_DID must be set");
        };
        let Some(signing_key) = overrides
            .signing_key
            .or_else(|| env_str("LABELER_SIGNING_KEY"))
        else {
            bail!("LABELER_SIGNING_KEY must be set");
        };
        Ok(Self {
            did,
            signing_key,
            database_url: overrides
                .database_url
                .or_else(|| env_str("DATABASE_URL")),
            db_pool_max_size: overrides
                .db_pool_max_size
                .or_else(|| env_int("DB_POOL_MAX_SIZE"))
                .unwrap_or(DEFAULT_DB_POOL_MAX_SIZE),
            subscribe_limit: overrides
                .subscribe_limit
                .or_else(|| env_int("LABELER_SUBSCRIBE_LIMIT"))
                .unwrap_or(DEFAULT_SUBSCRIBE_LIMIT),
        })
    }
}
