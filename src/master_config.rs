//! C1: the master configuration document — the single writable source of
//! truth for site-wide settings (hostname, identity-provider connection
//! details, database credentials, per-app overrides) that every synthesized
//! service config is derived from.
use crate::{error::ConfigError, runtime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Connection details for the identity provider (Keycloak-compatible OIDC).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityProviderConfig {
    /// Direct, loopback-reachable URL for the IDP's own admin API calls.
    pub backend_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub admin_user: String,
    pub admin_password: String,
    /// Port the IDP's Java process listens on locally.
    pub port: u16,
}

/// Credentials and connection parameters for the shared relational database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Connection parameters for the optional graph database, when installed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphDatabaseConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Per-service override block under `apps.<name>`. Every field is optional:
/// a service with no entry here still gets its catalog port and a database
/// derived from the shared `DatabaseConfig`, but can override the database
/// name/credentials or carry free-form values for its own `.conf` sections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AppOverride {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database_kind: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
    #[serde(default)]
    pub custom_sections: BTreeMap<String, BTreeMap<String, String>>,
}

/// The master configuration document, persisted as JSON under
/// `instance/configs/master_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasterConfig {
    pub schema_version: u32,
    /// Public hostname this installation is reachable at. Changing it
    /// triggers IDP reconciliation and config re-synthesis.
    pub hostname: String,
    /// Secret used to sign the orchestrator's own session artifacts.
    #[serde(default)]
    pub secret_key: String,
    /// Default logging verbosity, overridable per-invocation by `LOG_LEVEL`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub graph_database: Option<GraphDatabaseConfig>,
    pub identity_provider: Option<IdentityProviderConfig>,
    /// Per-service overrides, keyed by service name.
    #[serde(default)]
    pub apps: BTreeMap<String, AppOverride>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl MasterConfig {
    /// Loads the master configuration from disk, migrating older schema
    /// versions forward as needed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = runtime::master_config_path();
        let raw = fs::read_to_string(&path)?;
        let mut config: MasterConfig = serde_json::from_str(&raw)?;
        config.migrate()?;
        Ok(config)
    }

    /// Loads the master configuration if present, or `None` if this is a
    /// fresh install with no prior configuration written yet.
    pub fn load_optional() -> Result<Option<Self>, ConfigError> {
        let path = runtime::master_config_path();
        if !path.exists() {
            return Ok(None);
        }
        Self::load().map(Some)
    }

    /// Loads the master configuration, constructing a fresh-install default
    /// (hostname `localhost`, no identity provider, no apps) if none has
    /// ever been saved.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        Ok(Self::load_optional()?.unwrap_or_else(Self::default_new))
    }

    /// The document a brand-new installation starts from.
    pub fn default_new() -> Self {
        MasterConfig {
            schema_version: CURRENT_SCHEMA_VERSION,
            hostname: "localhost".to_string(),
            secret_key: String::new(),
            log_level: default_log_level(),
            database: DatabaseConfig {
                host: "127.0.0.1".to_string(),
                port: 5432,
                username: "helm".to_string(),
                password: String::new(),
            },
            graph_database: None,
            identity_provider: None,
            apps: BTreeMap::new(),
        }
    }

    fn migrate(&mut self) -> Result<(), ConfigError> {
        if self.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedSchema {
                found: self.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        // No migrations defined yet; schema_version 0 documents predate
        // this field and are treated as version 1 in place.
        self.schema_version = CURRENT_SCHEMA_VERSION;
        Ok(())
    }

    /// Atomically persists the document: write to a temp file in the same
    /// directory as the target, then rename over it so readers never observe
    /// a partial write.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = runtime::master_config_path();
        let parent = path.parent().ok_or_else(|| ConfigError::InvalidPath(path.display().to_string()))?;
        fs::create_dir_all(parent)?;

        let serialized = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(serialized.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Replaces the hostname, leaving every other field untouched.
    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
    }

    /// Installs or replaces the identity-provider connection details.
    pub fn set_identity_provider(&mut self, idp: IdentityProviderConfig) {
        self.identity_provider = Some(idp);
    }

    /// Clears the identity-provider connection details, e.g. when a
    /// hostname change forces the bootstrap to run again from scratch.
    pub fn clear_identity_provider(&mut self) {
        self.identity_provider = None;
    }
}
