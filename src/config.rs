use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub const DEFAULT_PORT: u16 = 7171;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;
pub const DEFAULT_COMMAND_LEASE_SECS: u64 = 60;
pub const DEFAULT_MAX_PENDING_PER_DEVICE: u32 = 100;

const DATA_DIR_ENV: &str = "FLEETDBX_DATA_DIR";
const CONFIG_PATH_ENV: &str = "FLEETDBX_CONFIG";
const ORG_TOKEN_LEN: usize = 32;
const SESSION_SECRET_LEN: usize = 48;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Name of the organization seeded when the store is empty.
    #[serde(default = "default_org_name")]
    pub default_org_name: String,
    /// API token for the seeded organization; generated on first run.
    #[serde(default)]
    pub default_org_token: Option<String>,
    /// HMAC secret used to sign session tokens; generated on first run.
    #[serde(default)]
    pub session_secret: Option<String>,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_command_lease_secs")]
    pub command_lease_secs: u64,
    #[serde(default = "default_max_pending_per_device")]
    pub max_pending_per_device: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
            default_org_name: default_org_name(),
            default_org_token: None,
            session_secret: None,
            session_ttl_secs: default_session_ttl_secs(),
            command_lease_secs: default_command_lease_secs(),
            max_pending_per_device: default_max_pending_per_device(),
            created_at: now,
            updated_at: now,
            agent: AgentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub org_token: Option<String>,
    /// Hostname reported in telemetry; falls back to $HOSTNAME when empty.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_report_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            device_id: String::new(),
            org_token: None,
            hostname: None,
            interval_secs: default_report_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_org_name() -> String {
    "default".to_string()
}

fn default_session_ttl_secs() -> u64 {
    DEFAULT_SESSION_TTL_SECS
}

fn default_command_lease_secs() -> u64 {
    DEFAULT_COMMAND_LEASE_SECS
}

fn default_max_pending_per_device() -> u32 {
    DEFAULT_MAX_PENDING_PER_DEVICE
}

fn default_server_url() -> String {
    format!("http://127.0.0.1:{DEFAULT_PORT}")
}

fn default_report_interval_secs() -> u64 {
    10
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_data_dir() -> PathBuf {
    if let Some(dir) = env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".local/share/fleetdbx");
    }
    PathBuf::from("fleetdbx-data")
}

pub fn default_config_path() -> PathBuf {
    if let Some(path) = env::var_os(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".config/fleetdbx/config.toml");
    }
    PathBuf::from("fleetdbx/config.toml")
}

/// Loads the configuration from `path` (or the default location), seeding a
/// fresh file with generated secrets when none exists. Secrets missing from
/// an existing file are filled in and written back.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = path.unwrap_or_else(default_config_path);
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let mut config: Config = toml::from_str(&contents)?;
        if config.ensure_secrets() {
            config.save(&config_path)?;
        }
        Ok((config, config_path))
    } else {
        let mut config = Config::default();
        config.ensure_secrets();
        config.save(&config_path)?;
        Ok((config, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleet.db")
    }

    /// Generates the bootstrap organization token and session secret if they
    /// are not configured yet. Returns true when the config was modified.
    pub fn ensure_secrets(&mut self) -> bool {
        let mut updated = false;
        if self
            .default_org_token
            .as_ref()
            .map(|value| value.trim().is_empty())
            .unwrap_or(true)
        {
            self.default_org_token = Some(generate_token(ORG_TOKEN_LEN));
            updated = true;
        }
        if self
            .session_secret
            .as_ref()
            .map(|value| value.trim().is_empty())
            .unwrap_or(true)
        {
            self.session_secret = Some(generate_token(SESSION_SECRET_LEN));
            updated = true;
        }
        if updated {
            self.updated_at = Utc::now();
        }
        updated
    }

    pub fn session_secret(&self) -> Result<&str> {
        self.session_secret
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| FleetError::Config("session secret is not configured".to_string()))
    }

    pub fn default_org_token(&self) -> Result<&str> {
        self.default_org_token
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                FleetError::Config("default organization token is not configured".to_string())
            })
    }
}

/// Random alphanumeric token material for organization tokens and secrets.
pub fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
