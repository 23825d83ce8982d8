use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub server: ServerConfig,

    pub storage: StorageConfig,

    pub security: SecurityConfig,

    pub sync: SyncConfig,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,

    /// Number of tokio worker threads (default: 2)
    /// Set to 0 to use the number of CPU cores
    pub worker_threads: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            worker_threads: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,

    pub port: u16,

    pub cors_allowed_origins: Vec<String>,

    /// Whether to set the Secure flag on the session cookie.
    /// Set to false for local development without HTTPS.
    pub secure_cookies: bool,

    /// Accept `?sessionId=` as a credential. Off by default: tokens in URLs
    /// leak through logs and browser history.
    pub allow_token_in_query: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            secure_cookies: true,
            allow_token_in_query: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    pub database_path: String,

    /// Maximum database connections (default: 5)
    pub max_db_connections: u32,

    /// Minimum database connections (default: 1)
    pub min_db_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_path: "sqlite:data/ticktrack.db".to_string(),
            max_db_connections: 5,
            min_db_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Argon2 memory cost in KiB (default: 8192 = 8MB)
    pub argon2_memory_cost_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_time_cost: u32,

    /// Argon2 parallelism (default: 1)
    pub argon2_parallelism: u32,

    /// Sessions older than this are treated as logged out.
    /// Unset means sessions stay valid until logout. At most ten years.
    pub session_ttl_hours: Option<u64>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            argon2_memory_cost_kib: 8192,
            argon2_time_cost: 3,
            argon2_parallelism: 1,
            session_ttl_hours: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push tick period in milliseconds (default: 1000)
    pub tick_interval_ms: u64,

    /// Upper bound on one subscriber's snapshot lookup during a tick
    pub subscriber_timeout_ms: u64,

    /// Outbound messages buffered per push channel before ticks are dropped
    pub channel_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            subscriber_timeout_ms: 500,
            channel_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,

    pub loki_enabled: bool,

    pub loki_url: String,

    /// `env` field attached to every Loki log line
    pub environment: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            loki_enabled: false,
            loki_url: "http://localhost:3100".to_string(),
            environment: "development".to_string(),
        }
    }
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Upper bound for `security.session_ttl_hours`.
pub const MAX_SESSION_TTL_HOURS: u64 = 24 * 365 * 10;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TICKTRACK_CONFIG";

impl Config {
    /// Loads the first config file found, or defaults when there is none.
    ///
    /// A path in `TICKTRACK_CONFIG` must exist; the search locations are
    /// optional.
    pub fn load() -> Result<Self> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            let path = PathBuf::from(explicit);
            info!(path = %path.display(), "Loading config named by {CONFIG_ENV}");
            return Self::load_from_path(&path);
        }

        match Self::search_paths().into_iter().find(|p| p.is_file()) {
            Some(path) => {
                info!(path = %path.display(), "Loading config");
                Self::load_from_path(&path)
            }
            None => {
                info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("Cannot write {}", path.display()))
    }

    /// Working directory first, then the per-user config dir, then `~/.ticktrack`.
    fn search_paths() -> Vec<PathBuf> {
        let local = PathBuf::from(DEFAULT_CONFIG_FILE);
        let user = dirs::config_dir().map(|d| d.join("ticktrack").join(DEFAULT_CONFIG_FILE));
        let home = dirs::home_dir().map(|d| d.join(".ticktrack").join(DEFAULT_CONFIG_FILE));

        std::iter::once(local).chain(user).chain(home).collect()
    }

    /// Writes a default `config.toml` in the working directory.
    /// Returns `false` when one is already there.
    pub fn create_default_if_missing() -> Result<bool> {
        let path = PathBuf::from(DEFAULT_CONFIG_FILE);
        if path.exists() {
            return Ok(false);
        }

        Self::default().save_to_path(&path)?;
        info!(path = %path.display(), "Wrote default config");
        Ok(true)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.tick_interval_ms == 0 {
            anyhow::bail!("sync.tick_interval_ms must be > 0");
        }

        if self.sync.subscriber_timeout_ms == 0 {
            anyhow::bail!("sync.subscriber_timeout_ms must be > 0");
        }

        if self.sync.channel_capacity == 0 {
            anyhow::bail!("sync.channel_capacity must be > 0");
        }

        if let Some(hours) = self.security.session_ttl_hours
            && !(1..=MAX_SESSION_TTL_HOURS).contains(&hours)
        {
            anyhow::bail!(
                "security.session_ttl_hours must be between 1 and {MAX_SESSION_TTL_HOURS}, got {hours}"
            );
        }

        if self.observability.loki_enabled && self.observability.environment.trim().is_empty() {
            anyhow::bail!("observability.environment cannot be empty when Loki is enabled");
        }

        if self.storage.backend == StorageBackend::Sqlite && self.storage.database_path.is_empty()
        {
            anyhow::bail!("storage.database_path cannot be empty for the sqlite backend");
        }

        Ok(())
    }
}
