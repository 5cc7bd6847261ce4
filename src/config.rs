use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telescope: TelescopeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Business database, accessed through the instrumented [`crate::db::Database`]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

/// Request/query/exception capture settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelescopeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Capture store location (separate from business data)
    #[serde(default = "default_telescope_database_url")]
    pub database_url: String,

    /// Mount point of the management API
    #[serde(default = "default_dashboard_path")]
    pub dashboard_path: String,

    /// Request paths starting with any of these prefixes are never captured
    #[serde(default = "default_excluded_paths")]
    pub excluded_paths: Vec<String>,

    /// Retention caps (rows kept per table)
    #[serde(default = "default_retention_cap")]
    pub max_requests: u32,
    #[serde(default = "default_retention_cap")]
    pub max_exceptions: u32,
    #[serde(default = "default_retention_cap")]
    pub max_queries: u32,

    /// Maximum serialized size of captured payloads, in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    #[serde(default = "default_true")]
    pub capture_headers: bool,
    #[serde(default = "default_true")]
    pub capture_request_body: bool,
    #[serde(default = "default_true")]
    pub capture_response_body: bool,

    /// Query writer batching
    #[serde(default = "default_query_batch_size")]
    pub query_batch_size: usize,
    #[serde(default = "default_query_flush_interval_ms")]
    pub query_flush_interval_ms: u64,

    /// Period of the background retention sweep
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
}

impl TelescopeConfig {
    /// Whether `path` matches one of the excluded prefixes
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|prefix| !prefix.is_empty() && path.starts_with(prefix.as_str()))
    }

    pub fn query_flush_interval(&self) -> Duration {
        Duration::from_millis(self.query_flush_interval_ms)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    /// In-memory store with default caps, for tests and embedding
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: default_telescope_database_url(),
            dashboard_path: default_dashboard_path(),
            excluded_paths: default_excluded_paths(),
            max_requests: default_retention_cap(),
            max_exceptions: default_retention_cap(),
            max_queries: default_retention_cap(),
            max_body_size: default_max_body_size(),
            capture_headers: true,
            capture_request_body: true,
            capture_response_body: true,
            query_batch_size: default_query_batch_size(),
            query_flush_interval_ms: default_query_flush_interval_ms(),
            retention_interval_secs: default_retention_interval_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_database_url() -> String {
    "sqlite:./data/civic.db".to_string()
}

fn default_telescope_database_url() -> String {
    "sqlite:./data/telescope.db".to_string()
}

fn default_dashboard_path() -> String {
    "/telescope".to_string()
}

fn default_excluded_paths() -> Vec<String> {
    vec!["/telescope".to_string(), "/uploads".to_string()]
}

fn default_retention_cap() -> u32 {
    1000
}

fn default_max_body_size() -> usize {
    100_000
}

fn default_query_batch_size() -> usize {
    100
}

fn default_query_flush_interval_ms() -> u64 {
    100
}

fn default_retention_interval_secs() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

/// Load configuration from an optional file plus `CIVIC_*` environment overrides
///
/// Example override: `CIVIC_TELESCOPE__ENABLED=false`
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(
            config::Environment::with_prefix("CIVIC")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("telescope.excluded_paths")
                .try_parsing(true),
        )
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.server.port == 0 {
        anyhow::bail!("Server port must be non-zero");
    }

    if !matches!(cfg.server.log_format.as_str(), "text" | "json") {
        anyhow::bail!("Invalid log format '{}', expected 'text' or 'json'", cfg.server.log_format);
    }

    let telescope = &cfg.telescope;

    for (name, cap) in [
        ("max_requests", telescope.max_requests),
        ("max_exceptions", telescope.max_exceptions),
        ("max_queries", telescope.max_queries),
    ] {
        if cap == 0 {
            anyhow::bail!("telescope.{} must be greater than zero", name);
        }
    }

    if telescope.max_body_size == 0 {
        anyhow::bail!("telescope.max_body_size must be greater than zero");
    }

    if telescope.query_batch_size == 0 {
        anyhow::bail!("telescope.query_batch_size must be greater than zero");
    }

    if !telescope.dashboard_path.starts_with('/') {
        anyhow::bail!(
            "telescope.dashboard_path must start with '/', got '{}'",
            telescope.dashboard_path
        );
    }

    Ok(())
}
