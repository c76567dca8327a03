//! Configuration loading and root folder resolution
//!
//! Configuration is a single TOML document. Every section has compiled
//! defaults so a missing or partial file never prevents startup.
//!
//! Resolution priority (highest first):
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const ENV_CONFIG: &str = "CORPMAP_CONFIG";
/// Environment variable overriding the root folder
pub const ENV_ROOT_FOLDER: &str = "CORPMAP_ROOT_FOLDER";
/// Environment variable overriding the HTTP bind address
pub const ENV_BIND: &str = "CORPMAP_BIND";

/// Complete TOML configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Folder holding the SQLite database
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-field adapter priority, highest priority first
    ///
    /// ```toml
    /// [priorities]
    /// legal_name = ["registry", "website"]
    /// ```
    #[serde(default)]
    pub priorities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub website: WebsiteConfig,
    /// HTTP JSON provider definitions
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// HTTP server section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub heartbeat_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5780".to_string(),
            heartbeat_secs: crate::sse::DEFAULT_HEARTBEAT.as_secs(),
        }
    }
}

/// Orchestrator section: deadlines, breaker, retry and confidence tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Default per-adapter timeout when an adapter declares none
    pub adapter_timeout_ms: u64,
    /// Deadline for one tier's fan-out/fan-in
    pub tier_deadline_ms: u64,
    /// Deadline for a whole session
    pub session_deadline_ms: u64,
    /// Consecutive failures that open a breaker
    pub failure_threshold: u32,
    /// Consecutive half-open probe successes that close a breaker
    pub success_threshold: u32,
    /// Time an open breaker waits before admitting a probe
    pub cool_down_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Confidence added per extra same-tier source agreeing on a value
    pub agreement_bonus: u8,
    /// Confidence removed when a value contradicts an earlier tier
    pub conflict_penalty: u8,
    /// How long finished sessions stay retrievable
    pub session_retention_secs: u64,
    /// Interval of the expired-session purge task
    pub purge_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            adapter_timeout_ms: 5_000,
            tier_deadline_ms: 10_000,
            session_deadline_ms: 30_000,
            failure_threshold: 5,
            success_threshold: 2,
            cool_down_ms: 60_000,
            retry_max_attempts: 2,
            retry_backoff_ms: 250,
            agreement_bonus: 10,
            conflict_penalty: 15,
            session_retention_secs: 86_400,
            purge_interval_secs: 600,
        }
    }
}

/// Cache section: TTL per field class
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub immutable_ttl_secs: u64,
    pub stable_ttl_secs: u64,
    /// 0 disables caching of volatile fields
    pub volatile_ttl_secs: u64,
    /// Maximum number of in-memory entries
    pub ephemeral_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            immutable_ttl_secs: 3 * 365 * 86_400,
            stable_ttl_secs: 30 * 86_400,
            volatile_ttl_secs: 0,
            ephemeral_capacity: 10_000,
        }
    }
}

/// Built-in homepage adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsiteConfig {
    pub enabled: bool,
    pub tier: u8,
    pub base_confidence: u8,
    pub timeout_ms: Option<u64>,
}

impl Default for WebsiteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tier: 1,
            base_confidence: 40,
            timeout_ms: None,
        }
    }
}

/// One HTTP JSON provider
///
/// ```toml
/// [[adapters]]
/// name = "geo"
/// tier = 2
/// cost_units = 0.01
/// base_confidence = 70
/// url_template = "https://geo.example/v1/company?domain={domain}"
/// api_key_env = "GEO_API_KEY"
/// [adapters.fields]
/// headquarters = "/company/hq/city"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub name: String,
    pub tier: u8,
    #[serde(default)]
    pub cost_units: f64,
    #[serde(default = "default_base_confidence")]
    pub base_confidence: u8,
    pub timeout_ms: Option<u64>,
    /// URL with `{domain}` and `{field_name}` placeholders
    pub url_template: String,
    /// Environment variable holding the API key, if the provider needs one
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    pub requests_per_second: Option<u32>,
    /// Field name → JSON pointer into the response body
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn default_base_confidence() -> u8 {
    50
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

impl TomlConfig {
    /// Check value ranges and deadline nesting
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.failure_threshold == 0 || o.success_threshold == 0 {
            return Err(Error::Config(
                "Breaker thresholds must be at least 1".to_string(),
            ));
        }
        if o.retry_max_attempts == 0 {
            return Err(Error::Config(
                "retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if o.tier_deadline_ms > o.session_deadline_ms {
            return Err(Error::Config(format!(
                "tier_deadline_ms ({}) exceeds session_deadline_ms ({})",
                o.tier_deadline_ms, o.session_deadline_ms
            )));
        }
        if self.website.base_confidence > 100 {
            return Err(Error::Config(
                "website.base_confidence must be within 0-100".to_string(),
            ));
        }
        for adapter in &self.adapters {
            if adapter.name.trim().is_empty() {
                return Err(Error::Config("Adapter name must not be empty".to_string()));
            }
            if adapter.tier == 0 {
                return Err(Error::Config(format!(
                    "Adapter '{}': tier numbers start at 1",
                    adapter.name
                )));
            }
            if adapter.base_confidence > 100 {
                return Err(Error::Config(format!(
                    "Adapter '{}': base_confidence must be within 0-100",
                    adapter.name
                )));
            }
            if adapter.cost_units < 0.0 || !adapter.cost_units.is_finite() {
                return Err(Error::Config(format!(
                    "Adapter '{}': cost_units must be a non-negative number",
                    adapter.name
                )));
            }
            if !adapter.url_template.contains("{domain}") {
                return Err(Error::Config(format!(
                    "Adapter '{}': url_template must contain {{domain}}",
                    adapter.name
                )));
            }
        }
        Ok(())
    }
}

/// Load and validate a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Load the config file if one is found, otherwise compiled defaults
///
/// A missing file is not an error. A file that exists but does not parse
/// or validate is.
pub fn load_or_default(cli_path: Option<&Path>) -> Result<TomlConfig> {
    match config_file_path(cli_path) {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        Some(path) => {
            warn!(
                "Config file {} not found, using compiled defaults",
                path.display()
            );
            Ok(TomlConfig::default())
        }
        None => {
            warn!("No config file found, using compiled defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Locate the config file
///
/// CLI path, then `CORPMAP_CONFIG`, then the per-user and system locations.
pub fn config_file_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(ENV_CONFIG) {
        return Some(PathBuf::from(path));
    }

    let user_config = dirs::config_dir().map(|d| d.join("corpmap").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/corpmap/config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Resolve the root folder following the documented priority order
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml: &TomlConfig) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(ENV_ROOT_FOLDER) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Some(path) = &toml.root_folder {
        return path.clone();
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Resolve the HTTP bind address (CLI → ENV → TOML/default)
pub fn resolve_bind(cli_arg: Option<&str>, toml: &TomlConfig) -> String {
    if let Some(bind) = cli_arg {
        return bind.to_string();
    }
    if let Ok(bind) = std::env::var(ENV_BIND) {
        if !bind.trim().is_empty() {
            return bind;
        }
    }
    toml.server.bind.clone()
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/corpmap (or /var/lib/corpmap for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("corpmap"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/corpmap"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("corpmap"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/corpmap"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("corpmap"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\corpmap"))
    } else {
        PathBuf::from("./corpmap_data")
    }
}

/// Create the root folder if missing and return the database path inside it
pub fn ensure_root_folder(root: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(root)?;
    Ok(root.join("corpmap.db"))
}

/// Standard User-Agent for outbound HTTP requests
pub fn get_user_agent() -> String {
    format!(
        "corpmap/{} ( https://github.com/corpmap/corpmap )",
        env!("CARGO_PKG_VERSION")
    )
}
