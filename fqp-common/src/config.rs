//! Configuration loading and root folder resolution
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `FQP_CONFIG` environment variable
//! 3. `<config_dir>/fqp/fqp-norm.toml`
//! 4. Compiled defaults (fallback, logged as a warning)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "FQP_CONFIG";
/// Environment variable overriding `[oracle] api_key`
pub const ORACLE_KEY_ENV_VAR: &str = "FQP_ORACLE_API_KEY";

/// Top-level TOML configuration for fqp-norm
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Folder holding the database and relative taxonomy paths
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub oracle: OracleConfig,
    pub pipeline: PipelineConfig,
    pub taxonomy: TaxonomyConfig,
    pub stages: StagesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file; defaults to `<root_folder>/fqp.db`
    pub path: Option<PathBuf>,
    /// Upper bound on lock-contention retries for a single write
    pub max_lock_wait_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_lock_wait_ms: 5000,
        }
    }
}

/// Classification oracle endpoint and call policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Per-request deadline
    pub timeout_secs: u64,
    pub requests_per_minute: u32,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088".to_string(),
            api_key: None,
            timeout_secs: 120,
            requests_per_minute: 30,
            max_attempts: 3,
            initial_backoff_ms: 5000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent documents per sweep (clamped to 1..=4)
    pub workers: usize,
    pub unit_classifier_version: String,
    pub label_classifier_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            unit_classifier_version: "1.0".to_string(),
            label_classifier_version: "1.0".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn effective_workers(&self) -> usize {
        self.workers.clamp(1, 4)
    }
}

/// Taxonomy playbooks keyed by domain category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaxonomyConfig {
    /// domain category -> YAML playbook path
    pub playbooks: BTreeMap<String, PathBuf>,
    /// alias -> domain category (e.g. "banks" -> "banking")
    pub aliases: BTreeMap<String, String>,
}

impl Default for TaxonomyConfig {
    fn default() -> Self {
        let mut playbooks = BTreeMap::new();
        playbooks.insert(
            "banking".to_string(),
            PathBuf::from("playbooks/banking.yml"),
        );
        let mut aliases = BTreeMap::new();
        aliases.insert("banks".to_string(), "banking".to_string());
        Self { playbooks, aliases }
    }
}

/// Currently deployed logic version of each quality stage
///
/// `None` means the stage has no deployed logic; it is never attempted and
/// never checked for version drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub stage_1: Option<String>,
    pub stage_2: Option<String>,
    pub stage_3: Option<String>,
    pub stage_4: Option<String>,
    pub stage_5: Option<String>,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            stage_1: Some("1.0".to_string()),
            stage_2: None,
            stage_3: None,
            stage_4: None,
            stage_5: None,
        }
    }
}

impl StagesConfig {
    pub fn versions(&self) -> [Option<String>; 5] {
        [
            self.stage_1.clone(),
            self.stage_2.clone(),
            self.stage_3.clone(),
            self.stage_4.clone(),
            self.stage_5.clone(),
        ]
    }
}

impl TomlConfig {
    /// Root folder, falling back to the OS-dependent default
    pub fn root_folder(&self) -> PathBuf {
        self.root_folder
            .clone()
            .unwrap_or_else(default_root_folder)
    }

    pub fn database_path(&self) -> PathBuf {
        match &self.database.path {
            Some(path) => self.resolve_path(path),
            None => self.root_folder().join("fqp.db"),
        }
    }

    /// Resolve a possibly-relative path against the root folder
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_folder().join(path)
        }
    }

    /// Oracle API key: environment variable wins over the TOML value
    pub fn oracle_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(ORACLE_KEY_ENV_VAR) {
            if is_valid_key(&key) {
                return Some(key);
            }
        }
        self.oracle
            .api_key
            .as_ref()
            .filter(|k| is_valid_key(k))
            .cloned()
    }
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Locate the config file following the documented priority order
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    dirs::config_dir()
        .map(|d| d.join("fqp").join("fqp-norm.toml"))
        .filter(|p| p.exists())
}

/// Load configuration; a missing file yields defaults
///
/// An explicitly named file (CLI or ENV) that does not exist is an error.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    let explicit = cli_arg.is_some() || std::env::var(CONFIG_ENV_VAR).is_ok();

    let Some(path) = resolve_config_path(cli_arg) else {
        warn!("No config file found, using compiled defaults");
        return Ok(TomlConfig::default());
    };

    if !path.exists() {
        if explicit {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        warn!("Config file {} missing, using compiled defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let config = load_config_file(&path)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Parse a TOML config file
pub fn load_config_file(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/fqp (or /var/lib/fqp for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("fqp"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/fqp"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("fqp"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/fqp"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("fqp"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\fqp"))
    } else {
        PathBuf::from("./fqp_data")
    }
}
