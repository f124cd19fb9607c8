use crate::coordinator::GenerationOptions;
use crate::offline::OfflineConfig;
use crate::tool_cache::ToolCacheConfig;
use anyhow::{Result, anyhow};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_ttl_secs: u64,
    pub cache_save_interval_secs: u64,
    pub offline_check_interval_secs: u64,
    pub refresh_on_reconnect: bool,
    /// Defaults to `<config dir>/tool_cache.json`.
    pub cache_file: Option<PathBuf>,
    /// Defaults to `<config dir>/backups`.
    pub backup_dir: Option<PathBuf>,
    /// Backup copies kept after a successful run; older ones are pruned.
    pub keep_backups: usize,
    pub force_offline: bool,
    pub disable_parallel: bool,
    /// Version probes.
    pub tool_timeout_secs: u64,
    /// One executor run (`create-next-app` and friends download a lot).
    pub bootstrap_timeout_secs: u64,
    #[serde(skip)]
    base_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 24 * 60 * 60,
            cache_save_interval_secs: 30,
            offline_check_interval_secs: 30,
            refresh_on_reconnect: true,
            cache_file: None,
            backup_dir: None,
            keep_backups: 5,
            force_offline: false,
            disable_parallel: false,
            tool_timeout_secs: 10,
            bootstrap_timeout_secs: 600,
            base_dir: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables, or defaults
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();
        let base_dir = Self::config_dir_from(&env)?;
        Ok(Self::load_from(&base_dir, &env))
    }

    /// Loads `<base_dir>/config.toml` and applies overrides from `env`.
    pub fn load_from(base_dir: &Path, env: &dyn Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::load_file(&base_dir.join(CONFIG_FILE)).unwrap_or_else(|e| {
            info!("{}, using defaults", e);
            Self::default()
        });
        config.base_dir = base_dir.to_path_buf();

        // Environment variables override config file
        if let Some(value) = env("STRATUM_OFFLINE") {
            config.force_offline = is_truthy(&value);
        }
        if let Some(value) = env("STRATUM_NO_PARALLEL") {
            config.disable_parallel = is_truthy(&value);
        }
        if let Some(value) = env("STRATUM_CACHE_TTL_SECS") {
            match value.trim().parse() {
                Ok(secs) => config.cache_ttl_secs = secs,
                Err(_) => warn!("Ignoring STRATUM_CACHE_TTL_SECS={:?}: not a number of seconds", value),
            }
        }

        config
    }

    fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("No config file at {}", path.display()));
        }
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path();
        fs::create_dir_all(&self.base_dir)?;
        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    /// `$STRATUM_HOME`, or `~/.stratum`.
    pub fn get_config_dir() -> Result<PathBuf> {
        Self::config_dir_from(&|key: &str| std::env::var(key).ok())
    }

    fn config_dir_from(env: &dyn Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(dir) = env("STRATUM_HOME").filter(|d| !d.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home.join(".stratum"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_file
            .clone()
            .unwrap_or_else(|| self.base_dir.join("tool_cache.json"))
    }

    pub fn backup_path(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("backups"))
    }

    pub fn cache_config(&self) -> ToolCacheConfig {
        ToolCacheConfig {
            path: Some(self.cache_path()),
            ttl: Duration::from_secs(self.cache_ttl_secs),
            save_interval: Duration::from_secs(self.cache_save_interval_secs),
        }
    }

    pub fn offline_config(&self) -> OfflineConfig {
        OfflineConfig {
            check_interval: Duration::from_secs(self.offline_check_interval_secs),
            ..OfflineConfig::default()
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Run options seeded from configuration; CLI flags are applied on top.
    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            force_offline: self.force_offline,
            disable_parallel: self.disable_parallel,
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout_secs),
            ..GenerationOptions::default()
        }
    }

    pub fn show_config_info(&self) -> Result<()> {
        let config_path = self.config_path();
        println!("Configuration file: {}", config_path.display());
        println!(
            "Status: {}",
            if config_path.exists() { "Found" } else { "Not found (using defaults)" }
        );
        println!("Tool cache: {}", self.cache_path().display());
        println!("Backups: {} (keeping {})", self.backup_path().display(), self.keep_backups);
        println!("Cache TTL: {}s", self.cache_ttl_secs);
        println!("Cache save interval: {}s", self.cache_save_interval_secs);
        println!("Offline check interval: {}s", self.offline_check_interval_secs);
        println!("Refresh on reconnect: {}", self.refresh_on_reconnect);
        println!("Force offline: {}", self.force_offline);
        println!("Disable parallel: {}", self.disable_parallel);
        println!("Tool timeout: {}s", self.tool_timeout_secs);
        println!("Bootstrap timeout: {}s", self.bootstrap_timeout_secs);

        println!("\nEnvironment overrides:");
        println!("  STRATUM_HOME, STRATUM_OFFLINE, STRATUM_NO_PARALLEL, STRATUM_CACHE_TTL_SECS");

        Ok(())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
