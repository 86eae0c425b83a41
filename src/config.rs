use crate::utils::{ensure_dir, get_concierge_home};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, rename = "apiKey")]
    pub api_key: String,
    #[serde(default = "default_base_url", rename = "baseUrl")]
    pub base_url: String,
    #[serde(default = "default_model", rename = "defaultModel")]
    pub default_model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            default_model: default_model(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between idle scans.
    #[serde(default = "default_scan_interval", rename = "scanIntervalSecs")]
    pub scan_interval_secs: u64,
    /// Fixed pause between follow-up candidates, throttling the completion
    /// service and the outbound channel.
    #[serde(default = "default_candidate_delay", rename = "candidateDelayMs")]
    pub candidate_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_secs: default_scan_interval(),
            candidate_delay_ms: default_candidate_delay(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scan_interval() -> u64 {
    300
}

fn default_candidate_delay() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// Directory for per-conversation context files. Defaults to
    /// `~/.concierge/conversations`.
    #[serde(default, rename = "contextDir")]
    pub context_dir: Option<PathBuf>,
    /// SQLite database for tenant records and the invocation audit log.
    /// Defaults to `~/.concierge/records.db`.
    #[serde(default, rename = "recordsDb")]
    pub records_db: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub stores: StoreConfig,
}

impl Config {
    pub fn context_dir(&self) -> Result<PathBuf> {
        match &self.stores.context_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_concierge_home()?.join("conversations")),
        }
    }

    pub fn records_db(&self) -> Result<PathBuf> {
        match &self.stores.records_db {
            Some(path) => Ok(path.clone()),
            None => Ok(get_concierge_home()?.join("records.db")),
        }
    }
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_concierge_home()?.join("config.json"))
}

pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?;
        return Ok(config);
    }

    Ok(Config::default())
}

pub fn save_config(config: &Config, config_path: Option<&Path>) -> Result<()> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    ensure_dir(path.parent().context("Config path has no parent")?)?;
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    // Restrict permissions (best-effort, may fail on Windows)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }

    Ok(())
}
