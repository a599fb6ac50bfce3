use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TirelireError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub data_dir: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cron_secret: Option<String>,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_invoice_bytes")]
    pub max_invoice_bytes: u64,
    #[serde(default = "default_max_avatar_bytes")]
    pub max_avatar_bytes: u64,
    /// Seconds between background recurring runs; 0 disables the runner.
    #[serde(default = "default_recurring_interval_secs")]
    pub recurring_interval_secs: u64,
    #[serde(default)]
    pub admin_user_id: Option<i64>,
    #[serde(default)]
    pub admin_token: Option<String>,
    /// SQLCipher passphrase. Plain SQLite when unset.
    #[serde(default)]
    pub db_key: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_allowed_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

fn default_max_invoice_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_avatar_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_recurring_interval_secs() -> u64 {
    3600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().to_string_lossy().to_string(),
            host: default_host(),
            port: default_port(),
            cron_secret: None,
            allowed_origins: default_allowed_origins(),
            max_invoice_bytes: default_max_invoice_bytes(),
            max_avatar_bytes: default_max_avatar_bytes(),
            recurring_interval_secs: default_recurring_interval_secs(),
            admin_user_id: None,
            admin_token: None,
            db_key: None,
        }
    }
}

impl Settings {
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("tirelire.db")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("uploads")
    }

    /// Cron secret from `TIRELIRE_CRON_SECRET`, falling back to the settings file.
    pub fn effective_cron_secret(&self) -> Option<String> {
        std::env::var("TIRELIRE_CRON_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.cron_secret.clone().filter(|s| !s.is_empty()))
    }
}

fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TIRELIRE_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tirelire")
}

fn settings_path() -> PathBuf {
    config_dir().join("settings.json")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".local")
        .join("share")
        .join("tirelire")
}

pub fn load_settings() -> Settings {
    let path = settings_path();
    if path.exists() {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        serde_json::from_str(&content).unwrap_or_default()
    } else {
        Settings::default()
    }
}

pub fn save_settings(settings: &Settings) -> Result<()> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| TirelireError::Settings(e.to_string()))?;
    std::fs::write(settings_path(), format!("{json}\n"))?;
    Ok(())
}

pub fn settings_file_exists() -> bool {
    settings_path().exists()
}

pub fn shellexpand_path(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .to_string_lossy()
        .to_string()
}
