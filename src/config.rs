//! Configuration loading.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

lazy_static! {
    static ref EXE_PATH: PathBuf = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("nekocast-danmaku"));
    pub static ref DEFAULT_CONFIG_PATH: PathBuf = EXE_PATH.with_file_name("config.json");
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_dedup_window() -> u64 {
    5
}

fn default_blacklist_window() -> u64 {
    20
}

fn default_blacklist_file() -> PathBuf {
    PathBuf::from("blacklist.txt")
}

fn default_forbidden_users_file() -> PathBuf {
    PathBuf::from("forbidden_users.txt")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatoriConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_satori_path")]
    pub path: String,
    pub token: String,
    /// Maps a source-platform channel id to the danmaku channel it fans into.
    #[serde(default)]
    pub group_map: HashMap<String, String>,
}

fn default_satori_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BilibiliConfig {
    /// Room id (as it appears in the JSON key) to danmaku channel.
    pub room_ids: HashMap<String, String>,
    pub sess_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DanmakuConfig {
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    #[serde(default)]
    pub satori: Option<SatoriConfig>,
    #[serde(default)]
    pub bilibili: Option<BilibiliConfig>,
    #[serde(default = "default_dedup_window")]
    pub dedup_window: u64,
    /// Tier-2 decision-cache window; not in the distilled wire schema but
    /// configurable the same way `dedup_window` is.
    #[serde(default = "default_blacklist_window")]
    pub blacklist_window: u64,
    #[serde(default = "default_blacklist_file")]
    pub blacklist_file: PathBuf,
    #[serde(default = "default_forbidden_users_file")]
    pub forbidden_users_file: PathBuf,
}

impl Default for DanmakuConfig {
    fn default() -> Self {
        DanmakuConfig {
            upstream: None,
            satori: None,
            bilibili: None,
            dedup_window: default_dedup_window(),
            blacklist_window: default_blacklist_window(),
            blacklist_file: default_blacklist_file(),
            forbidden_users_file: default_forbidden_users_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub danmaku: DanmakuConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            host: default_host(),
            port: default_port(),
            danmaku: DanmakuConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("parsing config file {0:?}: {1}")]
    Parse(PathBuf, serde_json::Error),
}

/// Loads config from `path`. A missing file yields defaults; a parse error
/// is logged and also falls back to defaults.
pub fn load_config(path: &Path) -> AppConfig {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return AppConfig::default();
    }

    match read_config(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config, falling back to defaults");
            AppConfig::default()
        }
    }
}

fn read_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
}

pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    let contents = serde_json::to_string_pretty(config).expect("AppConfig always serializes");
    fs::write(path, contents).map_err(|e| ConfigError::Read(path.to_path_buf(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_yields_defaults() {
        let cfg = load_config(Path::new("/nonexistent/config.json"));
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.danmaku.dedup_window, 5);
        assert_eq!(cfg.danmaku.blacklist_window, 20);
    }

    #[test]
    fn round_trips_through_json() {
        let mut cfg = AppConfig::default();
        cfg.danmaku.upstream = Some(UpstreamConfig { token: "secret".into() });
        let json = serde_json::to_string(&cfg).unwrap();
        let back: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.danmaku.upstream.unwrap().token, "secret");
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("nekocast-config-test-{:?}", std::thread::current().id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(&path, "{not json").unwrap();
        let cfg = load_config(&path);
        assert_eq!(cfg.port, 8080);
        let _ = fs::remove_dir_all(&dir);
    }
}
