use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";
pub const DEFAULT_LOG_FILTER: &str = "offline_ai_lib=info,offline_ai=info,warn";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default = "default_launch_ollama")]
    pub launch_ollama: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ollama_url: default_ollama_url(),
            selected_model: None,
            database_path: None,
            log_filter: default_log_filter(),
            launch_ollama: default_launch_ollama(),
        }
    }
}

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

fn default_launch_ollama() -> bool {
    true
}

impl AppConfig {
    /// Database file to open: the configured one or the per-user default.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    /// Apply `OLLAMA_HOST`, `OFFLINE_AI_MODEL` and `OFFLINE_AI_DB`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(host) = lookup("OLLAMA_HOST") {
            self.ollama_url = normalize_url(&host);
        }
        if let Some(model) = lookup("OFFLINE_AI_MODEL") {
            self.selected_model = Some(model);
        }
        if let Some(db) = lookup("OFFLINE_AI_DB") {
            self.database_path = Some(PathBuf::from(db));
        }
    }
}

/// `OLLAMA_HOST` is often given as a bare `host:port`.
fn normalize_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "offline-ai", "offline-ai")
}

pub fn default_config_path() -> PathBuf {
    let Some(dirs) = project_dirs() else {
        return Path::new("offline-ai.json").to_path_buf();
    };
    dirs.config_dir().join("config.json")
}

pub fn default_database_path() -> PathBuf {
    let Some(dirs) = project_dirs() else {
        return Path::new("history.db").to_path_buf();
    };
    dirs.data_dir().join("history.db")
}

pub fn load_config(path: &Path) -> AppConfig {
    let Ok(bytes) = fs::read(path) else {
        return AppConfig::default();
    };
    serde_json::from_slice::<AppConfig>(&bytes).unwrap_or_default()
}

pub fn save_config(path: &Path, cfg: &AppConfig) -> Result<(), String> {
    let json = serde_json::to_vec_pretty(cfg).map_err(|e| e.to_string())?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    fs::write(path, json).map_err(|e| e.to_string())
}

/// `.env`, then the config file, then environment overrides.
pub fn load_effective(path: &Path) -> AppConfig {
    dotenvy::dotenv().ok();
    let mut config = load_config(path);
    config.apply_env_overrides();
    config
}
