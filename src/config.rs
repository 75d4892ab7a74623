use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::constants::*;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheDirs {
    /// Flat cache directory, watched non-recursively.
    #[serde(default)]
    pub main: PathBuf,
    /// Network cache tree, watched recursively.
    #[serde(default)]
    pub network: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_index_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_dataset_name")]
    pub dataset_name: String,
    #[serde(default)]
    pub state_path: PathBuf,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_index_endpoint(),
            api_key: String::new(),
            dataset_name: default_dataset_name(),
            state_path: PathBuf::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub profile_dir: PathBuf,
    #[serde(default)]
    pub history_path: PathBuf,
    #[serde(default)]
    pub cookies_path: PathBuf,
    #[serde(default)]
    pub cache_dirs: CacheDirs,
    #[serde(default)]
    pub temp_dir: PathBuf,
    #[serde(default)]
    pub save_dir: PathBuf,

    #[serde(default = "default_record_limit")]
    pub record_limit: usize,
    #[serde(default)]
    pub monitor_enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_wait_ms")]
    pub batch_wait_ms: u64,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    #[serde(default = "default_min_cache_file_size")]
    pub min_cache_file_size: u64,
    #[serde(default = "default_min_html_len")]
    pub min_html_len: usize,
    #[serde(default = "default_min_blob_len")]
    pub min_blob_len: usize,

    #[serde(default = "default_true")]
    pub fetch_fallback: bool,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_fetch_max_retries")]
    pub fetch_max_retries: u32,
    #[serde(default = "default_fetch_backoff_ms")]
    pub fetch_backoff_ms: u64,
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_accept")]
    pub accept: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,

    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_true")]
    pub outcome_log: bool,

    #[serde(default)]
    pub index: IndexConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::new(),
            history_path: PathBuf::new(),
            cookies_path: PathBuf::new(),
            cache_dirs: CacheDirs::default(),
            temp_dir: PathBuf::new(),
            save_dir: PathBuf::new(),
            record_limit: DEFAULT_RECORD_LIMIT,
            monitor_enabled: false,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_wait_ms: DEFAULT_BATCH_WAIT_MS,
            progress_every: DEFAULT_PROGRESS_EVERY,
            min_cache_file_size: DEFAULT_MIN_CACHE_FILE_SIZE,
            min_html_len: DEFAULT_MIN_HTML_LEN,
            min_blob_len: DEFAULT_MIN_BLOB_LEN,
            fetch_fallback: true,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            fetch_max_retries: DEFAULT_FETCH_MAX_RETRIES,
            fetch_backoff_ms: DEFAULT_FETCH_BACKOFF_MS,
            fetch_workers: DEFAULT_FETCH_WORKERS,
            user_agent: default_user_agent(),
            accept: default_accept(),
            accept_language: default_accept_language(),
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            outcome_log: true,
            index: IndexConfig::default(),
        }
    }
}

impl Config {
    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn cache_roots(&self) -> Vec<(PathBuf, bool)> {
        vec![
            (self.cache_dirs.main.clone(), false),
            (self.cache_dirs.network.clone(), true),
        ]
    }

    pub fn state_dir(&self) -> PathBuf {
        self.save_dir.join(STATE_DIR_NAME)
    }

    /// Fill every empty path with the platform default for a Chrome "Default" profile.
    pub fn resolve_paths(&mut self) {
        if self.profile_dir.as_os_str().is_empty() {
            self.profile_dir = default_profile_dir();
        }
        if self.history_path.as_os_str().is_empty() {
            self.history_path = self.profile_dir.join("History");
        }
        if self.cookies_path.as_os_str().is_empty() {
            self.cookies_path = self.profile_dir.join("Cookies");
        }
        let cache_root = default_cache_dir();
        if self.cache_dirs.main.as_os_str().is_empty() {
            self.cache_dirs.main = cache_root.join("Cache");
        }
        if self.cache_dirs.network.as_os_str().is_empty() {
            self.cache_dirs.network = cache_root.join("Cache").join("Cache_Data");
        }
        if self.temp_dir.as_os_str().is_empty() {
            self.temp_dir = std::env::temp_dir().join("histmark");
        }
        if self.save_dir.as_os_str().is_empty() {
            self.save_dir = dirs::download_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("markdown_exports");
        }
        if self.index.state_path.as_os_str().is_empty() {
            self.index.state_path = self.state_dir().join("index_state.json");
        }
    }

    fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var("HISTMARK_INDEX_URL") {
            if !endpoint.trim().is_empty() {
                self.index.endpoint = endpoint;
            }
        }
        if let Ok(key) = std::env::var("HISTMARK_INDEX_KEY") {
            if !key.trim().is_empty() {
                self.index.api_key = key;
                self.index.enabled = true;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub config_hash: String,
}

pub fn load_config(path: Option<&Path>) -> Result<LoadedConfig> {
    let bytes: Vec<u8> = if let Some(p) = path {
        std::fs::read(p)?
    } else {
        include_bytes!("../config/default.yml").to_vec()
    };

    let mut config: Config = serde_yaml::from_slice(&bytes)?;
    config.apply_env();
    config.resolve_paths();

    let config_hash = hash_bytes(&bytes);

    Ok(LoadedConfig { config, config_hash })
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(digest)
}

#[cfg(target_os = "macos")]
fn default_profile_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join("Library/Application Support/Google/Chrome/Default")
}

#[cfg(target_os = "macos")]
fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join("Library/Caches/Google/Chrome/Default")
}

#[cfg(not(target_os = "macos"))]
fn default_profile_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_default()
        .join("google-chrome")
        .join("Default")
}

#[cfg(not(target_os = "macos"))]
fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_default()
        .join("google-chrome")
        .join("Default")
}

fn default_true() -> bool {
    true
}
fn default_record_limit() -> usize {
    DEFAULT_RECORD_LIMIT
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_batch_wait_ms() -> u64 {
    DEFAULT_BATCH_WAIT_MS
}
fn default_progress_every() -> usize {
    DEFAULT_PROGRESS_EVERY
}
fn default_min_cache_file_size() -> u64 {
    DEFAULT_MIN_CACHE_FILE_SIZE
}
fn default_min_html_len() -> usize {
    DEFAULT_MIN_HTML_LEN
}
fn default_min_blob_len() -> usize {
    DEFAULT_MIN_BLOB_LEN
}
fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}
fn default_fetch_max_retries() -> u32 {
    DEFAULT_FETCH_MAX_RETRIES
}
fn default_fetch_backoff_ms() -> u64 {
    DEFAULT_FETCH_BACKOFF_MS
}
fn default_fetch_workers() -> usize {
    DEFAULT_FETCH_WORKERS
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_accept() -> String {
    DEFAULT_ACCEPT.to_string()
}
fn default_accept_language() -> String {
    DEFAULT_ACCEPT_LANGUAGE.to_string()
}
fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}
fn default_index_endpoint() -> String {
    "http://localhost:8000".to_string()
}
fn default_dataset_name() -> String {
    DEFAULT_DATASET_NAME.to_string()
}
