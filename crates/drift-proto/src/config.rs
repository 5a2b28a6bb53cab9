use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::blacklist::BlacklistPolicy;
use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mpv: MpvConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Where the key-value documents (blacklists, favorites, caches) live.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MpvConfig {
    /// Extra command-line arguments passed to every mpv process.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Only look up mpv and yt-dlp on PATH, never beside the executable.
    #[serde(default)]
    pub system_binaries: bool,
}

/// Upstream radio directory (radio-browser.info mirrors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_server_list_url")]
    pub server_list_url: String,
    #[serde(default = "default_fallback_servers")]
    pub fallback_servers: Vec<String>,
    /// Below this many candidates a fresh server list is fetched.
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub server_cache_ttl_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub tag_cache_ttl_secs: u64,
    /// Tags with this many stations or fewer are hidden.
    #[serde(default = "default_min_tag_station_count")]
    pub min_tag_station_count: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_tag")]
    pub default_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// How long a stalled stream may buffer before it counts as failed.
    #[serde(default = "default_buffering_timeout_secs")]
    pub buffering_timeout_secs: u64,
    /// How long a fresh stream may take to produce audio.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Consecutive automatic retries before giving up.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_blacklist_base_secs")]
    pub blacklist_base_secs: u64,
    #[serde(default = "default_blacklist_max_secs")]
    pub blacklist_max_secs: u64,
}

/// Static JSON source lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_curated_stations")]
    pub curated_stations: PathBuf,
    #[serde(default = "default_space_sources")]
    pub space_sources: PathBuf,
    #[serde(default = "default_space_source")]
    pub default_space_source: String,
    #[serde(default = "default_atc_sources")]
    pub atc_sources: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            server_list_url: default_server_list_url(),
            fallback_servers: default_fallback_servers(),
            min_candidates: default_min_candidates(),
            server_cache_ttl_secs: default_cache_ttl_secs(),
            tag_cache_ttl_secs: default_cache_ttl_secs(),
            min_tag_station_count: default_min_tag_station_count(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            default_tag: default_tag(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            buffering_timeout_secs: default_buffering_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            blacklist_base_secs: default_blacklist_base_secs(),
            blacklist_max_secs: default_blacklist_max_secs(),
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            curated_stations: default_curated_stations(),
            space_sources: default_space_sources(),
            default_space_source: default_space_source(),
            atc_sources: default_atc_sources(),
        }
    }
}

impl PlaybackConfig {
    pub fn buffering_timeout(&self) -> Duration {
        Duration::from_secs(self.buffering_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn blacklist_policy(&self) -> BlacklistPolicy {
        BlacklistPolicy {
            base: Duration::from_secs(self.blacklist_base_secs),
            max: Duration::from_secs(self.blacklist_max_secs),
        }
    }
}

fn default_data_dir() -> PathBuf {
    platform::data_dir()
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_server_list_url() -> String {
    "https://all.api.radio-browser.info/json/servers".to_string()
}

fn default_fallback_servers() -> Vec<String> {
    vec![
        "https://fi1.api.radio-browser.info".to_string(),
        "https://de1.api.radio-browser.info".to_string(),
        "https://de2.api.radio-browser.info".to_string(),
    ]
}

fn default_min_candidates() -> usize {
    3
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_min_tag_station_count() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_user_agent() -> String {
    "RadioDrift/1.0".to_string()
}

fn default_tag() -> String {
    "ambient".to_string()
}

fn default_buffering_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_max_retry_attempts() -> u32 {
    10
}

fn default_blacklist_base_secs() -> u64 {
    6 * 60 * 60
}

fn default_blacklist_max_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_curated_stations() -> PathBuf {
    platform::config_dir().join("ambient-stations.json")
}

fn default_space_sources() -> PathBuf {
    platform::config_dir().join("sources.json")
}

fn default_space_source() -> String {
    "apollo11.json".to_string()
}

fn default_atc_sources() -> PathBuf {
    platform::config_dir().join("atc-sources.json")
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.http.enabled);
        assert_eq!(config.http.port, 8989);
        assert_eq!(config.http.bind_address, "127.0.0.1");
        assert_eq!(config.directory.fallback_servers.len(), 3);
        assert!(config
            .directory
            .fallback_servers
            .iter()
            .all(|s| s.starts_with("https://")));
        assert_eq!(config.playback.max_retry_attempts, 10);
        assert_eq!(config.playback.buffering_timeout(), Duration::from_secs(10));
        assert_eq!(config.playback.blacklist_policy(), BlacklistPolicy::default());
        assert!(config
            .sources
            .curated_stations
            .ends_with("radio-drift/ambient-stations.json"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [playback]
            max_retry_attempts = 3

            [directory]
            default_tag = "drone"
            "#,
        )
        .unwrap();
        assert_eq!(config.playback.max_retry_attempts, 3);
        assert_eq!(config.playback.connect_timeout_secs, 15);
        assert_eq!(config.directory.default_tag, "drone");
        assert_eq!(config.directory.min_candidates, 3);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::from_toml_str(&text).unwrap();
        assert_eq!(back.http.port, config.http.port);
        assert_eq!(back.directory.server_list_url, config.directory.server_list_url);
    }
}
