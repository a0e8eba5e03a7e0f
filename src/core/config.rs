use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::source::CollectionKey;

/// A named feed backed by one table view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSourceConfig {
    pub name: String,
    pub table: String,
    pub view: String,
}

impl FeedSourceConfig {
    pub fn new(name: &str, table: &str, view: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            view: view.to_string(),
        }
    }

    pub fn collection(&self) -> CollectionKey {
        CollectionKey::new(&self.table, &self.view)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    /// Decoded frame size; sources are letterboxed into it
    pub frame_width: u32,
    pub frame_height: u32,
    pub poster_cache_size: usize,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            frame_width: 540,
            frame_height: 960,
            poster_cache_size: 32,
        }
    }
}

fn default_api_url() -> String {
    "https://api.airtable.com/v0".to_string()
}

fn default_base_id() -> String {
    "app6Kxfw7kVFiBeXh".to_string()
}

fn default_api_key_env() -> String {
    "AIRTABLE_API_KEY".to_string()
}

fn default_feeds() -> Vec<FeedSourceConfig> {
    vec![
        FeedSourceConfig::new("Sales", "tblpiAyF3gXjUDT1P", "viwzb32GjIYXErXDL"),
        FeedSourceConfig::new("Videos", "tblxTiA5MS98iKPoa", "viwHML462kaM2yT06"),
        FeedSourceConfig::new("Lion Glass UK", "tblxTiA5MS98iKPoa", "viw54eHi6J2wNXQC3"),
    ]
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_base_id")]
    pub base_id: String,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Inline key; takes precedence over the environment
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedSourceConfig>,
    #[serde(default)]
    pub selected_feed: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            base_id: default_base_id(),
            api_key_env: default_api_key_env(),
            api_key: None,
            feeds: default_feeds(),
            selected_feed: 0,
            request_timeout_secs: default_request_timeout(),
            playback: PlaybackConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file at {}: {}", config_path.display(), e))?;

            match serde_json::from_str::<Self>(&content) {
                Ok(config) => {
                    log::info!("Loaded existing config from {}", config_path.display());
                    Ok(config.normalized())
                }
                Err(e) => {
                    log::warn!("Config file exists but has issues ({}), creating new one with defaults", e);
                    let new_config = Self::default();
                    new_config.save()
                        .map_err(|save_err| anyhow::anyhow!("Failed to save new config: {}", save_err))?;
                    log::info!("Created new config file at {}", config_path.display());
                    Ok(new_config)
                }
            }
        } else {
            log::info!("No config file found, creating default config");
            let config = Self::default();
            config.save()
                .map_err(|e| anyhow::anyhow!("Failed to save default config: {}", e))?;
            log::info!("Created new config file at {}", config_path.display());
            Ok(config)
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("swipe-feed")
            .join("config.json")
    }

    /// Inline key if set, otherwise the environment variable named by `api_key_env`.
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }

    pub fn selected_feed_config(&self) -> Option<&FeedSourceConfig> {
        self.feeds.get(self.selected_feed).or_else(|| self.feeds.first())
    }

    /// Drop feeds that repeat a table/view pair, restore the defaults when
    /// none are left and keep the selection in range.
    pub fn normalized(mut self) -> Self {
        let mut seen = std::collections::HashSet::new();
        self.feeds.retain(|feed| {
            let unique = seen.insert(feed.collection());
            if !unique {
                log::warn!("Ignoring feed '{}': {} is already used by another feed", feed.name, feed.collection());
            }
            unique
        });

        if self.feeds.is_empty() {
            log::warn!("No feeds configured, using defaults");
            self.feeds = default_feeds();
        }
        if self.selected_feed >= self.feeds.len() {
            self.selected_feed = 0;
        }
        self
    }
}
