//! Application configuration management

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Post-processing bridge base URL
    pub bridge_url: String,

    /// Soulseek daemon API base URL
    pub slskd_url: String,

    /// Soulseek daemon API key
    pub slskd_api_key: String,

    /// How often to poll the bridge for pending searches
    pub poll_interval: Duration,

    /// How often the event pump polls the daemon
    pub event_poll_interval: Duration,

    /// Downloads directory path, as the daemon sees it
    pub downloads_path: PathBuf,

    /// Launch every viable candidate at once instead of cascading
    pub race_mode: bool,

    /// Idle sessions are evicted after this long
    pub session_ttl: Duration,

    /// Album metadata cache TTL
    pub metadata_cache_ttl: Duration,

    /// Album metadata cache entry cap
    pub metadata_cache_max_entries: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let slskd_api_key = env::var("SLSKD_API_KEY").context("SLSKD_API_KEY is required")?;

        let poll_interval_secs: u64 = env::var("HYDRA_POLL_INTERVAL")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .context("Invalid HYDRA_POLL_INTERVAL")?;

        let event_poll_secs: u64 = env::var("HYDRA_EVENT_POLL_INTERVAL")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .context("Invalid HYDRA_EVENT_POLL_INTERVAL")?;

        Ok(Self {
            bridge_url: env::var("HYDRA_BRIDGE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3847".to_string()),

            slskd_url: env::var("SLSKD_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5030".to_string()),

            slskd_api_key,

            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),

            event_poll_interval: Duration::from_secs(event_poll_secs.max(1)),

            downloads_path: PathBuf::from(
                env::var("DOWNLOADS_PATH").unwrap_or_else(|_| "./downloads".to_string()),
            ),

            race_mode: env::var("HYDRA_RACE_MODE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),

            session_ttl: Duration::from_secs(
                env::var("HYDRA_SESSION_TTL")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()
                    .unwrap_or(600),
            ),

            metadata_cache_ttl: Duration::from_secs(
                env::var("HYDRA_METADATA_CACHE_TTL")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()
                    .unwrap_or(3600),
            ),

            metadata_cache_max_entries: env::var("HYDRA_METADATA_CACHE_MAX")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
        })
    }
}
