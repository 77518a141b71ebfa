use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;
use crate::tiles::{DEFAULT_MAX_TILES, MAX_ZOOM};

/// Environment variable consulted when the config file carries no token.
pub const ACCESS_TOKEN_ENV: &str = "TILESCAN_ACCESS_TOKEN";

pub const DEFAULT_API_BASE_URL: &str = "https://graph.mapillary.com";

// Sprite packages tried in order when resolving a symbol for a category tag
pub const DEFAULT_SYMBOL_SOURCES: [&str; 2] = [
    "https://raw.githubusercontent.com/mapillary/mapillary_sprite_source/master/package_signs/",
    "https://raw.githubusercontent.com/mapillary/mapillary_sprite_source/master/package_objects/",
];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub api_base_url: String,
    pub access_token: String,
    pub zoom: u8,
    // Runs covering more tiles than this are refused
    pub max_tiles: u64,
    // Total attempts per call, not additional retries
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub fetch_workers: usize,
    pub enrich_workers: usize,
    pub dedup_by_id: bool,
    pub enrich_images: bool,
    pub enrich_detections: bool,
    pub resolve_symbols: bool,
    // Retry HTTP 429 like a network failure instead of treating it as an empty tile
    pub retry_rate_limited: bool,
    pub symbol_sources: Vec<String>,
    pub font_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            access_token: String::new(),
            zoom: 18,
            max_tiles: DEFAULT_MAX_TILES,
            max_retries: 3,
            retry_delay_ms: 1000,
            request_timeout_ms: 10_000,
            fetch_workers: 8,
            enrich_workers: 4,
            dedup_by_id: false,
            enrich_images: true,
            enrich_detections: true,
            resolve_symbols: false,
            retry_rate_limited: false,
            symbol_sources: DEFAULT_SYMBOL_SOURCES.iter().map(|s| s.to_string()).collect(),
            font_path: None,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML config file. Missing keys fall back to defaults and an
    /// empty token is filled from `TILESCAN_ACCESS_TOKEN`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let mut config: PipelineConfig = toml::from_str(&contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if self.access_token.is_empty() {
            if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
                self.access_token = token;
            }
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.zoom > MAX_ZOOM {
            return Err(PipelineError::InvalidZoom(self.zoom));
        }
        if self.max_tiles == 0 {
            return Err(PipelineError::Config("max_tiles must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(PipelineError::Config("max_retries must be at least 1".into()));
        }
        if self.fetch_workers == 0 || self.enrich_workers == 0 {
            return Err(PipelineError::Config("worker pools need at least one worker".into()));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(PipelineError::Config("api_base_url is empty".into()));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
