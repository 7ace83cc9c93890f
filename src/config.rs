//! Settings loading for the frame player.
//!
//! Values come from an optional TOML file overlaid with `FRAME_PLAYER_*`
//! environment variables (sections separated by `__`, e.g.
//! `FRAME_PLAYER_PLAYBACK__SLIDE_INTERVAL_SECS=15`).

use crate::error::ConfigError;
use crate::media::PhotoOrder;
use crate::playback::TransitionEffect;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_SLIDE_INTERVAL_SECS: u64 = 5;
pub const MAX_SLIDE_INTERVAL_SECS: u64 = 60;

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub playback: PlaybackSettings,
    pub cache: CacheSettings,
    pub refresh: RefreshSettings,
    pub preload: PreloadSettings,
    pub fetch: FetchSettings,
    pub store: StoreSettings,
    pub auth: AuthSettings,
    pub schedule: ScheduleSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PlaybackSettings {
    pub slide_interval_secs: u64,
    pub transition_effect: TransitionEffect,
    pub transition_ms: u64,
    pub photo_order: PhotoOrder,
    pub load_timeout_secs: u64,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            slide_interval_secs: 10,
            transition_effect: TransitionEffect::Fade,
            transition_ms: 500,
            photo_order: PhotoOrder::Latest,
            load_timeout_secs: 10,
        }
    }
}

impl PlaybackSettings {
    pub fn slide_interval(&self) -> Duration {
        Duration::from_secs(self.slide_interval_secs)
    }

    /// Transition length, zero when the effect is `none`.
    pub fn transition_duration(&self) -> Duration {
        match self.transition_effect {
            TransitionEffect::None => Duration::ZERO,
            _ => Duration::from_millis(self.transition_ms),
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: PathBuf,
    pub capacity_bytes: u64,
    pub low_water_ratio: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            capacity_bytes: 2 * 1024 * 1024 * 1024,
            low_water_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub threshold_mins: u64,
    pub period_mins: u64,
    pub batch_size: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            threshold_mins: 50,
            period_mins: 50,
            batch_size: 50,
        }
    }
}

impl RefreshSettings {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_mins * 60)
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_mins * 60)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PreloadSettings {
    pub count: usize,
    pub working_set: usize,
    pub behind: usize,
}

impl Default for PreloadSettings {
    fn default() -> Self {
        Self {
            count: 3,
            working_set: 10,
            behind: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchSettings {
    pub api_base: String,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub display_width: u32,
    pub display_height: u32,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            api_base: "https://photoslibrary.googleapis.com".into(),
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            request_timeout_secs: 30,
            display_width: 1920,
            display_height: 1080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sequence.json"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthSettings {
    pub token: Option<String>,
}

/// Weekly play grid, `grid[weekday][hour]`, weekday 0 = Monday.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub grid: Option<Vec<Vec<bool>>>,
}

impl Settings {
    /// Load settings from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FRAME_PLAYER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;
        settings.validate()?;

        tracing::debug!("Loaded settings: {:?}", settings);
        Ok(settings)
    }

    /// Check every range the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let interval = self.playback.slide_interval_secs;
        if !(MIN_SLIDE_INTERVAL_SECS..=MAX_SLIDE_INTERVAL_SECS).contains(&interval) {
            return Err(ConfigError::new(
                "playback.slide_interval_secs",
                format!(
                    "{} is outside {}..={}",
                    interval, MIN_SLIDE_INTERVAL_SECS, MAX_SLIDE_INTERVAL_SECS
                ),
            ));
        }
        if self.playback.load_timeout_secs == 0 {
            return Err(ConfigError::new("playback.load_timeout_secs", "must be > 0"));
        }
        if self.cache.capacity_bytes == 0 {
            return Err(ConfigError::new("cache.capacity_bytes", "must be > 0"));
        }
        let ratio = self.cache.low_water_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::new(
                "cache.low_water_ratio",
                format!("{} is outside (0, 1]", ratio),
            ));
        }
        if self.refresh.threshold_mins == 0 || self.refresh.period_mins == 0 {
            return Err(ConfigError::new("refresh", "threshold and period must be > 0"));
        }
        if self.refresh.batch_size == 0 {
            return Err(ConfigError::new("refresh.batch_size", "must be > 0"));
        }
        if self.preload.working_set == 0 {
            return Err(ConfigError::new("preload.working_set", "must be > 0"));
        }
        if let Err(e) = url::Url::parse(&self.fetch.api_base) {
            return Err(ConfigError::new("fetch.api_base", e.to_string()));
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::new("fetch.max_attempts", "must be > 0"));
        }
        if let Some(grid) = &self.schedule.grid {
            if grid.len() != 7 || grid.iter().any(|day| day.len() != 24) {
                return Err(ConfigError::new("schedule.grid", "must be 7 rows of 24 hours"));
            }
        }
        Ok(())
    }
}
