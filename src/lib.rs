//! Media delivery and playback engine for a photo/video frame.
//!
//! Keeps a slideshow running against an upstream whose locators expire:
//! bytes are cached on disk, locators are reissued before they die, upcoming
//! items are preloaded, and a state machine decides what is on screen.

pub mod assets;
pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod media;
pub mod playback;
pub mod preload;
pub mod refresh;
pub mod runner;
pub mod schedule;
pub mod store;

pub use assets::AssetLoader;
pub use cache::{CacheStats, CacheWriteOutcome, CachedMedia, ContentCache};
pub use config::Settings;
pub use error::{CacheIoError, ConfigError, FetchError, PlaybackError, RefreshError};
pub use fetch::{BackoffPolicy, RetryingFetcher};
pub use media::{MediaItem, MediaKind, PhotoOrder, SharedPlaylist};
pub use playback::{
    DisplaySignal, PlaybackEvent, PlaybackScheduler, PlaybackState, TransitionEffect,
};
pub use preload::Preloader;
pub use refresh::UrlRefresher;
pub use runner::{PlaybackRunner, PlayerHandle};
