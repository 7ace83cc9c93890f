//! Media item model.
//!
//! A [`MediaItem`] keeps a stable content id and a time-limited base URL
//! (the locator). Locators are reissued by the refresher; ids never change.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Playback-ordered sequence shared between the runner, preloader and
/// refresher. Only locators are mutated in place; order changes on load.
pub type SharedPlaylist = Arc<RwLock<Vec<MediaItem>>>;

/// Whether an item is a still image or a video clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Cache variant name for the bytes fetched for this kind.
    pub fn variant(&self) -> &'static str {
        match self {
            MediaKind::Image => "display",
            MediaKind::Video => "video",
        }
    }

    /// Content type assumed when upstream does not send one.
    pub fn fallback_content_type(&self) -> &'static str {
        match self {
            MediaKind::Image => "image/jpeg",
            MediaKind::Video => "video/mp4",
        }
    }
}

/// Represents a media item in the playback sequence.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    pub base_url: String,
    pub kind: MediaKind,
    pub filename: Option<String>,
    pub created_at: DateTime<Utc>,
    /// When `base_url` was issued.
    pub url_issued_at: DateTime<Utc>,
}

impl MediaItem {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Age of the current locator at `now`.
    pub fn locator_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.url_issued_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// True once the locator is older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.locator_age(now) > threshold
    }

    /// Replace the locator, keeping identity.
    pub fn reissue(&mut self, base_url: String, issued_at: DateTime<Utc>) {
        self.base_url = base_url;
        self.url_issued_at = issued_at;
    }

    /// URL that downloads the bytes to show for this item.
    pub fn download_url(&self, size: DisplaySize) -> String {
        match self.kind {
            MediaKind::Image => format!("{}=w{}-h{}", self.base_url, size.width, size.height),
            MediaKind::Video => format!("{}=dv", self.base_url),
        }
    }

    /// Cache key for the displayed bytes of this item.
    pub fn cache_key(&self) -> String {
        CacheKey::for_item(&self.id, self.kind)
    }
}

/// Requested rendition size for image downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

/// Cache key construction.
pub struct CacheKey;

impl CacheKey {
    /// Key for an item with a stable content id.
    pub fn for_item(id: &str, kind: MediaKind) -> String {
        format!("{}:{}", id, kind.variant())
    }

    /// Key for a bare locator with no content id.
    pub fn for_locator(url: &str, size: DisplaySize) -> String {
        let digest = Sha256::digest(format!("{}|{}x{}", url, size.width, size.height).as_bytes());
        format!("{:x}", digest)
    }

    /// Content id part of an item key, if the key has one.
    pub fn content_id(key: &str) -> Option<&str> {
        key.rsplit_once(':').map(|(id, _)| id)
    }
}

/// Ordering applied to the sequence at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhotoOrder {
    /// Newest first.
    #[default]
    Latest,
    /// Oldest first.
    Oldest,
    /// Full shuffle on every load.
    Random,
}

impl PhotoOrder {
    /// Reorder `items` in place. Timestamp ties keep their incoming order.
    pub fn arrange<R: Rng + ?Sized>(&self, items: &mut [MediaItem], rng: &mut R) {
        match self {
            PhotoOrder::Latest => items.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            PhotoOrder::Oldest => items.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
            PhotoOrder::Random => items.shuffle(rng),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    pub fn image(id: &str, created_offset_secs: i64) -> MediaItem {
        MediaItem {
            id: id.to_string(),
            base_url: format!("https://media.example/{}", id),
            kind: MediaKind::Image,
            filename: Some(format!("{}.jpg", id)),
            created_at: epoch() + chrono::Duration::seconds(created_offset_secs),
            url_issued_at: epoch(),
        }
    }

    pub fn video(id: &str, created_offset_secs: i64) -> MediaItem {
        MediaItem {
            kind: MediaKind::Video,
            filename: Some(format!("{}.mp4", id)),
            ..image(id, created_offset_secs)
        }
    }

    pub fn images(n: usize) -> Vec<MediaItem> {
        (0..n).map(|i| image(&format!("item{}", i), i as i64)).collect()
    }
}
