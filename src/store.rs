//! Persisted sequence boundary.
//!
//! The sequence document is owned by whoever curates the slideshow. The
//! engine reads it at load time and writes refreshed locators back.

use crate::config::PlaybackSettings;
use crate::media::{MediaItem, PhotoOrder};
use crate::playback::TransitionEffect;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Settings record stored next to the sequence. Unset fields fall back to
/// the engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSettings {
    pub slide_interval: Option<u64>,
    pub transition_effect: Option<TransitionEffect>,
    pub photo_order: Option<PhotoOrder>,
    /// Presentation hint for the display layer; not interpreted here.
    pub window_mode: Option<String>,
}

impl StoredSettings {
    /// Overlay the stored values onto `playback`.
    pub fn apply_to(&self, playback: &mut PlaybackSettings) {
        if let Some(secs) = self.slide_interval {
            playback.slide_interval_secs = secs;
        }
        if let Some(effect) = self.transition_effect {
            playback.transition_effect = effect;
        }
        if let Some(order) = self.photo_order {
            playback.photo_order = order;
        }
    }
}

/// The stored document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSequence {
    #[serde(default)]
    pub items: Vec<MediaItem>,
    #[serde(default)]
    pub settings: Option<StoredSettings>,
}

/// Externally owned, persisted media sequence.
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn load(&self) -> Result<StoredSequence>;

    /// Merge the locators of `items` into the stored items with the same id.
    /// Stored order and settings are left untouched.
    async fn save_locators(&self, items: &[MediaItem]) -> Result<()>;
}

/// Sequence store backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonSequenceStore {
    path: PathBuf,
}

impl JsonSequenceStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn write(&self, doc: &StoredSequence) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc).context("Failed to serialize sequence")?;
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, json)
            .await
            .context("Failed to write sequence")?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .context("Failed to replace sequence")?;
        Ok(())
    }
}

#[async_trait]
impl SequenceStore for JsonSequenceStore {
    async fn load(&self) -> Result<StoredSequence> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            tracing::info!("No sequence at {:?}, starting empty", self.path);
            return Ok(StoredSequence::default());
        }

        let json = tokio::fs::read(&self.path)
            .await
            .context("Failed to read sequence")?;
        let doc: StoredSequence =
            serde_json::from_slice(&json).context("Failed to parse sequence")?;
        tracing::info!("Loaded stored sequence with {} items", doc.items.len());
        Ok(doc)
    }

    async fn save_locators(&self, items: &[MediaItem]) -> Result<()> {
        let mut doc = self.load().await?;
        let fresh: HashMap<&str, &MediaItem> =
            items.iter().map(|item| (item.id.as_str(), item)).collect();

        let mut merged = 0;
        for stored in doc.items.iter_mut() {
            if let Some(item) = fresh.get(stored.id.as_str()) {
                if stored.url_issued_at != item.url_issued_at || stored.base_url != item.base_url {
                    stored.reissue(item.base_url.clone(), item.url_issued_at);
                    merged += 1;
                }
            }
        }

        if merged > 0 {
            self.write(&doc).await?;
            tracing::debug!("Saved {} refreshed locators", merged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fixtures::{epoch, image, video};
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = JsonSequenceStore::new(dir.path().join("sequence.json"));
        assert_eq!(store.load().await.unwrap(), StoredSequence::default());
    }

    #[tokio::test]
    async fn locators_are_merged_by_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sequence.json");
        let doc = StoredSequence {
            items: vec![image("a", 0), video("b", 1)],
            settings: Some(StoredSettings {
                slide_interval: Some(30),
                ..Default::default()
            }),
        };
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        let store = JsonSequenceStore::new(path);

        let mut refreshed = video("b", 1);
        let later = epoch() + chrono::Duration::minutes(51);
        refreshed.reissue("https://media.example/b-new".into(), later);
        store.save_locators(&[refreshed]).await.unwrap();

        let reloaded = store.load().await.unwrap();
        assert_eq!(reloaded.items[0], image("a", 0));
        assert_eq!(reloaded.items[1].base_url, "https://media.example/b-new");
        assert_eq!(reloaded.items[1].url_issued_at, later);
        assert_eq!(reloaded.settings, doc.settings);
    }

    #[test]
    fn stored_settings_override_config() {
        let mut playback = PlaybackSettings::default();
        StoredSettings {
            slide_interval: Some(45),
            transition_effect: Some(TransitionEffect::Slide),
            photo_order: None,
            window_mode: Some("fullscreen".into()),
        }
        .apply_to(&mut playback);

        assert_eq!(playback.slide_interval_secs, 45);
        assert_eq!(playback.transition_effect, TransitionEffect::Slide);
        assert_eq!(playback.photo_order, PhotoOrder::Latest);
    }

    #[test]
    fn parses_camel_case_document() {
        let json = r#"{
            "items": [{
                "id": "m1",
                "baseUrl": "https://lh3.example/m1",
                "kind": "video",
                "filename": "clip.mp4",
                "createdAt": "2024-05-01T10:00:00Z",
                "urlIssuedAt": "2024-05-01T11:00:00Z"
            }],
            "settings": { "photoOrder": "random", "transitionEffect": "none" }
        }"#;
        let doc: StoredSequence = serde_json::from_str(json).unwrap();
        assert!(doc.items[0].is_video());
        let settings = doc.settings.unwrap();
        assert_eq!(settings.photo_order, Some(PhotoOrder::Random));
        assert_eq!(settings.transition_effect, Some(TransitionEffect::None));
    }
}
