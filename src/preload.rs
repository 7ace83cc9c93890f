//! Background preloading of upcoming sequence items.
//!
//! Every cursor move schedules detached fetches for the next few items. A
//! small working set remembers what was already requested so the same item
//! is not fetched twice; it is pruned to a window around the cursor once it
//! grows past its bound. In-flight fetches are never cancelled.

use crate::assets::AssetLoader;
use crate::config::PreloadSettings;
use crate::media::MediaItem;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Background preloader that downloads assets ahead of time.
pub struct Preloader {
    loader: Arc<AssetLoader>,
    lookahead: usize,
    behind: usize,
    max_tracked: usize,
    requested: Mutex<HashSet<String>>,
}

impl Preloader {
    pub fn new(loader: Arc<AssetLoader>, settings: &PreloadSettings) -> Self {
        Self {
            loader,
            lookahead: settings.count,
            behind: settings.behind,
            max_tracked: settings.working_set,
            requested: Mutex::new(HashSet::new()),
        }
    }

    /// Called whenever the playback cursor moves. Returns the ids for which
    /// a fetch was started. Must run inside a tokio runtime.
    pub fn on_advance(&self, playlist: &[MediaItem], current_index: usize) -> Vec<String> {
        if playlist.is_empty() {
            return Vec::new();
        }
        let len = playlist.len();
        let current_index = current_index % len;

        let mut requested = self.requested.lock().unwrap_or_else(|e| e.into_inner());
        let mut started = Vec::new();

        for i in 1..=self.lookahead {
            let next_index = (current_index + i) % len;
            if next_index == current_index {
                break;
            }

            let media = &playlist[next_index];
            if !requested.insert(media.id.clone()) {
                continue;
            }
            if self.loader.cache().contains(&media.cache_key()) {
                continue;
            }

            tracing::debug!("Preloading media: {}", media.id);
            let loader = self.loader.clone();
            let media = media.clone();
            started.push(media.id.clone());
            tokio::spawn(async move {
                if let Err(e) = loader.ensure_cached(&media).await {
                    tracing::warn!("Failed to preload {}: {}", media.id, e);
                }
            });
        }

        if requested.len() > self.max_tracked {
            let window: HashSet<&str> = (0..=self.behind + self.lookahead)
                .map(|offset| {
                    let index = (current_index + len * (self.behind / len + 1) + offset
                        - self.behind)
                        % len;
                    playlist[index].id.as_str()
                })
                .collect();
            let before = requested.len();
            requested.retain(|id| window.contains(id.as_str()));
            tracing::debug!(
                "Pruned preload working set from {} to {} entries",
                before,
                requested.len()
            );
        }

        started
    }

    /// Number of ids currently remembered as requested.
    pub fn tracked(&self) -> usize {
        self.requested.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Forget every requested id, e.g. after a new sequence is loaded.
    pub fn reset(&self) {
        self.requested
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedToken;
    use crate::cache::ContentCache;
    use crate::clock::ManualClock;
    use crate::fetch::testing::{ok, ScriptedTransport};
    use crate::fetch::{BackoffPolicy, RetryingFetcher};
    use crate::media::fixtures::{epoch, images};
    use crate::media::DisplaySize;
    use std::time::Duration;
    use tempfile::tempdir;

    fn preloader(dir: &std::path::Path, transport: Arc<ScriptedTransport>) -> Preloader {
        let cache = Arc::new(ContentCache::new(dir.to_path_buf(), 1_000_000, 0.7).unwrap());
        let fetcher = RetryingFetcher::new(
            transport,
            Arc::new(ManualClock::new(epoch())),
            BackoffPolicy::default(),
            1,
        );
        let loader = AssetLoader::new(
            cache,
            fetcher,
            Arc::new(SharedToken::new(Some("tok".into()))),
            DisplaySize {
                width: 100,
                height: 100,
            },
        );
        Preloader::new(Arc::new(loader), &PreloadSettings::default())
    }

    #[tokio::test]
    async fn schedules_next_items_once() {
        let dir = tempdir().unwrap();
        let preloader = preloader(dir.path(), Arc::new(ScriptedTransport::default()));
        let playlist = images(5);

        assert_eq!(
            preloader.on_advance(&playlist, 0),
            vec!["item1", "item2", "item3"]
        );
        assert!(preloader.on_advance(&playlist, 0).is_empty());
        assert_eq!(preloader.on_advance(&playlist, 1), vec!["item4"]);
    }

    #[tokio::test]
    async fn lookahead_wraps_and_stops_at_current() {
        let dir = tempdir().unwrap();
        let preloader = preloader(dir.path(), Arc::new(ScriptedTransport::default()));

        assert_eq!(
            preloader.on_advance(&images(5), 4),
            vec!["item0", "item1", "item2"]
        );
        assert_eq!(preloader.on_advance(&images(2), 0), Vec::<String>::new());
        assert_eq!(preloader.on_advance(&images(1), 0), Vec::<String>::new());
    }

    #[tokio::test]
    async fn working_set_is_pruned_to_window() {
        let dir = tempdir().unwrap();
        let preloader = preloader(dir.path(), Arc::new(ScriptedTransport::default()));
        let playlist = images(20);

        for index in 0..=7 {
            preloader.on_advance(&playlist, index);
        }
        assert_eq!(preloader.tracked(), 10);

        preloader.on_advance(&playlist, 8);
        // Window is 2 behind through 3 ahead of index 8.
        assert_eq!(preloader.tracked(), 6);
        assert!(preloader.on_advance(&playlist, 8).is_empty());
    }

    #[tokio::test]
    async fn preloads_land_in_cache() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(b"one", "image/jpeg"),
            ok(b"two", "image/jpeg"),
            ok(b"three", "image/jpeg"),
        ]));
        let preloader = preloader(dir.path(), transport.clone());
        let playlist = images(4);

        preloader.on_advance(&playlist, 0);

        let cache = preloader.loader.cache().clone();
        for _ in 0..200 {
            if cache.stats().item_count == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cache.stats().item_count, 3);
        assert_eq!(transport.calls(), 3);
        assert!(!cache.contains("item0:display"));
    }
}
