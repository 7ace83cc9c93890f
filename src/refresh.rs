//! Locator re-authorization.
//!
//! Upstream locators expire about an hour after issue. The refresher finds
//! items whose locator is older than the threshold and reissues them in
//! batches. A failed batch leaves its items untouched for the next cycle.

use crate::auth::AccessTokenProvider;
use crate::clock::Clock;
use crate::config::RefreshSettings;
use crate::error::{FetchError, RefreshError};
use crate::fetch::{FetchRequest, RetryingFetcher};
use crate::media::{MediaItem, SharedPlaylist};
use crate::store::SequenceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Upstream that can reissue locators for a batch of content ids.
#[async_trait]
pub trait LocatorSource: Send + Sync {
    /// Returns `id -> new locator` for the ids upstream could resolve.
    async fn reissue(&self, ids: &[String]) -> Result<HashMap<String, String>, FetchError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchGetResponse {
    #[serde(default)]
    media_item_results: Vec<MediaItemResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItemResult {
    media_item: Option<RemoteMediaItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteMediaItem {
    id: String,
    base_url: String,
}

/// Photos Library `mediaItems:batchGet` client.
pub struct PhotosLibrarySource {
    fetcher: RetryingFetcher,
    tokens: Arc<dyn AccessTokenProvider>,
    api_base: String,
}

impl PhotosLibrarySource {
    pub fn new(
        fetcher: RetryingFetcher,
        tokens: Arc<dyn AccessTokenProvider>,
        api_base: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            tokens,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn batch_url(&self, ids: &[String]) -> String {
        let query = ids
            .iter()
            .map(|id| format!("mediaItemIds={}", urlencoding::encode(id)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}/v1/mediaItems:batchGet?{}", self.api_base, query)
    }
}

#[async_trait]
impl LocatorSource for PhotosLibrarySource {
    async fn reissue(&self, ids: &[String]) -> Result<HashMap<String, String>, FetchError> {
        let token = self
            .tokens
            .valid_token()
            .await
            .ok_or(FetchError::Unauthenticated)?;
        let request = FetchRequest::get(self.batch_url(ids)).with_bearer(Some(token));
        let response: BatchGetResponse = self.fetcher.fetch_json(&request).await?;

        Ok(response
            .media_item_results
            .into_iter()
            .filter_map(|result| result.media_item)
            .map(|item| (item.id, item.base_url))
            .collect())
    }
}

/// Outcome of one refresh cycle.
#[derive(Debug, Default)]
pub struct RefreshReport {
    /// Number of stale ids that were sent upstream.
    pub requested: usize,
    /// Reissued locators by content id.
    pub updated: HashMap<String, String>,
    /// Batches that failed; their items keep the old locator.
    pub failures: Vec<RefreshError>,
}

impl RefreshReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Tracks locator age and reissues expiring locators.
pub struct UrlRefresher {
    source: Arc<dyn LocatorSource>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    batch_size: usize,
}

impl UrlRefresher {
    pub fn new(
        source: Arc<dyn LocatorSource>,
        clock: Arc<dyn Clock>,
        settings: &RefreshSettings,
    ) -> Self {
        Self {
            source,
            clock,
            threshold: settings.threshold(),
            batch_size: settings.batch_size.max(1),
        }
    }

    /// Ids whose locator is past the threshold right now.
    pub fn stale_ids(&self, items: &[MediaItem]) -> Vec<String> {
        self.stale_ids_within(items, Duration::ZERO)
    }

    /// Ids whose locator will be past the threshold `lookahead` from now.
    pub fn stale_ids_within(&self, items: &[MediaItem], lookahead: Duration) -> Vec<String> {
        let horizon = self.clock.now()
            + chrono::Duration::from_std(lookahead).unwrap_or(chrono::Duration::zero());
        let mut seen = HashSet::new();
        items
            .iter()
            .filter(|item| item.is_stale(horizon, self.threshold))
            .filter(|item| seen.insert(item.id.as_str()))
            .map(|item| item.id.clone())
            .collect()
    }

    /// Ask upstream for new locators, `batch_size` ids per call. Every batch
    /// is attempted even if earlier ones fail.
    pub async fn reissue(&self, ids: &[String]) -> RefreshReport {
        let mut report = RefreshReport {
            requested: ids.len(),
            ..Default::default()
        };

        for batch in ids.chunks(self.batch_size) {
            match self.source.reissue(batch).await {
                Ok(locators) => {
                    tracing::debug!(
                        "Refreshed {}/{} locators in batch",
                        locators.len(),
                        batch.len()
                    );
                    report.updated.extend(locators);
                }
                Err(cause) => {
                    let err = RefreshError {
                        ids: batch.to_vec(),
                        cause,
                    };
                    tracing::warn!("{}", err);
                    report.failures.push(err);
                }
            }
        }
        report
    }

    /// Write reissued locators onto `items`. Returns how many changed.
    pub fn apply(
        items: &mut [MediaItem],
        updated: &HashMap<String, String>,
        issued_at: DateTime<Utc>,
    ) -> usize {
        let mut applied = 0;
        for item in items.iter_mut() {
            if let Some(locator) = updated.get(&item.id) {
                item.reissue(locator.clone(), issued_at);
                applied += 1;
            }
        }
        applied
    }

    /// Refresh the stale subset of `items` in place.
    pub async fn refresh_if_needed(&self, items: &mut [MediaItem]) -> RefreshReport {
        let stale = self.stale_ids(items);
        if stale.is_empty() {
            return RefreshReport::default();
        }
        let report = self.reissue(&stale).await;
        Self::apply(items, &report.updated, self.clock.now());
        report
    }

    /// Reissue the locator of one item regardless of its age, e.g. after
    /// upstream rejected it early. Returns the updated playlist entry.
    pub async fn reissue_item(&self, playlist: &SharedPlaylist, id: &str) -> Option<MediaItem> {
        let report = self.reissue(&[id.to_string()]).await;
        if !report.updated.contains_key(id) {
            tracing::warn!("Upstream did not reissue a locator for {}", id);
            return None;
        }
        let mut items = playlist.write().await;
        Self::apply(&mut items, &report.updated, self.clock.now());
        items.iter().find(|item| item.id == id).cloned()
    }

    /// Refresh a shared playlist without holding its lock across the network.
    /// Items that would go stale within `lookahead` are included, so a
    /// periodic caller passes its own period.
    pub async fn refresh_playlist(
        &self,
        playlist: &SharedPlaylist,
        lookahead: Duration,
    ) -> RefreshReport {
        let stale = self.stale_ids_within(&playlist.read().await, lookahead);
        if stale.is_empty() {
            tracing::debug!("No stale locators");
            return RefreshReport::default();
        }

        tracing::info!("Refreshing {} stale locators", stale.len());
        let report = self.reissue(&stale).await;
        let applied = Self::apply(
            &mut playlist.write().await,
            &report.updated,
            self.clock.now(),
        );

        if report.is_partial() {
            tracing::warn!(
                "Locator refresh partial: {} updated, {} batches failed",
                applied,
                report.failures.len()
            );
        } else {
            tracing::info!("Locator refresh complete: {} updated", applied);
        }
        report
    }
}

/// Handle to the periodic refresh task.
pub struct RefresherHandle {
    task: JoinHandle<()>,
}

impl RefresherHandle {
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the refresher as a background task running every `period` (the
/// first cycle runs immediately). Each cycle also takes items that would
/// cross the threshold before the next one. Refreshed locators are written
/// back to `store` when given.
pub fn spawn_refresher(
    refresher: Arc<UrlRefresher>,
    playlist: SharedPlaylist,
    store: Option<Arc<dyn SequenceStore>>,
    period: Duration,
) -> RefresherHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let report = refresher.refresh_playlist(&playlist, period).await;
            if report.updated.is_empty() {
                continue;
            }
            if let Some(store) = &store {
                let snapshot = playlist.read().await.clone();
                if let Err(e) = store.save_locators(&snapshot).await {
                    tracing::warn!("Failed to save refreshed locators: {:#}", e);
                }
            }
        }
    });

    RefresherHandle { task }
}
