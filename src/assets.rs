//! Fetch-through-cache loading of media bytes.
//!
//! Serves from [`ContentCache`] when possible and otherwise downloads with
//! the caller's token, storing the result for next time.

use crate::auth::AccessTokenProvider;
use crate::cache::{CacheWriteOutcome, CachedMedia, ContentCache};
use crate::error::FetchError;
use crate::fetch::{FetchRequest, RetryingFetcher};
use crate::media::{CacheKey, DisplaySize, MediaItem};
use std::sync::Arc;

/// Loads media bytes through the content cache.
pub struct AssetLoader {
    cache: Arc<ContentCache>,
    fetcher: RetryingFetcher,
    tokens: Arc<dyn AccessTokenProvider>,
    size: DisplaySize,
}

impl AssetLoader {
    pub fn new(
        cache: Arc<ContentCache>,
        fetcher: RetryingFetcher,
        tokens: Arc<dyn AccessTokenProvider>,
        size: DisplaySize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            tokens,
            size,
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Ensure the display bytes of `item` are available, downloading if needed.
    pub async fn ensure_cached(&self, item: &MediaItem) -> Result<CachedMedia, FetchError> {
        let key = item.cache_key();
        let url = item.download_url(self.size);
        self.load(&key, &url, item.kind.fallback_content_type()).await
    }

    /// Same as [`ensure_cached`](Self::ensure_cached) for a bare locator with
    /// no content id. The key is derived from the locator and display size.
    pub async fn ensure_cached_url(&self, url: &str) -> Result<CachedMedia, FetchError> {
        let key = CacheKey::for_locator(url, self.size);
        self.load(&key, url, "application/octet-stream").await
    }

    async fn load(
        &self,
        key: &str,
        url: &str,
        fallback_type: &str,
    ) -> Result<CachedMedia, FetchError> {
        if let Some(hit) = self.cache.get(key).await {
            tracing::debug!("Cache hit for {}", key);
            return Ok(hit);
        }

        let token = self
            .tokens
            .valid_token()
            .await
            .ok_or(FetchError::Unauthenticated)?;

        tracing::debug!("Downloading {}", key);
        let fetched = self
            .fetcher
            .fetch(&FetchRequest::get(url).with_bearer(Some(token)))
            .await?;

        let content_type = fetched
            .content_type
            .unwrap_or_else(|| fallback_type.to_string());

        let outcome = self
            .cache
            .put(key, fetched.bytes.clone(), &content_type)
            .await;
        if let CacheWriteOutcome::Degraded(err) = &outcome {
            tracing::warn!("Serving {} uncached: {}", key, err);
        }

        Ok(CachedMedia {
            bytes: fetched.bytes,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SharedToken;
    use crate::clock::ManualClock;
    use crate::fetch::testing::{ok, status, ScriptedTransport};
    use crate::fetch::BackoffPolicy;
    use crate::media::fixtures::{epoch, image, video};
    use tempfile::tempdir;

    const SIZE: DisplaySize = DisplaySize {
        width: 1280,
        height: 720,
    };

    fn loader(
        dir: &std::path::Path,
        transport: Arc<ScriptedTransport>,
        token: Option<&str>,
    ) -> AssetLoader {
        let cache = Arc::new(ContentCache::new(dir.to_path_buf(), 1_000_000, 0.7).unwrap());
        let fetcher = RetryingFetcher::new(
            transport,
            Arc::new(ManualClock::new(epoch())),
            BackoffPolicy::default(),
            3,
        );
        AssetLoader::new(
            cache,
            fetcher,
            Arc::new(SharedToken::new(token.map(str::to_string))),
            SIZE,
        )
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![ok(b"pixels", "image/webp")]));
        let loader = loader(dir.path(), transport.clone(), Some("tok"));
        let item = image("a", 0);

        let first = loader.ensure_cached(&item).await.unwrap();
        let second = loader.ensure_cached(&item).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.content_type, "image/webp");
        assert_eq!(transport.calls(), 1);
        let request = &transport.requests.lock().unwrap()[0];
        assert_eq!(request.url, "https://media.example/a=w1280-h720");
        assert_eq!(request.bearer.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn videos_use_download_variant_and_fallback_type() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(crate::fetch::HttpResponse {
            status: 200,
            content_type: None,
            retry_after: None,
            body: bytes::Bytes::from_static(b"mp4"),
        })]));
        let loader = loader(dir.path(), transport.clone(), Some("tok"));

        let media = loader.ensure_cached(&video("v", 0)).await.unwrap();
        assert_eq!(media.content_type, "video/mp4");
        assert_eq!(
            transport.requests.lock().unwrap()[0].url,
            "https://media.example/v=dv"
        );
        assert!(loader.cache().contains("v:video"));
    }

    #[tokio::test]
    async fn missing_token_fails_without_network() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let loader = loader(dir.path(), transport.clone(), None);

        let err = loader.ensure_cached(&image("a", 0)).await.unwrap_err();
        assert!(matches!(err, FetchError::Unauthenticated));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn upstream_errors_are_surfaced_and_not_cached() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![status(404)]));
        let loader = loader(dir.path(), transport, Some("tok"));

        let err = loader.ensure_cached(&image("a", 0)).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(loader.cache().stats().item_count, 0);
    }

    #[tokio::test]
    async fn bare_locators_are_keyed_by_hash() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(ScriptedTransport::new(vec![ok(b"x", "image/jpeg")]));
        let loader = loader(dir.path(), transport, Some("tok"));

        loader
            .ensure_cached_url("https://media.example/raw")
            .await
            .unwrap();
        let key = CacheKey::for_locator("https://media.example/raw", SIZE);
        assert!(loader.cache().contains(&key));
    }
}
