use anyhow::{Context, Result};
use frame_player::auth::SharedToken;
use frame_player::clock::{Clock, SystemClock};
use frame_player::fetch::ReqwestTransport;
use frame_player::media::DisplaySize;
use frame_player::refresh::{spawn_refresher, PhotosLibrarySource};
use frame_player::runner::PlayerHandle;
use frame_player::schedule::{spawn_schedule_signal, WeeklySchedule};
use frame_player::store::{JsonSequenceStore, SequenceStore};
use frame_player::{
    AssetLoader, ContentCache, DisplaySignal, PlaybackRunner, PlaybackScheduler, Preloader,
    RetryingFetcher, Settings, SharedPlaylist, UrlRefresher,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FRAME_PLAYER_CONFIG").ok())
        .map(PathBuf::from);
    let mut settings = Settings::load(config_path.as_deref())?;

    let store = Arc::new(JsonSequenceStore::new(settings.store.path.clone()));
    let stored = store.load().await?;
    if let Some(overrides) = &stored.settings {
        overrides.apply_to(&mut settings.playback);
        settings.validate().context("Invalid stored settings")?;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(
        settings.fetch.request_timeout_secs,
    ))?);
    let fetcher = RetryingFetcher::from_settings(transport, clock.clone(), &settings.fetch);
    let tokens = Arc::new(SharedToken::new(settings.auth.token.clone()));

    let cache = Arc::new(ContentCache::new(
        settings.cache.dir.clone(),
        settings.cache.capacity_bytes,
        settings.cache.low_water_ratio,
    )?);
    let orphans = {
        let known: HashSet<&str> = stored.items.iter().map(|m| m.id.as_str()).collect();
        cache.retain_ids(&known).await
    };
    if orphans > 0 {
        tracing::info!("Removed {} cache entries no longer in the sequence", orphans);
    }

    let loader = Arc::new(AssetLoader::new(
        cache,
        fetcher.clone(),
        tokens.clone(),
        DisplaySize {
            width: settings.fetch.display_width,
            height: settings.fetch.display_height,
        },
    ));
    let preloader = Arc::new(Preloader::new(loader.clone(), &settings.preload));

    let source = Arc::new(PhotosLibrarySource::new(
        fetcher,
        tokens,
        settings.fetch.api_base.clone(),
    ));
    let refresher = Arc::new(UrlRefresher::new(source, clock.clone(), &settings.refresh));

    let playlist: SharedPlaylist = Arc::new(RwLock::new(Vec::new()));
    let refresher_task = spawn_refresher(
        refresher.clone(),
        playlist.clone(),
        Some(store.clone() as Arc<dyn SequenceStore>),
        settings.refresh.period(),
    );

    let schedule = match &settings.schedule.grid {
        Some(grid) => WeeklySchedule::from_grid(grid)?,
        None => WeeklySchedule::always_on(),
    };
    let (gate, schedule_task) = spawn_schedule_signal(schedule, clock);
    let gate_open = *gate.borrow();

    let machine = PlaybackScheduler::new(&settings.playback);
    let (runner, handle, mut signals) = PlaybackRunner::new(
        machine,
        playlist,
        loader,
        preloader,
        settings.playback.load_timeout(),
        Some(gate),
    );
    let runner_task = runner
        .with_refresher(refresher, Some(store.clone() as Arc<dyn SequenceStore>))
        .spawn();

    if gate_open {
        // Stale locators are refreshed by the runner before the first fetch.
        load_sequence(&handle, stored.items).await;
    } else {
        tracing::info!("Outside the play schedule, waiting");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            signal = signals.recv() => match signal {
                Some(signal) => on_signal(signal, &handle, store.as_ref()).await,
                None => break,
            },
        }
    }

    handle.shutdown().await;
    refresher_task.abort();
    schedule_task.abort();
    let _ = runner_task.await;
    Ok(())
}

async fn load_sequence(handle: &PlayerHandle, items: Vec<frame_player::MediaItem>) {
    let count = items.len();
    match handle.load(items).await {
        Ok(()) => tracing::info!("Playing {} items", count),
        Err(e) => tracing::warn!("Cannot start playback: {}", e),
    }
}

/// Headless display sink: logs what a presentation layer would render.
async fn on_signal(signal: DisplaySignal, handle: &PlayerHandle, store: &dyn SequenceStore) {
    match signal {
        DisplaySignal::CurrentChanged { index, item, .. } => {
            tracing::info!(
                "Now showing #{} {} ({:?})",
                index,
                item.filename.as_deref().unwrap_or(&item.id),
                item.kind
            );
        }
        DisplaySignal::CurrentReady { index, media } => {
            tracing::debug!(
                "Item #{} ready: {} bytes of {}",
                index,
                media.bytes.len(),
                media.content_type
            );
        }
        DisplaySignal::TransitionChanged { active, effect } => {
            tracing::debug!("Transition {:?} active={}", effect, active);
        }
        DisplaySignal::PausedChanged(paused) => tracing::info!("Paused: {}", paused),
        DisplaySignal::ShouldStop => {
            tracing::info!("Schedule closed, stopping display");
            if let Err(e) = handle.acknowledge_stop().await {
                tracing::warn!("Failed to acknowledge stop: {}", e);
            }
        }
        DisplaySignal::ShouldStart => match store.load().await {
            Ok(stored) => load_sequence(handle, stored.items).await,
            Err(e) => tracing::error!("Failed to reload sequence: {:#}", e),
        },
    }
}
