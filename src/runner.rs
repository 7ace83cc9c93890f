//! Async driver for the playback state machine.
//!
//! The runner owns a [`PlaybackScheduler`] and is the only task that touches
//! it. Timers, current-item loads and preloads run as detached tasks that
//! report back through an internal channel. The only network call awaited
//! in the loop is the locator refresh of a newly loaded sequence.

use crate::assets::AssetLoader;
use crate::cache::CachedMedia;
use crate::error::{FetchError, PlaybackError};
use crate::media::{MediaItem, SharedPlaylist};
use crate::playback::{
    DisplaySignal, Effect, PlaybackEvent, PlaybackScheduler, PlaybackState, PlaybackStats,
};
use crate::preload::Preloader;
use crate::refresh::UrlRefresher;
use crate::store::SequenceStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capacity of the outbound display signal channel.
const SIGNAL_BUFFER: usize = 64;

/// Requests from the outside world.
#[derive(Debug)]
pub enum PlayerCommand {
    Load {
        items: Vec<MediaItem>,
        reply: oneshot::Sender<Result<(), PlaybackError>>,
    },
    Next,
    Previous,
    TogglePause,
    /// The display finished playing the video at `index`.
    VideoEnded { index: usize },
    /// The display has stopped after a `ShouldStop`.
    AcknowledgeStop,
    Status(oneshot::Sender<PlayerStatus>),
    Shutdown,
}

/// Snapshot of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerStatus {
    pub state: PlaybackState,
    pub current_index: Option<usize>,
    pub stats: PlaybackStats,
}

/// Events produced by the runner's own background tasks.
#[derive(Debug)]
enum Internal {
    Event(PlaybackEvent),
    Loaded {
        index: usize,
        ticket: u64,
        media: CachedMedia,
    },
    /// A current-item load gave up. Only the latest ticket counts.
    TimedOut {
        index: usize,
        ticket: u64,
    },
}

/// Cloneable handle for sending commands to a running player.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    commands: mpsc::Sender<PlayerCommand>,
}

impl PlayerHandle {
    /// Load a new sequence and start from its first item.
    pub async fn load(&self, items: Vec<MediaItem>) -> Result<(), PlaybackError> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::Load { items, reply }).await?;
        rx.await.map_err(|_| PlaybackError::Stopped)?
    }

    pub async fn next(&self) -> Result<(), PlaybackError> {
        self.send(PlayerCommand::Next).await
    }

    pub async fn previous(&self) -> Result<(), PlaybackError> {
        self.send(PlayerCommand::Previous).await
    }

    pub async fn toggle_pause(&self) -> Result<(), PlaybackError> {
        self.send(PlayerCommand::TogglePause).await
    }

    pub async fn video_ended(&self, index: usize) -> Result<(), PlaybackError> {
        self.send(PlayerCommand::VideoEnded { index }).await
    }

    pub async fn acknowledge_stop(&self) -> Result<(), PlaybackError> {
        self.send(PlayerCommand::AcknowledgeStop).await
    }

    pub async fn status(&self) -> Result<PlayerStatus, PlaybackError> {
        let (reply, rx) = oneshot::channel();
        self.send(PlayerCommand::Status(reply)).await?;
        rx.await.map_err(|_| PlaybackError::Stopped)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(PlayerCommand::Shutdown).await;
    }

    async fn send(&self, command: PlayerCommand) -> Result<(), PlaybackError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PlaybackError::Stopped)
    }
}

/// Drives a [`PlaybackScheduler`] with tokio timers.
pub struct PlaybackRunner {
    machine: PlaybackScheduler,
    playlist: SharedPlaylist,
    loader: Arc<AssetLoader>,
    preloader: Arc<Preloader>,
    load_timeout: Duration,
    load_ticket: u64,
    commands: mpsc::Receiver<PlayerCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    signals: mpsc::Sender<DisplaySignal>,
    gate: Option<watch::Receiver<bool>>,
    refresher: Option<Arc<UrlRefresher>>,
    store: Option<Arc<dyn SequenceStore>>,
}

impl PlaybackRunner {
    /// Build a runner. Returns the handle for commands and the receiver of
    /// display signals.
    pub fn new(
        machine: PlaybackScheduler,
        playlist: SharedPlaylist,
        loader: Arc<AssetLoader>,
        preloader: Arc<Preloader>,
        load_timeout: Duration,
        gate: Option<watch::Receiver<bool>>,
    ) -> (Self, PlayerHandle, mpsc::Receiver<DisplaySignal>) {
        let (command_tx, commands) = mpsc::channel(32);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (signals, signal_rx) = mpsc::channel(SIGNAL_BUFFER);

        let runner = Self {
            machine,
            playlist,
            loader,
            preloader,
            load_timeout,
            load_ticket: 0,
            commands,
            internal_tx,
            internal_rx,
            signals,
            gate,
            refresher: None,
            store: None,
        };
        let handle = PlayerHandle {
            commands: command_tx,
        };
        (runner, handle, signal_rx)
    }

    /// Refresh stale locators of every loaded sequence before its first
    /// fetch, and reissue a locator that upstream rejects. Locators
    /// refreshed at load time are saved to `store` when given.
    pub fn with_refresher(
        mut self,
        refresher: Arc<UrlRefresher>,
        store: Option<Arc<dyn SequenceStore>>,
    ) -> Self {
        self.refresher = Some(refresher);
        self.store = store;
        self
    }

    /// Spawn the runner as a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands and internal events until shut down.
    pub async fn run(mut self) {
        tracing::info!("Playback runner started");

        let initial_gate = self.gate.as_mut().map(|rx| *rx.borrow_and_update());
        if let Some(open) = initial_gate {
            self.dispatch(PlaybackEvent::ScheduleChanged(open)).await;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(PlayerCommand::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
                changed = gate_changed(&mut self.gate) => match changed {
                    Some(open) => self.dispatch(PlaybackEvent::ScheduleChanged(open)).await,
                    None => {
                        tracing::debug!("Schedule signal closed");
                        self.gate = None;
                    }
                },
            }
        }

        tracing::info!("Playback runner stopped");
    }

    async fn on_command(&mut self, command: PlayerCommand) {
        match command {
            PlayerCommand::Load { items, reply } => {
                let result = self.load(items).await;
                let _ = reply.send(result);
            }
            PlayerCommand::Next => self.dispatch(PlaybackEvent::Next).await,
            PlayerCommand::Previous => self.dispatch(PlaybackEvent::Previous).await,
            PlayerCommand::TogglePause => self.dispatch(PlaybackEvent::TogglePause).await,
            PlayerCommand::VideoEnded { index } => {
                self.dispatch(PlaybackEvent::VideoEnded { index }).await
            }
            PlayerCommand::AcknowledgeStop => {
                self.dispatch(PlaybackEvent::StopAcknowledged).await;
                if self.machine.state() == PlaybackState::Idle {
                    self.playlist.write().await.clear();
                    self.preloader.reset();
                }
            }
            PlayerCommand::Status(reply) => {
                let _ = reply.send(PlayerStatus {
                    state: self.machine.state(),
                    current_index: self.machine.current_index(),
                    stats: self.machine.stats(),
                });
            }
            PlayerCommand::Shutdown => {}
        }
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Event(event) => self.dispatch(event).await,
            Internal::Loaded {
                index,
                ticket,
                media,
            } => {
                if ticket == self.load_ticket && self.machine.current_index() == Some(index) {
                    self.emit(DisplaySignal::CurrentReady { index, media });
                } else {
                    tracing::debug!("Discarding late load of item {}", index);
                }
            }
            Internal::TimedOut { index, ticket } => {
                if ticket == self.load_ticket {
                    self.dispatch(PlaybackEvent::LoadTimeout { index }).await;
                } else {
                    tracing::debug!("Discarding superseded timeout of item {}", index);
                }
            }
        }
    }

    async fn load(&mut self, mut items: Vec<MediaItem>) -> Result<(), PlaybackError> {
        if items.is_empty() {
            return Err(PlaybackError::SequenceEmpty);
        }
        if let Some(refresher) = self.refresher.clone() {
            let refresh = refresher.refresh_if_needed(&mut items);
            let Ok(report) = tokio::time::timeout(self.load_timeout, refresh).await else {
                tracing::warn!("Locator refresh timed out, loading sequence as stored");
                return self.start(items).await;
            };
            if !report.updated.is_empty() {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save_locators(&items).await {
                        tracing::warn!("Failed to save refreshed locators: {:#}", e);
                    }
                }
            }
        }

        self.start(items).await
    }

    async fn start(&mut self, items: Vec<MediaItem>) -> Result<(), PlaybackError> {
        let effects = self.machine.load(items)?;
        *self.playlist.write().await = self.machine.sequence().to_vec();
        self.preloader.reset();
        self.execute(effects).await;
        Ok(())
    }

    async fn dispatch(&mut self, event: PlaybackEvent) {
        let effects = self.machine.handle_event(event);
        self.execute(effects).await;
    }

    async fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Signal(DisplaySignal::CurrentChanged {
                    index,
                    previous,
                    item,
                }) => {
                    // The playlist copy carries locators reissued since load.
                    let item = self
                        .playlist
                        .read()
                        .await
                        .get(index)
                        .filter(|current| current.id == item.id)
                        .cloned()
                        .unwrap_or(item);
                    self.emit(DisplaySignal::CurrentChanged {
                        index,
                        previous,
                        item,
                    });
                }
                Effect::Signal(signal) => self.emit(signal),
                Effect::ArmTimer { generation, after } => {
                    self.schedule(after, PlaybackEvent::TimerFired { generation });
                }
                Effect::FinishTransition { generation, after } => {
                    self.schedule(after, PlaybackEvent::TransitionFinished { generation });
                }
                Effect::LoadCurrent { index } => self.load_current(index).await,
                Effect::Preload { index } => {
                    let playlist = self.playlist.read().await;
                    self.preloader.on_advance(&playlist, index);
                }
            }
        }
    }

    /// Never waits on the display: a full channel drops the signal.
    fn emit(&self, signal: DisplaySignal) {
        match self.signals.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(signal)) => {
                tracing::warn!("Display sink is behind, dropping {}", signal_name(&signal));
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Display sink gone, dropping signal");
            }
        }
    }

    fn schedule(&self, after: Duration, event: PlaybackEvent) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Internal::Event(event));
        });
    }

    /// Fetch the current item under the load timeout. Failures wait out the
    /// deadline and then count as a load timeout, so a dead item is skipped
    /// without spinning through the sequence.
    async fn load_current(&mut self, index: usize) {
        let item = match self.playlist.read().await.get(index) {
            Some(item) => item.clone(),
            None => match self.machine.sequence().get(index) {
                Some(item) => item.clone(),
                None => return,
            },
        };

        self.load_ticket += 1;
        let ticket = self.load_ticket;
        let loader = self.loader.clone();
        let refresher = self.refresher.clone();
        let playlist = self.playlist.clone();
        let tx = self.internal_tx.clone();
        let deadline = Instant::now() + self.load_timeout;

        tokio::spawn(async move {
            let fetch = fetch_current(&loader, refresher.as_deref(), &playlist, &item);
            match tokio::time::timeout_at(deadline, fetch).await {
                Ok(Ok(media)) => {
                    let _ = tx.send(Internal::Loaded {
                        index,
                        ticket,
                        media,
                    });
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!("Failed to load {}: {}", item.id, e);
                    tokio::time::sleep_until(deadline).await;
                }
                Err(_) => {
                    tracing::warn!("Timed out loading {}", item.id);
                }
            }
            let _ = tx.send(Internal::TimedOut { index, ticket });
        });
    }
}

/// Load `item`, reissuing its locator once if upstream rejects it.
async fn fetch_current(
    loader: &AssetLoader,
    refresher: Option<&UrlRefresher>,
    playlist: &SharedPlaylist,
    item: &MediaItem,
) -> Result<CachedMedia, FetchError> {
    let err = match loader.ensure_cached(item).await {
        Ok(media) => return Ok(media),
        Err(err) => err,
    };
    let Some(refresher) = refresher else {
        return Err(err);
    };
    if !matches!(err.status(), Some(401 | 403)) {
        return Err(err);
    }

    tracing::info!("Locator for {} was rejected, reissuing", item.id);
    match refresher.reissue_item(playlist, &item.id).await {
        Some(fresh) => loader.ensure_cached(&fresh).await,
        None => Err(err),
    }
}

fn signal_name(signal: &DisplaySignal) -> &'static str {
    match signal {
        DisplaySignal::CurrentChanged { .. } => "CurrentChanged",
        DisplaySignal::CurrentReady { .. } => "CurrentReady",
        DisplaySignal::TransitionChanged { .. } => "TransitionChanged",
        DisplaySignal::PausedChanged(_) => "PausedChanged",
        DisplaySignal::ShouldStart => "ShouldStart",
        DisplaySignal::ShouldStop => "ShouldStop",
    }
}

async fn gate_changed(gate: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match gate {
        Some(rx) => {
            rx.changed().await.ok()?;
            let open = *rx.borrow_and_update();
            Some(open)
        }
        None => std::future::pending().await,
    }
}
