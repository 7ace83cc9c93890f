//! Playback state machine.
//!
//! [`PlaybackScheduler`] decides what is on screen. It is synchronous and
//! owns no timers: every input arrives through [`PlaybackScheduler::handle_event`]
//! and every side effect leaves as an [`Effect`] for the runner to carry out.
//! Timer and transition effects carry a generation so that late firings of
//! disarmed timers are recognised and dropped.

use crate::cache::CachedMedia;
use crate::config::PlaybackSettings;
use crate::error::PlaybackError;
use crate::media::{MediaItem, MediaKind, PhotoOrder};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Visual handoff between two items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionEffect {
    /// Instant switch.
    None,
    #[default]
    Fade,
    Slide,
    Zoom,
}

/// Externally visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No sequence loaded.
    Idle,
    /// Displaying the current item, auto-advancing when it is an image.
    Showing,
    /// Handing off from the previous item to the current one.
    Transitioning,
    /// Auto-advance suspended.
    Paused,
}

/// What caused an advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceTrigger {
    Timer,
    VideoEnd,
    LoadTimeout,
    User,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Slide timer armed with `generation` elapsed.
    TimerFired { generation: u64 },
    /// The video at `index` finished playing.
    VideoEnded { index: usize },
    /// The item at `index` did not materialize in time.
    LoadTimeout { index: usize },
    /// Transition armed with `generation` elapsed.
    TransitionFinished { generation: u64 },
    Next,
    Previous,
    TogglePause,
    /// New value of the schedule gate.
    ScheduleChanged(bool),
    /// The caller has stopped the display after a `ShouldStop`.
    StopAcknowledged,
}

/// Outbound notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplaySignal {
    CurrentChanged {
        index: usize,
        previous: Option<usize>,
        item: MediaItem,
    },
    /// Bytes for the current item are available.
    CurrentReady { index: usize, media: CachedMedia },
    TransitionChanged {
        active: bool,
        effect: TransitionEffect,
    },
    PausedChanged(bool),
    ShouldStart,
    ShouldStop,
}

/// Work the runner must perform on behalf of the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Signal(DisplaySignal),
    /// Fire `TimerFired { generation }` after `after`.
    ArmTimer { generation: u64, after: Duration },
    /// Fire `TransitionFinished { generation }` after `after`.
    FinishTransition { generation: u64, after: Duration },
    /// Fetch the bytes of the item at `index` under the load timeout.
    LoadCurrent { index: usize },
    /// Warm the lookahead from `index`.
    Preload { index: usize },
}

/// Counters kept by the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub advances: u64,
    pub load_timeouts: u64,
    /// Advance triggers dropped because a transition was in flight.
    pub skipped_triggers: u64,
}

/// The playback state machine.
pub struct PlaybackScheduler {
    items: Vec<MediaItem>,
    state: PlaybackState,
    current: usize,
    /// Pause intent; survives a user navigation while paused.
    paused: bool,
    interval: Duration,
    transition: Duration,
    effect: TransitionEffect,
    order: PhotoOrder,
    timer_generation: u64,
    transition_generation: u64,
    gate_open: bool,
    stop_pending: bool,
    stats: PlaybackStats,
    rng: StdRng,
}

impl PlaybackScheduler {
    pub fn new(settings: &PlaybackSettings) -> Self {
        Self::with_rng(settings, StdRng::from_entropy())
    }

    /// Use a caller-provided RNG for the random order.
    pub fn with_rng(settings: &PlaybackSettings, rng: StdRng) -> Self {
        Self {
            items: Vec::new(),
            state: PlaybackState::Idle,
            current: 0,
            paused: false,
            interval: settings.slide_interval(),
            transition: settings.transition_duration(),
            effect: settings.transition_effect,
            order: settings.photo_order,
            timer_generation: 0,
            transition_generation: 0,
            gate_open: true,
            stop_pending: false,
            stats: PlaybackStats::default(),
            rng,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_index(&self) -> Option<usize> {
        (self.state != PlaybackState::Idle).then_some(self.current)
    }

    pub fn current_item(&self) -> Option<&MediaItem> {
        self.current_index().and_then(|i| self.items.get(i))
    }

    /// The loaded sequence in playback order.
    pub fn sequence(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    pub fn is_stop_pending(&self) -> bool {
        self.stop_pending
    }

    /// Apply new playback settings; they take effect from the next load.
    pub fn configure(&mut self, settings: &PlaybackSettings) {
        self.interval = settings.slide_interval();
        self.transition = settings.transition_duration();
        self.effect = settings.transition_effect;
        self.order = settings.photo_order;
    }

    /// Load a sequence, ordered by the configured photo order, and start
    /// showing its first item.
    pub fn load(&mut self, mut items: Vec<MediaItem>) -> Result<Vec<Effect>, PlaybackError> {
        if items.is_empty() {
            tracing::warn!("Refusing to load an empty sequence");
            return Err(PlaybackError::SequenceEmpty);
        }

        self.order.arrange(&mut items, &mut self.rng);
        tracing::info!(
            "Loaded sequence of {} items ({:?} order)",
            items.len(),
            self.order
        );

        self.items = items;
        self.current = 0;
        self.paused = false;
        self.stop_pending = false;
        self.timer_generation += 1;
        self.transition_generation += 1;
        self.state = PlaybackState::Showing;

        let mut effects = self.present(None);
        self.arm_timer(&mut effects);
        Ok(effects)
    }

    /// Feed one event through the transition table.
    pub fn handle_event(&mut self, event: PlaybackEvent) -> Vec<Effect> {
        let mut effects = Vec::new();

        match event {
            PlaybackEvent::TimerFired { generation } => {
                if generation == self.timer_generation {
                    self.advance(1, AdvanceTrigger::Timer, &mut effects);
                }
            }
            PlaybackEvent::VideoEnded { index } => {
                if self.is_current(index) {
                    self.advance(1, AdvanceTrigger::VideoEnd, &mut effects);
                }
            }
            PlaybackEvent::LoadTimeout { index } => {
                if self.is_current(index) {
                    self.stats.load_timeouts += 1;
                    tracing::warn!(
                        "Item {} did not load in time ({} timeouts so far)",
                        index,
                        self.stats.load_timeouts
                    );
                    self.advance(1, AdvanceTrigger::LoadTimeout, &mut effects);
                }
            }
            PlaybackEvent::TransitionFinished { generation } => {
                if self.state == PlaybackState::Transitioning
                    && generation == self.transition_generation
                {
                    self.settle(true, &mut effects);
                }
            }
            PlaybackEvent::Next => self.advance(1, AdvanceTrigger::User, &mut effects),
            PlaybackEvent::Previous => self.advance(-1, AdvanceTrigger::User, &mut effects),
            PlaybackEvent::TogglePause => self.toggle_pause(&mut effects),
            PlaybackEvent::ScheduleChanged(open) => self.schedule_changed(open, &mut effects),
            PlaybackEvent::StopAcknowledged => {
                if self.stop_pending {
                    self.stop_pending = false;
                    self.enter_idle();
                }
            }
        }

        effects
    }

    fn is_current(&self, index: usize) -> bool {
        self.state != PlaybackState::Idle && index == self.current
    }

    fn advance(&mut self, step: isize, trigger: AdvanceTrigger, effects: &mut Vec<Effect>) {
        if self.stop_pending {
            return;
        }
        let allowed = match (self.state, trigger) {
            (PlaybackState::Idle, _) => false,
            (PlaybackState::Transitioning, _) => {
                self.stats.skipped_triggers += 1;
                tracing::debug!("Ignoring {:?} advance during transition", trigger);
                false
            }
            (PlaybackState::Showing, _) => true,
            (PlaybackState::Paused, AdvanceTrigger::User) => true,
            (PlaybackState::Paused, _) => false,
        };
        if !allowed {
            return;
        }

        let len = self.items.len() as isize;
        let previous = self.current;
        self.current = (self.current as isize + step).rem_euclid(len) as usize;
        self.stats.advances += 1;
        self.timer_generation += 1;
        tracing::debug!(
            "Advance {:?}: {} -> {} of {}",
            trigger,
            previous,
            self.current,
            len
        );

        effects.extend(self.present(Some(previous)));

        if self.transition.is_zero() {
            self.settle(false, effects);
        } else {
            self.state = PlaybackState::Transitioning;
            self.transition_generation += 1;
            effects.push(Effect::Signal(DisplaySignal::TransitionChanged {
                active: true,
                effect: self.effect,
            }));
            effects.push(Effect::FinishTransition {
                generation: self.transition_generation,
                after: self.transition,
            });
        }
    }

    /// Announce the current item and request its bytes.
    fn present(&self, previous: Option<usize>) -> Vec<Effect> {
        vec![
            Effect::Signal(DisplaySignal::CurrentChanged {
                index: self.current,
                previous,
                item: self.items[self.current].clone(),
            }),
            Effect::LoadCurrent {
                index: self.current,
            },
            Effect::Preload {
                index: self.current,
            },
        ]
    }

    fn settle(&mut self, was_transitioning: bool, effects: &mut Vec<Effect>) {
        if was_transitioning {
            effects.push(Effect::Signal(DisplaySignal::TransitionChanged {
                active: false,
                effect: self.effect,
            }));
        }
        if self.paused {
            self.state = PlaybackState::Paused;
        } else {
            self.state = PlaybackState::Showing;
            self.arm_timer(effects);
        }
    }

    /// Arm the slide timer for image items. Videos advance on their own end.
    fn arm_timer(&mut self, effects: &mut Vec<Effect>) {
        if self.stop_pending {
            return;
        }
        match self.items[self.current].kind {
            MediaKind::Image => effects.push(Effect::ArmTimer {
                generation: self.timer_generation,
                after: self.interval,
            }),
            MediaKind::Video => {}
        }
    }

    fn toggle_pause(&mut self, effects: &mut Vec<Effect>) {
        if self.stop_pending {
            return;
        }
        match self.state {
            PlaybackState::Showing => {
                self.paused = true;
                self.state = PlaybackState::Paused;
                self.timer_generation += 1;
                effects.push(Effect::Signal(DisplaySignal::PausedChanged(true)));
            }
            PlaybackState::Paused => {
                self.paused = false;
                self.state = PlaybackState::Showing;
                self.timer_generation += 1;
                effects.push(Effect::Signal(DisplaySignal::PausedChanged(false)));
                self.arm_timer(effects);
            }
            PlaybackState::Transitioning | PlaybackState::Idle => {
                tracing::debug!("Ignoring pause toggle in {:?}", self.state);
            }
        }
    }

    fn schedule_changed(&mut self, open: bool, effects: &mut Vec<Effect>) {
        if open == self.gate_open {
            return;
        }
        self.gate_open = open;

        if open {
            tracing::info!("Schedule window opened");
            effects.push(Effect::Signal(DisplaySignal::ShouldStart));
        } else if self.state != PlaybackState::Idle && !self.stop_pending {
            tracing::info!("Schedule window closed, requesting stop");
            self.stop_pending = true;
            self.timer_generation += 1;
            effects.push(Effect::Signal(DisplaySignal::ShouldStop));
        }
    }

    fn enter_idle(&mut self) {
        tracing::info!("Playback stopped");
        self.state = PlaybackState::Idle;
        self.items.clear();
        self.current = 0;
        self.paused = false;
        self.timer_generation += 1;
        self.transition_generation += 1;
    }
}
