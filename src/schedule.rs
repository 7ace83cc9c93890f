//! Weekly play schedule and the gate signal derived from it.

use crate::clock::Clock;
use crate::error::ConfigError;
use chrono::{DateTime, Datelike, Local, Timelike, Utc, Weekday};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How often the schedule is re-evaluated.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// 7 x 24 grid of "should play" flags, indexed by weekday (Monday first) and
/// local hour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklySchedule {
    grid: [[bool; 24]; 7],
}

impl WeeklySchedule {
    pub fn always_on() -> Self {
        Self {
            grid: [[true; 24]; 7],
        }
    }

    pub fn from_grid(rows: &[Vec<bool>]) -> Result<Self, ConfigError> {
        if rows.len() != 7 {
            return Err(ConfigError::new("schedule.grid", "expected 7 weekdays"));
        }
        let mut grid = [[false; 24]; 7];
        for (day, row) in rows.iter().enumerate() {
            if row.len() != 24 {
                return Err(ConfigError::new("schedule.grid", "expected 24 hours per day"));
            }
            grid[day].copy_from_slice(row);
        }
        Ok(Self { grid })
    }

    pub fn is_open_at(&self, weekday: Weekday, hour: u32) -> bool {
        let day = weekday.num_days_from_monday() as usize;
        self.grid[day][(hour as usize).min(23)]
    }

    /// Evaluate at `at` in the local time zone.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&Local);
        self.is_open_at(local.weekday(), local.hour())
    }
}

/// Publish the schedule gate on a watch channel, re-evaluated every minute.
/// Receivers only observe changes.
pub fn spawn_schedule_signal(
    schedule: WeeklySchedule,
    clock: Arc<dyn Clock>,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(schedule.is_open(clock.now()));

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            let open = schedule.is_open(clock.now());
            let changed = tx.send_if_modified(|current| {
                if *current == open {
                    false
                } else {
                    *current = open;
                    true
                }
            });
            if changed {
                tracing::info!("Schedule gate is now {}", if open { "open" } else { "closed" });
            }
            if tx.is_closed() {
                break;
            }
        }
    });

    (rx, task)
}
