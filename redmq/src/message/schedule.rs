//! Message scheduling
//!
//! A message may be delayed, repeated, driven by a cron expression, or a mix
//! of these. Scheduled messages wait in the queue's scheduled set; periodic
//! ones (cron or repeat) act as templates from which the scheduler publishes
//! copies.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduling parameters of a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSchedule {
    /// Delay before the first publication
    pub delay: Option<Duration>,
    /// Cron expression (`sec min hour day-of-month month day-of-week [year]`)
    pub cron: Option<String>,
    /// Number of repetitions
    pub repeat: u32,
    /// Spacing between repetitions
    pub repeat_period: Option<Duration>,
}

/// Progress of a schedule, stored with the message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleProgress {
    /// Repetitions done since the last cron tick
    pub repeat_count: u32,
    /// Whether the cron expression has fired at least once
    pub cron_fired: bool,
    /// Initial delay still to apply, in milliseconds
    pub pending_delay_ms: u64,
}

impl ScheduleProgress {
    /// Progress of a schedule that has not run yet
    pub fn initial(schedule: &MessageSchedule) -> Self {
        Self {
            repeat_count: 0,
            cron_fired: false,
            pending_delay_ms: schedule.delay.map(|d| d.as_millis() as u64).unwrap_or(0),
        }
    }
}

impl MessageSchedule {
    /// Whether the message is a template for periodic copies
    pub fn is_periodic(&self) -> bool {
        self.cron.is_some() || self.repeat > 0
    }

    /// Whether any scheduling parameter is set
    pub fn is_schedulable(&self) -> bool {
        self.is_periodic() || self.delay.map(|d| !d.is_zero()).unwrap_or(false)
    }

    /// Validate the parameters
    pub fn validate(&self) -> Result<()> {
        if let Some(expr) = &self.cron {
            parse_cron(expr)?;
        }
        if self.repeat > 0 && self.repeat_period.map(|p| p.is_zero()).unwrap_or(true) {
            return Err(Error::Validation(
                "a repeated message requires a positive repeat period".into(),
            ));
        }
        if self.repeat == 0 && self.repeat_period.is_some() {
            return Err(Error::Validation(
                "a repeat period requires a repeat count".into(),
            ));
        }
        Ok(())
    }

    /// Next publication time in milliseconds, advancing `progress`
    ///
    /// The pending delay is applied once and, without cron, counts as the
    /// first repetition. After that, a cron schedule fires
    /// on its ticks; when combined with `repeat`, each tick is followed by
    /// `repeat` publications spaced by `repeat_period` as long as they fall
    /// before the next tick. Without cron, the first of the `repeat`
    /// publications is due at `now` and the others follow `repeat_period`
    /// apart, then the schedule ends. `None` means the schedule is finished.
    pub fn next_timestamp(
        &self,
        progress: &mut ScheduleProgress,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let now_ms = now.timestamp_millis();

        if progress.pending_delay_ms > 0 {
            let delay = progress.pending_delay_ms as i64;
            progress.pending_delay_ms = 0;
            if self.cron.is_none() && self.repeat > 0 {
                progress.repeat_count += 1;
            }
            return Ok(Some(now_ms + delay));
        }

        let cron_ts = match &self.cron {
            Some(expr) => parse_cron(expr)?
                .after(&now)
                .next()
                .map(|dt| dt.timestamp_millis()),
            None => None,
        };

        let repeat_ts = if self.repeat > 0 && progress.repeat_count < self.repeat {
            let period = self.repeat_period.map(|p| p.as_millis() as i64).unwrap_or(0);
            if self.cron.is_none() && progress.repeat_count == 0 {
                Some(now_ms)
            } else {
                Some(now_ms + period)
            }
        } else {
            None
        };

        match (cron_ts, repeat_ts) {
            (Some(cron), Some(repeat)) if repeat < cron && progress.cron_fired => {
                progress.repeat_count += 1;
                Ok(Some(repeat))
            }
            (Some(cron), _) => {
                progress.repeat_count = 0;
                progress.cron_fired = true;
                Ok(Some(cron))
            }
            (None, Some(repeat)) => {
                progress.repeat_count += 1;
                Ok(Some(repeat))
            }
            (None, None) => Ok(None),
        }
    }
}

fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::try_from(expr)
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expr, e)))
}
