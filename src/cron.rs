//! Cron due-time evaluation.
//!
//! The process owns no timer: an external scheduler ticks the manager, which
//! asks this module whether each cron task is currently due. A task is due
//! when the most recent scheduled moment falls inside the tolerance window
//! behind `now` and has not been consumed yet (`last_run` predates it). The
//! window absorbs tick jitter; the last-run check keeps each scheduled slot
//! idempotent, so a 1-minute schedule ticked at t, t+1s, and t+58s fires
//! exactly once for the t-aligned slot.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': {message}")]
    Invalid { expression: String, message: String },
}

/// Evaluates cron expressions against explicit timestamps.
#[derive(Debug, Clone)]
pub struct CronEvaluator {
    window: Duration,
}

impl CronEvaluator {
    pub const DEFAULT_WINDOW_SECS: u64 = 65;

    pub fn new(window_secs: u64) -> Self {
        Self {
            window: Duration::seconds(window_secs as i64),
        }
    }

    /// The most recent scheduled moment at or before `now`, provided it is
    /// still inside the tolerance window. `None` means the schedule has no
    /// eligible moment right now (the last one is stale or in the future).
    pub fn previous_scheduled_time(
        &self,
        expression: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CronError> {
        let cron = parse_expression(expression)?;
        let window_start = now - self.window;

        let mut previous = None;
        for occurrence in cron.iter_after(window_start) {
            if occurrence > now {
                break;
            }
            previous = Some(occurrence);
        }
        Ok(previous)
    }

    /// Whether a task with this schedule and `last_run` should fire at `now`.
    pub fn is_due(
        &self,
        expression: &str,
        now: DateTime<Utc>,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<bool, CronError> {
        Ok(match self.previous_scheduled_time(expression, now)? {
            None => false,
            Some(previous) => last_run.is_none_or(|last| last < previous),
        })
    }
}

impl Default for CronEvaluator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW_SECS)
    }
}

/// Parse a cron expression, tolerating both 5-field (minute resolution) and
/// 6-field (with seconds) forms. 5-field expressions get a zero seconds
/// column prepended.
fn parse_expression(expression: &str) -> Result<croner::Cron, CronError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };

    normalized
        .parse::<croner::Cron>()
        .map_err(|e| CronError::Invalid {
            expression: expression.to_string(),
            message: e.to_string(),
        })
}
