//! Timer lifecycle: start, stop, list, snapshot.
//!
//! Every state change goes through the repository's atomic primitives; the
//! engine itself keeps no mutable state.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Timer, TimerId, TimerState, TimerView, UserId};
use crate::repository::{RepositoryError, TimerRepository};

pub const MAX_DESCRIPTION_LEN: usize = 200;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timer not found: {0}")]
    NotFound(TimerId),

    /// The timer exists but belongs to someone else.
    #[error("Timer {0} belongs to another user")]
    Forbidden(TimerId),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Which half of a user's timers a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerFilter {
    Active,
    Stopped,
}

impl From<TimerFilter> for TimerState {
    fn from(filter: TimerFilter) -> Self {
        match filter {
            TimerFilter::Active => Self::Active,
            TimerFilter::Stopped => Self::Stopped,
        }
    }
}

impl From<bool> for TimerFilter {
    fn from(is_active: bool) -> Self {
        if is_active { Self::Active } else { Self::Stopped }
    }
}

/// Both halves computed against a single instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllTimers {
    pub active: Vec<TimerView>,
    pub stopped: Vec<TimerView>,
}

pub struct TimerEngine {
    timers: Arc<dyn TimerRepository>,
}

impl TimerEngine {
    #[must_use]
    pub fn new(timers: Arc<dyn TimerRepository>) -> Self {
        Self { timers }
    }

    /// Starts a new active timer for `owner_id`.
    pub async fn start(&self, owner_id: UserId, description: &str) -> Result<Timer, TimerError> {
        let description = description.trim();

        if description.is_empty() {
            return Err(TimerError::InvalidInput(
                "Description is required".to_string(),
            ));
        }

        if description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(TimerError::InvalidInput(format!(
                "Description must be at most {MAX_DESCRIPTION_LEN} characters"
            )));
        }

        let timer = self
            .timers
            .insert_timer(owner_id, description, Utc::now())
            .await?;

        info!(timer_id = %timer.id, owner_id = owner_id.value(), "Timer started");
        Ok(timer)
    }

    /// Stops a timer. Idempotent.
    ///
    /// Concurrent calls race on the repository's conditional update: one of
    /// them writes `stopped_at`, and every caller gets the row as persisted.
    pub async fn stop(&self, owner_id: UserId, timer_id: TimerId) -> Result<Timer, TimerError> {
        let timer = self.owned_timer(owner_id, timer_id).await?;

        if !timer.is_active() {
            debug!(timer_id = %timer_id, "Stop on an already stopped timer");
            return Ok(timer);
        }

        // Clamp so a backwards clock step cannot produce stopped_at < started_at.
        let stopped_at = Utc::now().max(timer.started_at);

        let stopped = self
            .timers
            .stop_if_active(timer_id, stopped_at)
            .await?
            .ok_or(TimerError::NotFound(timer_id))?;

        info!(
            timer_id = %timer_id,
            owner_id = owner_id.value(),
            stopped_at = %stopped.stopped_at.unwrap_or(stopped_at),
            "Timer stopped"
        );
        Ok(stopped)
    }

    pub async fn list_active(&self, owner_id: UserId) -> Result<Vec<Timer>, TimerError> {
        Ok(self.timers.list_timers(owner_id, TimerState::Active).await?)
    }

    pub async fn list_stopped(&self, owner_id: UserId) -> Result<Vec<Timer>, TimerError> {
        Ok(self.timers.list_timers(owner_id, TimerState::Stopped).await?)
    }

    /// Pull snapshot: one half of the user's timers with progress or
    /// duration computed at `now`.
    pub async fn snapshot(
        &self,
        owner_id: UserId,
        filter: TimerFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimerView>, TimerError> {
        let timers = self.timers.list_timers(owner_id, filter.into()).await?;
        Ok(timers.iter().map(|t| t.view_at(now)).collect())
    }

    pub async fn all_timers(
        &self,
        owner_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<AllTimers, TimerError> {
        let (active, stopped) = futures::try_join!(
            self.snapshot(owner_id, TimerFilter::Active, now),
            self.snapshot(owner_id, TimerFilter::Stopped, now),
        )?;
        Ok(AllTimers { active, stopped })
    }

    async fn owned_timer(&self, owner_id: UserId, timer_id: TimerId) -> Result<Timer, TimerError> {
        let timer = self
            .timers
            .find_timer(timer_id)
            .await?
            .ok_or(TimerError::NotFound(timer_id))?;

        if timer.owner_id != owner_id {
            return Err(TimerError::Forbidden(timer_id));
        }

        Ok(timer)
    }
}
