//! Timer state machine and elapsed-time computation.
//!
//! A timer is created `Active` and moves to `Stopped` exactly once. Elapsed
//! time is never stored: it is recomputed from the fixed timestamps every
//! time it is read, so repeated reads cannot drift.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{TimerId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    Active,
    Stopped,
}

impl TimerState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Stopped => "stopped",
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown timer state: {other}")),
        }
    }
}

/// A persisted timer record.
///
/// Invariant: `state == Active` iff `stopped_at.is_none()`, and a stopped
/// timer has `stopped_at >= started_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timer {
    pub id: TimerId,
    pub owner_id: UserId,
    pub description: String,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub state: TimerState,
}

impl Timer {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Live progress at `now`, or `None` once stopped.
    #[must_use]
    pub fn progress_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.is_active()
            .then(|| compute_elapsed(now, self.started_at, self.stopped_at, self.state))
    }

    /// Frozen duration, or `None` while still running.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        (!self.is_active()).then(|| {
            compute_elapsed(self.started_at, self.started_at, self.stopped_at, self.state)
        })
    }

    /// Builds the wire representation with the computed field filled in.
    #[must_use]
    pub fn view_at(&self, now: DateTime<Utc>) -> TimerView {
        TimerView {
            id: self.id,
            description: self.description.clone(),
            started_at: self.started_at.timestamp_millis(),
            stopped_at: self.stopped_at.map(|t| t.timestamp_millis()),
            state: self.state,
            is_active: self.is_active(),
            progress: self.progress_at(now).map(|d| d.num_milliseconds()),
            duration: self.duration().map(|d| d.num_milliseconds()),
        }
    }
}

/// Elapsed time as a pure function of the timer's timestamps.
///
/// Active timers measure up to `now`; stopped timers measure up to
/// `stopped_at` and ignore `now` entirely. Never negative.
#[must_use]
pub fn compute_elapsed(
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    state: TimerState,
) -> Duration {
    let end = match (state, stopped_at) {
        (TimerState::Stopped, Some(stopped_at)) => stopped_at,
        // A stopped row without an end time is corrupt; report zero rather than a live value.
        (TimerState::Stopped, None) => started_at,
        (TimerState::Active, _) => now,
    };

    (end - started_at).max(Duration::zero())
}

/// A timer together with its computed progress or duration, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    pub id: TimerId,
    pub description: String,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<i64>,
    pub state: TimerState,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
}
