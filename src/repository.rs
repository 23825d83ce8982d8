//! Storage seams for users, sessions and timers.
//!
//! The services depend only on these traits. [`crate::db::Store`] (SQLite via
//! SeaORM) and [`crate::db::MemoryStore`] are the shipped backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{Session, SessionToken, Timer, TimerId, TimerState, User, UserId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// The backend could not serve the request. Callers may retry.
    #[error("Repository unavailable: {0}")]
    Unavailable(String),

    /// A uniqueness constraint rejected the write.
    #[error("Duplicate record: {0}")]
    Duplicate(String),
}

impl From<sea_orm::DbErr> for RepositoryError {
    fn from(err: sea_orm::DbErr) -> Self {
        match err.sql_err() {
            Some(sea_orm::SqlErr::UniqueConstraintViolation(msg)) => Self::Duplicate(msg),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Inserts a user.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Duplicate`] if the username is taken.
    async fn create_user(&self, username: &str, password_hash: &str) -> RepositoryResult<User>;

    async fn find_user_by_username(&self, username: &str) -> RepositoryResult<Option<User>>;

    async fn find_user_by_id(&self, id: UserId) -> RepositoryResult<Option<User>>;
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns [`RepositoryError::Duplicate`] if the token already exists.
    async fn insert_session(&self, session: &Session) -> RepositoryResult<()>;

    async fn find_session(&self, token: &SessionToken) -> RepositoryResult<Option<Session>>;

    /// Removing a missing token is not an error.
    async fn delete_session(&self, token: &SessionToken) -> RepositoryResult<()>;

    /// Returns how many sessions were removed.
    async fn delete_sessions_for_user(&self, user_id: UserId) -> RepositoryResult<u64>;
}

#[async_trait]
pub trait TimerRepository: Send + Sync {
    async fn insert_timer(
        &self,
        owner_id: UserId,
        description: &str,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<Timer>;

    async fn find_timer(&self, id: TimerId) -> RepositoryResult<Option<Timer>>;

    /// Timers of one owner in one state, in creation order.
    async fn list_timers(&self, owner_id: UserId, state: TimerState)
    -> RepositoryResult<Vec<Timer>>;

    /// Atomically moves an active timer to stopped.
    ///
    /// Only the first call for a given id writes `stopped_at`; later calls
    /// leave the row untouched. Returns the row as persisted after the
    /// attempt, or `None` if no timer has this id.
    async fn stop_if_active(
        &self,
        id: TimerId,
        stopped_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<Timer>>;
}
