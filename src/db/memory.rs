//! In-memory backend. Nothing survives a restart; useful for tests and
//! throwaway deployments (`storage.backend = "memory"`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::domain::{Session, SessionToken, Timer, TimerId, TimerState, User, UserId};
use crate::repository::{
    RepositoryError, RepositoryResult, SessionRepository, TimerRepository, UserRepository,
};

#[derive(Default)]
struct Inner {
    users: BTreeMap<UserId, User>,
    sessions: HashMap<SessionToken, Session>,
    timers: BTreeMap<TimerId, Timer>,
    next_user_id: i32,
    next_timer_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_user(&self, username: &str, password_hash: &str) -> RepositoryResult<User> {
        let mut inner = self.inner.write().await;

        if inner.users.values().any(|u| u.username == username) {
            return Err(RepositoryError::Duplicate(format!(
                "username '{username}' already exists"
            )));
        }

        inner.next_user_id += 1;
        let user = User {
            id: UserId::new(inner.next_user_id),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user_by_username(&self, username: &str) -> RepositoryResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.values().find(|u| u.username == username).cloned())
    }

    async fn find_user_by_id(&self, id: UserId) -> RepositoryResult<Option<User>> {
        Ok(self.inner.read().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl SessionRepository for MemoryStore {
    async fn insert_session(&self, session: &Session) -> RepositoryResult<()> {
        let mut inner = self.inner.write().await;

        if inner.sessions.contains_key(&session.token) {
            return Err(RepositoryError::Duplicate("session token".to_string()));
        }

        inner.sessions.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, token: &SessionToken) -> RepositoryResult<Option<Session>> {
        Ok(self.inner.read().await.sessions.get(token).cloned())
    }

    async fn delete_session(&self, token: &SessionToken) -> RepositoryResult<()> {
        self.inner.write().await.sessions.remove(token);
        Ok(())
    }

    async fn delete_sessions_for_user(&self, user_id: UserId) -> RepositoryResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - inner.sessions.len()) as u64)
    }
}

#[async_trait]
impl TimerRepository for MemoryStore {
    async fn insert_timer(
        &self,
        owner_id: UserId,
        description: &str,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<Timer> {
        let mut inner = self.inner.write().await;

        inner.next_timer_id += 1;
        let timer = Timer {
            id: TimerId::new(inner.next_timer_id),
            owner_id,
            description: description.to_string(),
            started_at,
            stopped_at: None,
            state: TimerState::Active,
        };
        inner.timers.insert(timer.id, timer.clone());
        Ok(timer)
    }

    async fn find_timer(&self, id: TimerId) -> RepositoryResult<Option<Timer>> {
        Ok(self.inner.read().await.timers.get(&id).cloned())
    }

    async fn list_timers(
        &self,
        owner_id: UserId,
        state: TimerState,
    ) -> RepositoryResult<Vec<Timer>> {
        let inner = self.inner.read().await;
        // BTreeMap iteration is id order, which is creation order.
        Ok(inner
            .timers
            .values()
            .filter(|t| t.owner_id == owner_id && t.state == state)
            .cloned()
            .collect())
    }

    async fn stop_if_active(
        &self,
        id: TimerId,
        stopped_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<Timer>> {
        let mut inner = self.inner.write().await;

        let Some(timer) = inner.timers.get_mut(&id) else {
            return Ok(None);
        };

        if timer.state.is_active() {
            timer.state = TimerState::Stopped;
            timer.stopped_at = Some(stopped_at);
        }

        Ok(Some(timer.clone()))
    }
}
