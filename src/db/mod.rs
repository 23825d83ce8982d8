use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::domain::{Session, SessionToken, Timer, TimerId, TimerState, User, UserId};
use crate::repository::{
    RepositoryError, RepositoryResult, SessionRepository, TimerRepository, UserRepository,
};

pub mod memory;
pub mod migrator;
pub mod repositories;

pub use memory::MemoryStore;

/// Converts a stored epoch-millisecond value back into an instant.
pub(crate) fn millis_to_utc(ms: i64) -> RepositoryResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| RepositoryError::Unavailable(format!("timestamp out of range: {ms}")))
}

/// SQLite-backed storage for users, sessions and timers.
#[derive(Clone)]
pub struct Store {
    pub conn: DatabaseConnection,
}

impl Store {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::with_pool_options(db_url, 5, 1).await
    }

    pub async fn with_pool_options(
        db_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        use sea_orm_migration::MigratorTrait;

        let in_memory = db_url.contains(":memory:");

        if !in_memory {
            let path_str = db_url.trim_start_matches("sqlite:");
            if let Some(parent) = Path::new(path_str).parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            if !Path::new(path_str).exists() {
                std::fs::File::create(path_str)?;
            }
        }

        // Every pooled connection to `:memory:` would open its own empty database.
        let (max_connections, min_connections) = if in_memory {
            (1, 1)
        } else {
            (max_connections, min_connections)
        };

        let mut opt = ConnectOptions::new(db_url.to_string());
        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(600))
            .sqlx_logging(false);

        let conn = Database::connect(opt).await?;

        migrator::Migrator::up(&conn, None).await?;

        info!(
            "Database connected & migrations applied (pool: {}-{})",
            min_connections, max_connections
        );

        Ok(Self { conn })
    }

    fn user_repo(&self) -> repositories::user::UserRepository {
        repositories::user::UserRepository::new(self.conn.clone())
    }

    fn session_repo(&self) -> repositories::session::SessionRepository {
        repositories::session::SessionRepository::new(self.conn.clone())
    }

    fn timer_repo(&self) -> repositories::timer::TimerRepository {
        repositories::timer::TimerRepository::new(self.conn.clone())
    }
}

#[async_trait]
impl UserRepository for Store {
    async fn create_user(&self, username: &str, password_hash: &str) -> RepositoryResult<User> {
        self.user_repo().create(username, password_hash).await
    }

    async fn find_user_by_username(&self, username: &str) -> RepositoryResult<Option<User>> {
        self.user_repo().get_by_username(username).await
    }

    async fn find_user_by_id(&self, id: UserId) -> RepositoryResult<Option<User>> {
        self.user_repo().get_by_id(id).await
    }
}

#[async_trait]
impl SessionRepository for Store {
    async fn insert_session(&self, session: &Session) -> RepositoryResult<()> {
        self.session_repo().insert(session).await
    }

    async fn find_session(&self, token: &SessionToken) -> RepositoryResult<Option<Session>> {
        self.session_repo().get(token).await
    }

    async fn delete_session(&self, token: &SessionToken) -> RepositoryResult<()> {
        self.session_repo().delete(token).await
    }

    async fn delete_sessions_for_user(&self, user_id: UserId) -> RepositoryResult<u64> {
        self.session_repo().delete_for_user(user_id).await
    }
}

#[async_trait]
impl TimerRepository for Store {
    async fn insert_timer(
        &self,
        owner_id: UserId,
        description: &str,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<Timer> {
        self.timer_repo()
            .insert(owner_id, description, started_at)
            .await
    }

    async fn find_timer(&self, id: TimerId) -> RepositoryResult<Option<Timer>> {
        self.timer_repo().get(id).await
    }

    async fn list_timers(
        &self,
        owner_id: UserId,
        state: TimerState,
    ) -> RepositoryResult<Vec<Timer>> {
        self.timer_repo().list_for_owner(owner_id, state).await
    }

    async fn stop_if_active(
        &self,
        id: TimerId,
        stopped_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<Timer>> {
        self.timer_repo().stop_if_active(id, stopped_at).await
    }
}
