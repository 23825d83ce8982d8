use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use tracing::debug;

use crate::db::millis_to_utc;
use crate::domain::{Timer, TimerId, TimerState, UserId};
use crate::entities::{prelude::*, timers};
use crate::repository::{RepositoryError, RepositoryResult};

/// Repository for timer rows
pub struct TimerRepository {
    conn: DatabaseConnection,
}

impl TimerRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    // ========================================================================
    // Model Conversion Helpers
    // ========================================================================

    fn map_model(model: timers::Model) -> RepositoryResult<Timer> {
        let state = model
            .state
            .parse::<TimerState>()
            .map_err(RepositoryError::Unavailable)?;

        let stopped_at = model.stopped_at.map(millis_to_utc).transpose()?;

        Ok(Timer {
            id: TimerId::new(i64::from(model.id)),
            owner_id: UserId::new(model.owner_id),
            description: model.description,
            started_at: millis_to_utc(model.started_at)?,
            stopped_at,
            state,
        })
    }

    /// Row ids are `INTEGER` in SQLite; anything outside that range cannot exist.
    fn row_id(id: TimerId) -> Option<i32> {
        i32::try_from(id.value()).ok()
    }

    // ========================================================================
    // Timer Operations
    // ========================================================================

    pub async fn insert(
        &self,
        owner_id: UserId,
        description: &str,
        started_at: DateTime<Utc>,
    ) -> RepositoryResult<Timer> {
        let active = timers::ActiveModel {
            owner_id: Set(owner_id.value()),
            description: Set(description.to_string()),
            started_at: Set(started_at.timestamp_millis()),
            stopped_at: Set(None),
            state: Set(TimerState::Active.as_str().to_string()),
            ..Default::default()
        };

        let model = active.insert(&self.conn).await?;
        debug!(timer_id = model.id, owner_id = owner_id.value(), "Timer created");
        Self::map_model(model)
    }

    pub async fn get(&self, id: TimerId) -> RepositoryResult<Option<Timer>> {
        let Some(row_id) = Self::row_id(id) else {
            return Ok(None);
        };

        Timers::find_by_id(row_id)
            .one(&self.conn)
            .await?
            .map(Self::map_model)
            .transpose()
    }

    pub async fn list_for_owner(
        &self,
        owner_id: UserId,
        state: TimerState,
    ) -> RepositoryResult<Vec<Timer>> {
        Timers::find()
            .filter(timers::Column::OwnerId.eq(owner_id.value()))
            .filter(timers::Column::State.eq(state.as_str()))
            .order_by_asc(timers::Column::Id)
            .all(&self.conn)
            .await?
            .into_iter()
            .map(Self::map_model)
            .collect()
    }

    /// Conditional update: only a row still in the active state is touched,
    /// so exactly one concurrent caller writes `stopped_at`.
    pub async fn stop_if_active(
        &self,
        id: TimerId,
        stopped_at: DateTime<Utc>,
    ) -> RepositoryResult<Option<Timer>> {
        let Some(row_id) = Self::row_id(id) else {
            return Ok(None);
        };

        let result = Timers::update_many()
            .col_expr(
                timers::Column::State,
                Expr::value(TimerState::Stopped.as_str()),
            )
            .col_expr(
                timers::Column::StoppedAt,
                Expr::value(stopped_at.timestamp_millis()),
            )
            .filter(timers::Column::Id.eq(row_id))
            .filter(timers::Column::State.eq(TimerState::Active.as_str()))
            .exec(&self.conn)
            .await?;

        debug!(
            timer_id = row_id,
            transitioned = result.rows_affected == 1,
            "Stop attempted"
        );

        self.get(id).await
    }
}
