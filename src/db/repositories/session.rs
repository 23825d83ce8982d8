use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use crate::db::millis_to_utc;
use crate::domain::{Session, SessionToken, UserId};
use crate::entities::{prelude::*, sessions};
use crate::repository::{RepositoryError, RepositoryResult};

pub struct SessionRepository {
    conn: DatabaseConnection,
}

impl SessionRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn map_model(model: sessions::Model) -> RepositoryResult<Session> {
        Ok(Session {
            token: SessionToken::new(model.token),
            user_id: UserId::new(model.user_id),
            created_at: millis_to_utc(model.created_at)?,
        })
    }

    pub async fn insert(&self, session: &Session) -> RepositoryResult<()> {
        if self.get(&session.token).await?.is_some() {
            return Err(RepositoryError::Duplicate("session token".to_string()));
        }

        let active = sessions::ActiveModel {
            token: Set(session.token.as_str().to_string()),
            user_id: Set(session.user_id.value()),
            created_at: Set(session.created_at.timestamp_millis()),
        };

        Sessions::insert(active).exec(&self.conn).await?;
        Ok(())
    }

    pub async fn get(&self, token: &SessionToken) -> RepositoryResult<Option<Session>> {
        Sessions::find_by_id(token.as_str().to_string())
            .one(&self.conn)
            .await?
            .map(Self::map_model)
            .transpose()
    }

    pub async fn delete(&self, token: &SessionToken) -> RepositoryResult<()> {
        Sessions::delete_by_id(token.as_str().to_string())
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    pub async fn delete_for_user(&self, user_id: UserId) -> RepositoryResult<u64> {
        let result = Sessions::delete_many()
            .filter(sessions::Column::UserId.eq(user_id.value()))
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected)
    }
}
