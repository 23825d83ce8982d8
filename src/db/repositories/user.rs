use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};

use crate::db::millis_to_utc;
use crate::domain::{User, UserId};
use crate::entities::users;
use crate::repository::{RepositoryError, RepositoryResult};

pub struct UserRepository {
    conn: DatabaseConnection,
}

impl UserRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    fn map_model(model: users::Model) -> RepositoryResult<User> {
        Ok(User {
            id: UserId::new(model.id),
            username: model.username,
            password_hash: model.password_hash,
            created_at: millis_to_utc(model.created_at)?,
        })
    }

    pub async fn create(&self, username: &str, password_hash: &str) -> RepositoryResult<User> {
        if self.get_by_username(username).await?.is_some() {
            return Err(RepositoryError::Duplicate(format!(
                "username '{username}' already exists"
            )));
        }

        let active = users::ActiveModel {
            username: Set(username.to_string()),
            password_hash: Set(password_hash.to_string()),
            created_at: Set(Utc::now().timestamp_millis()),
            ..Default::default()
        };

        // The unique index still catches a concurrent signup racing past the check above.
        let model = active.insert(&self.conn).await?;
        Self::map_model(model)
    }

    pub async fn get_by_username(&self, username: &str) -> RepositoryResult<Option<User>> {
        users::Entity::find()
            .filter(users::Column::Username.eq(username))
            .one(&self.conn)
            .await?
            .map(Self::map_model)
            .transpose()
    }

    pub async fn get_by_id(&self, id: UserId) -> RepositoryResult<Option<User>> {
        users::Entity::find_by_id(id.value())
            .one(&self.conn)
            .await?
            .map(Self::map_model)
            .transpose()
    }
}
