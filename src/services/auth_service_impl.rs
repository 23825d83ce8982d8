//! Default implementation of the `AuthService` trait.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::domain::{SessionToken, UserId};
use crate::repository::UserRepository;
use crate::services::auth_service::{AuthError, AuthService, LoginResult, UserInfo};
use crate::services::credentials::CredentialStore;
use crate::services::sessions::SessionManager;

pub struct DefaultAuthService {
    users: Arc<dyn UserRepository>,
    credentials: CredentialStore,
    sessions: SessionManager,
}

impl DefaultAuthService {
    #[must_use]
    pub const fn new(
        users: Arc<dyn UserRepository>,
        credentials: CredentialStore,
        sessions: SessionManager,
    ) -> Self {
        Self {
            users,
            credentials,
            sessions,
        }
    }

    async fn open_session(&self, user_id: UserId, username: String) -> Result<LoginResult, AuthError> {
        let session_token = self.sessions.create_session(user_id).await?;
        Ok(LoginResult {
            user_id,
            username,
            session_token,
        })
    }
}

#[async_trait]
impl AuthService for DefaultAuthService {
    async fn signup(&self, username: &str, password: &str) -> Result<LoginResult, AuthError> {
        let user_id = self.credentials.register(username, password).await?;
        self.open_session(user_id, username.trim().to_string()).await
    }

    async fn login(&self, username: &str, password: &str) -> Result<LoginResult, AuthError> {
        let user_id = self.credentials.verify(username, password).await?;
        info!(user_id = user_id.value(), "User logged in");
        self.open_session(user_id, username.trim().to_string()).await
    }

    async fn logout(&self, token: &SessionToken) -> Result<(), AuthError> {
        self.sessions.destroy_session(token).await?;
        Ok(())
    }

    async fn authenticate(&self, token: Option<&SessionToken>) -> Result<UserId, AuthError> {
        let token = token.ok_or(AuthError::Unauthenticated)?;
        self.sessions
            .resolve_session(token)
            .await
            .ok_or(AuthError::Unauthenticated)
    }

    async fn get_user_info(&self, user_id: UserId) -> Result<UserInfo, AuthError> {
        let user = self
            .users
            .find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::Unauthenticated)?;

        Ok(UserInfo {
            id: user.id,
            username: user.username,
        })
    }

    async fn revoke_sessions(&self, username: &str) -> Result<u64, AuthError> {
        let user = self
            .users
            .find_user_by_username(username.trim())
            .await?
            .ok_or_else(|| AuthError::InvalidInput(format!("Unknown user: {username}")))?;

        let removed = self.sessions.destroy_all_for_user(user.id).await?;
        info!(user_id = user.id.value(), removed, "Sessions revoked");
        Ok(removed)
    }
}
