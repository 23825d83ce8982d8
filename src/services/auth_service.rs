//! Domain service for signup, login, logout and request authentication.

use serde::Serialize;
use thiserror::Error;

use crate::domain::{SessionToken, UserId};
use crate::repository::RepositoryError;

/// Errors specific to authentication operations.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Username already exists")]
    DuplicateUser,

    /// Deliberately says nothing about whether the username exists.
    #[error("Wrong username or password")]
    InvalidCredentials,

    #[error("Not authenticated")]
    Unauthenticated,

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Outcome of a successful signup or login.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    pub user_id: UserId,
    pub username: String,
    pub session_token: SessionToken,
}

/// The identity attached to an authenticated request.
#[derive(Debug, Clone, Serialize)]
pub struct UserInfo {
    pub id: UserId,
    pub username: String,
}

/// Domain service trait for authentication.
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    /// Registers a user and logs them in.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::DuplicateUser`] if the username is taken and
    /// [`AuthError::InvalidInput`] for an empty username or password.
    async fn signup(&self, username: &str, password: &str) -> Result<LoginResult, AuthError>;

    /// Verifies credentials and opens a new session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] if login fails.
    async fn login(&self, username: &str, password: &str) -> Result<LoginResult, AuthError>;

    /// Ends a session. Unknown tokens are ignored.
    async fn logout(&self, token: &SessionToken) -> Result<(), AuthError>;

    /// Resolves the credential presented with a request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] when the token is missing,
    /// unknown, expired or logged out.
    async fn authenticate(&self, token: Option<&SessionToken>) -> Result<UserId, AuthError>;

    async fn get_user_info(&self, user_id: UserId) -> Result<UserInfo, AuthError>;

    /// Logs a user out everywhere. Returns the number of sessions removed.
    async fn revoke_sessions(&self, username: &str) -> Result<u64, AuthError>;
}
