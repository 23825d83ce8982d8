//! Password hashing and user registration.

use anyhow::Context;
use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task;
use tracing::info;

use crate::config::SecurityConfig;
use crate::domain::UserId;
use crate::repository::{RepositoryError, UserRepository};
use crate::services::auth_service::AuthError;

const MAX_USERNAME_LEN: usize = 64;

/// Verified against when the username does not exist, so both failure paths
/// cost one Argon2 run.
const DUMMY_PASSWORD: &str = "ticktrack-dummy-password";

pub struct CredentialStore {
    users: Arc<dyn UserRepository>,
    security: SecurityConfig,
    dummy_hash: OnceCell<String>,
}

impl CredentialStore {
    #[must_use]
    pub fn new(users: Arc<dyn UserRepository>, security: SecurityConfig) -> Self {
        Self {
            users,
            security,
            dummy_hash: OnceCell::new(),
        }
    }

    /// Creates a user with a hashed password.
    pub async fn register(&self, username: &str, password: &str) -> Result<UserId, AuthError> {
        let username = normalize_username(username)?;
        if password.is_empty() {
            return Err(AuthError::InvalidInput("Password is required".to_string()));
        }

        let password_hash = self.hash(password).await?;

        let user = self
            .users
            .create_user(&username, &password_hash)
            .await
            .map_err(|e| match e {
                RepositoryError::Duplicate(_) => AuthError::DuplicateUser,
                other => AuthError::Repository(other),
            })?;

        info!(user_id = user.id.value(), username = %user.username, "User registered");
        Ok(user.id)
    }

    /// Checks a username/password pair.
    ///
    /// An unknown username and a wrong password both yield
    /// [`AuthError::InvalidCredentials`].
    pub async fn verify(&self, username: &str, password: &str) -> Result<UserId, AuthError> {
        let username = username.trim();
        let user = if username.is_empty() {
            None
        } else {
            self.users.find_user_by_username(username).await?
        };

        let Some(user) = user else {
            let dummy = self.dummy_hash().await?;
            let _ = check_password(password, &dummy).await?;
            return Err(AuthError::InvalidCredentials);
        };

        if password.is_empty() || !check_password(password, &user.password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(user.id)
    }

    async fn hash(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_string();
        let config = self.security.clone();
        let hash = task::spawn_blocking(move || hash_password(&password, &config))
            .await
            .context("Password hashing task panicked")??;
        Ok(hash)
    }

    async fn dummy_hash(&self) -> Result<String, AuthError> {
        self.dummy_hash
            .get_or_try_init(|| self.hash(DUMMY_PASSWORD))
            .await
            .cloned()
    }
}

fn normalize_username(username: &str) -> Result<String, AuthError> {
    let username = username.trim();

    if username.is_empty() {
        return Err(AuthError::InvalidInput("Username is required".to_string()));
    }

    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(AuthError::InvalidInput(format!(
            "Username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }

    Ok(username.to_string())
}

/// Hash a password using Argon2id with the configured cost parameters.
pub fn hash_password(password: &str, config: &SecurityConfig) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);

    let params = Params::new(
        config.argon2_memory_cost_kib,
        config.argon2_time_cost,
        config.argon2_parallelism,
        None,
    )
    .map_err(|e| anyhow::anyhow!("Invalid Argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash password: {e}"))?;

    Ok(hash.to_string())
}

/// Verification runs on the blocking pool: Argon2 is CPU-bound.
/// Parameters are read from the stored PHC string.
async fn check_password(password: &str, password_hash: &str) -> anyhow::Result<bool> {
    let password = password.to_string();
    let password_hash = password_hash.to_string();

    task::spawn_blocking(move || {
        let parsed_hash = PasswordHash::new(&password_hash)
            .map_err(|e| anyhow::anyhow!("Invalid password hash format: {e}"))?;

        Ok::<bool, anyhow::Error>(
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed_hash)
                .is_ok(),
        )
    })
    .await
    .context("Password verification task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn fast_security() -> SecurityConfig {
        SecurityConfig {
            argon2_memory_cost_kib: 1024,
            argon2_time_cost: 1,
            argon2_parallelism: 1,
            session_ttl_hours: None,
        }
    }

    fn credentials() -> (Arc<MemoryStore>, CredentialStore) {
        let store = Arc::new(MemoryStore::new());
        let creds = CredentialStore::new(store.clone(), fast_security());
        (store, creds)
    }

    #[tokio::test]
    async fn register_then_verify() {
        let (_, creds) = credentials();
        let id = creds.register("alice", "secret1").await.unwrap();
        assert_eq!(creds.verify("alice", "secret1").await.unwrap(), id);
    }

    #[tokio::test]
    async fn plaintext_is_never_stored() {
        let (store, creds) = credentials();
        creds.register("alice", "secret1").await.unwrap();

        let user = store.find_user_by_username("alice").await.unwrap().unwrap();
        assert_ne!(user.password_hash, "secret1");
        assert!(user.password_hash.starts_with("$argon2id$"));
    }

    #[tokio::test]
    async fn duplicate_username_fails() {
        let (_, creds) = credentials();
        creds.register("alice", "secret1").await.unwrap();
        let err = creds.register("alice", "other").await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicateUser));
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let (_, creds) = credentials();
        creds.register("alice", "secret1").await.unwrap();

        let wrong = creds.verify("alice", "nope").await.unwrap_err();
        let missing = creds.verify("bob", "secret1").await.unwrap_err();

        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert!(matches!(missing, AuthError::InvalidCredentials));
        assert_eq!(wrong.to_string(), missing.to_string());
    }

    #[tokio::test]
    async fn empty_fields_are_invalid_input() {
        let (_, creds) = credentials();
        assert!(matches!(
            creds.register("  ", "pw").await.unwrap_err(),
            AuthError::InvalidInput(_)
        ));
        assert!(matches!(
            creds.register("alice", "").await.unwrap_err(),
            AuthError::InvalidInput(_)
        ));
    }
}
