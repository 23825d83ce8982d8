//! Session tokens: issue, resolve, destroy.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::{Session, SessionToken, UserId};
use crate::repository::{RepositoryError, RepositoryResult, SessionRepository};

/// Collisions on 256-bit random tokens do not happen in practice; the bound
/// only keeps a misbehaving backend from looping forever.
const MAX_TOKEN_ATTEMPTS: usize = 3;

pub struct SessionManager {
    sessions: Arc<dyn SessionRepository>,
    ttl: Option<Duration>,
}

impl SessionManager {
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionRepository>, ttl_hours: Option<u64>) -> Self {
        // Out-of-range values saturate instead of panicking inside chrono.
        let ttl = ttl_hours.map(|h| {
            i64::try_from(h)
                .ok()
                .and_then(Duration::try_hours)
                .unwrap_or(Duration::MAX)
        });
        Self { sessions, ttl }
    }

    /// Issues a fresh token for `user_id`.
    pub async fn create_session(&self, user_id: UserId) -> RepositoryResult<SessionToken> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let session = Session {
                token: generate_token(),
                user_id,
                created_at: Utc::now(),
            };

            match self.sessions.insert_session(&session).await {
                Ok(()) => {
                    debug!(user_id = user_id.value(), token = %session.token.redacted(), "Session created");
                    return Ok(session.token);
                }
                Err(RepositoryError::Duplicate(_)) if attempt < MAX_TOKEN_ATTEMPTS => {
                    warn!("Session token collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Looks up the user behind a token. `None` means unauthenticated.
    ///
    /// Lookup failures are logged and treated as unauthenticated, so this
    /// never errors.
    pub async fn resolve_session(&self, token: &SessionToken) -> Option<UserId> {
        let session = match self.sessions.find_session(token).await {
            Ok(session) => session?,
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                return None;
            }
        };

        if let Some(ttl) = self.ttl
            && Utc::now() - session.created_at > ttl
        {
            debug!(token = %token.redacted(), "Session expired");
            if let Err(e) = self.sessions.delete_session(token).await {
                warn!(error = %e, "Failed to delete expired session");
            }
            return None;
        }

        Some(session.user_id)
    }

    /// Idempotent: destroying an unknown token succeeds.
    pub async fn destroy_session(&self, token: &SessionToken) -> RepositoryResult<()> {
        self.sessions.delete_session(token).await?;
        debug!(token = %token.redacted(), "Session destroyed");
        Ok(())
    }

    pub async fn destroy_all_for_user(&self, user_id: UserId) -> RepositoryResult<u64> {
        self.sessions.delete_sessions_for_user(user_id).await
    }
}

/// 32 random bytes as a 64 character hex string.
#[must_use]
pub fn generate_token() -> SessionToken {
    use rand::Rng;

    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();

    let hex = bytes.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    });
    SessionToken::new(hex)
}
