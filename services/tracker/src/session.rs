use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Authentication errors from the session provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Anonymous sign-in rejected: {0}")]
    Rejected(String),

    #[error("Authentication backend unreachable: {0}")]
    Unavailable(String),
}

/// An authenticated session with the remote backend
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub uid: String,
    pub anonymous: bool,
    pub created_at: DateTime<Utc>,
}

/// Source of authenticated sessions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// The session already established, if any
    fn current_session(&self) -> Option<Session>;

    /// Establish an anonymous session
    async fn sign_in_anonymously(&self) -> Result<Session, AuthError>;
}

/// In-process provider that mints one anonymous session and keeps it
#[derive(Default)]
pub struct LocalSessionProvider {
    session: RwLock<Option<Session>>,
}

impl LocalSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionProvider for LocalSessionProvider {
    fn current_session(&self) -> Option<Session> {
        self.session.read().clone()
    }

    async fn sign_in_anonymously(&self) -> Result<Session, AuthError> {
        let mut guard = self.session.write();
        if let Some(existing) = guard.as_ref() {
            return Ok(existing.clone());
        }

        let session = Session {
            uid: Uuid::new_v4().to_string(),
            anonymous: true,
            created_at: Utc::now(),
        };
        info!(uid = %session.uid, "Signed in anonymously");
        *guard = Some(session.clone());

        Ok(session)
    }
}
