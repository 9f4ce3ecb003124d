//! Session Manager - anonymous to authenticated lifecycle
//!
//! Sessions move one way: `anonymous (no expiry)` -> `authenticated (user, expiry)`.
//! The manager enforces that state machine on top of an injected
//! [`SessionStore`]; it assumes nothing about the store's atomicity beyond a
//! single call.

use chrono::{Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

use crate::error::{AuthError, AuthErrorCode, StoreError};
use crate::models::Session;
use crate::store::SessionStore;
use crate::utils::logging::LoggingHelper;

// =============================================================================
// Types and Error Handling
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session expired: {0}")]
    Expired(String),
    #[error("A username is required for anonymous sessions")]
    UsernameRequired,
    #[error("A user id is required for authenticated sessions")]
    UserIdRequired,
    #[error("Session TTL must be positive")]
    InvalidTtl,
    #[error("Session {0} is already authenticated")]
    AlreadyAuthenticated(String),
    #[error("Session {0} is anonymous and cannot be refreshed")]
    NotAuthenticated(String),
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SessionError> for AuthError {
    fn from(err: SessionError) -> Self {
        let code = match &err {
            SessionError::NotFound(_) => AuthErrorCode::SessionNotFound,
            SessionError::Expired(_) => AuthErrorCode::SessionExpired,
            SessionError::UsernameRequired
            | SessionError::UserIdRequired
            | SessionError::InvalidTtl
            | SessionError::AlreadyAuthenticated(_) => AuthErrorCode::InvalidRequest,
            SessionError::NotAuthenticated(_) => AuthErrorCode::RefreshNotAllowed,
            SessionError::Store(_) => AuthErrorCode::ProviderError,
        };
        Self::new(code, err.to_string())
    }
}

// =============================================================================
// Construction
// =============================================================================

pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    authenticated_ttl: Duration,
}

impl SessionManager {
    /// `authenticated_ttl` is applied on migration and refresh
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, authenticated_ttl: Duration) -> Self {
        Self {
            store,
            authenticated_ttl,
        }
    }

    #[must_use]
    pub fn authenticated_ttl(&self) -> Duration {
        self.authenticated_ttl
    }

    // =========================================================================
    // Session Creation
    // =========================================================================

    /// Create a non-expiring anonymous session
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UsernameRequired` for a blank username, or a store error
    pub async fn create_anonymous(&self, username: &str) -> Result<Session, SessionError> {
        if username.trim().is_empty() {
            return Err(SessionError::UsernameRequired);
        }
        let session = Session::anonymous(username);
        self.store.create_session(&session).await?;
        debug!("Created anonymous session {}", session.id);
        Ok(session)
    }

    /// Create an authenticated session for `user_id` lasting `ttl`
    ///
    /// # Errors
    ///
    /// Returns an error for an empty user id, a non-positive TTL, or a store failure
    pub async fn create_authenticated(
        &self,
        user_id: &str,
        ttl: Duration,
    ) -> Result<Session, SessionError> {
        if user_id.is_empty() {
            return Err(SessionError::UserIdRequired);
        }
        if ttl <= Duration::zero() {
            return Err(SessionError::InvalidTtl);
        }
        let session = Session::authenticated(user_id, ttl);
        self.store.create_session(&session).await?;
        debug!("Created authenticated session {} for user {user_id}", session.id);
        Ok(session)
    }

    // =========================================================================
    // Lookup & Validation
    // =========================================================================

    /// Fetch a session without checking expiry
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` if the store has no such session
    pub async fn get(&self, session_id: &str) -> Result<Session, SessionError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Fetch a session and require it to be unexpired
    ///
    /// Anonymous sessions carry no expiry and always validate.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotFound` or `SessionError::Expired`
    pub async fn validate(&self, session_id: &str) -> Result<Session, SessionError> {
        let session = self.get(session_id).await?;
        if session.is_expired_at(Utc::now()) {
            return Err(SessionError::Expired(session_id.to_string()));
        }
        Ok(session)
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    /// Attach `user_id` to an anonymous session, keeping its id
    ///
    /// A session that is already authenticated is rejected and left untouched.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::AlreadyAuthenticated`, `NotFound`, or a store error
    pub async fn migrate_to_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Session, SessionError> {
        if user_id.is_empty() {
            return Err(SessionError::UserIdRequired);
        }
        let mut session = self.get(session_id).await?;
        if !session.is_anonymous || session.user_id.is_some() {
            warn!("Refused to migrate session {session_id}: already authenticated");
            return Err(SessionError::AlreadyAuthenticated(session_id.to_string()));
        }

        let now = Utc::now();
        session.user_id = Some(user_id.to_string());
        session.is_anonymous = false;
        session.expires_at = Some(now + self.authenticated_ttl);
        session.updated_at = now;
        self.store.update_session(&session).await?;

        info!("Migrated anonymous session {session_id} to user {user_id}");
        Ok(session)
    }

    /// Push an authenticated session's expiry out by the configured TTL
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NotAuthenticated` for anonymous sessions and
    /// `SessionError::Expired` once the session has lapsed
    pub async fn refresh(&self, session_id: &str) -> Result<Session, SessionError> {
        let mut session = self.get(session_id).await?;
        if !session.is_authenticated() {
            return Err(SessionError::NotAuthenticated(session_id.to_string()));
        }
        let now = Utc::now();
        if session.is_expired_at(now) {
            return Err(SessionError::Expired(session_id.to_string()));
        }

        session.expires_at = Some(now + self.authenticated_ttl);
        session.updated_at = now;
        self.store.update_session(&session).await?;
        debug!("Refreshed session {session_id}");
        Ok(session)
    }

    // =========================================================================
    // Revocation & Cleanup
    // =========================================================================

    /// Delete a single session
    ///
    /// # Errors
    ///
    /// Returns a store error, including `NotFound` if the session does not exist
    pub async fn revoke(&self, session_id: &str) -> Result<(), SessionError> {
        self.store.delete_session(session_id).await?;
        info!("Revoked session {session_id}");
        Ok(())
    }

    /// Delete every session of `user_id`, continuing past individual failures
    ///
    /// # Errors
    ///
    /// Only the initial lookup can fail; returns how many sessions were deleted
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<usize, SessionError> {
        let sessions = self.store.find_sessions_by_user(user_id).await?;
        let mut revoked = 0;
        for session in &sessions {
            match self.store.delete_session(&session.id).await {
                Ok(()) => revoked += 1,
                Err(e) => LoggingHelper::log_best_effort_failure("session revoke", &session.id, &e),
            }
        }
        info!(
            "Revoked {revoked} of {} sessions for user {user_id}",
            sessions.len()
        );
        Ok(revoked)
    }

    /// Sweep sessions whose expiry has passed
    ///
    /// # Errors
    ///
    /// Returns a store error if the sweep fails
    pub async fn cleanup_expired(&self) -> Result<usize, SessionError> {
        let removed = self.store.delete_expired_sessions(Utc::now()).await?;
        LoggingHelper::log_cleanup("sessions", removed);
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashSet;
    use tokio::sync::Mutex;

    fn manager() -> (SessionManager, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        (SessionManager::new(store.clone(), Duration::hours(24)), store)
    }

    #[tokio::test]
    async fn test_anonymous_session_requires_username() {
        let (manager, _) = manager();
        assert_eq!(
            manager.create_anonymous("  ").await.unwrap_err(),
            SessionError::UsernameRequired
        );

        let session = manager.create_anonymous("river42").await.unwrap();
        assert!(session.is_anonymous);
        assert!(session.expires_at.is_none());
        assert_eq!(manager.validate(&session.id).await.unwrap(), session);
    }

    #[tokio::test]
    async fn test_create_authenticated_validates_input() {
        let (manager, _) = manager();
        assert_eq!(
            manager.create_authenticated("", Duration::hours(1)).await.unwrap_err(),
            SessionError::UserIdRequired
        );
        assert_eq!(
            manager.create_authenticated("u1", Duration::zero()).await.unwrap_err(),
            SessionError::InvalidTtl
        );
        let session = manager
            .create_authenticated("u1", Duration::hours(1))
            .await
            .unwrap();
        assert!(session.is_authenticated());
    }

    #[tokio::test]
    async fn test_migrate_keeps_id_and_sets_expiry() {
        let (manager, _) = manager();
        let anonymous = manager.create_anonymous("river42").await.unwrap();

        let migrated = manager.migrate_to_user(&anonymous.id, "user-7").await.unwrap();
        assert_eq!(migrated.id, anonymous.id);
        assert_eq!(migrated.user_id.as_deref(), Some("user-7"));
        assert!(!migrated.is_anonymous);
        assert!(migrated.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_second_migration_fails_and_keeps_user() {
        let (manager, _) = manager();
        let anonymous = manager.create_anonymous("river42").await.unwrap();
        manager.migrate_to_user(&anonymous.id, "user-7").await.unwrap();

        let err = manager
            .migrate_to_user(&anonymous.id, "intruder")
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::AlreadyAuthenticated(anonymous.id.clone()));

        let stored = manager.get(&anonymous.id).await.unwrap();
        assert_eq!(stored.user_id.as_deref(), Some("user-7"));
    }

    #[tokio::test]
    async fn test_validate_expired_and_missing() {
        let (manager, store) = manager();
        let mut session = Session::authenticated("u1", Duration::hours(1));
        session.expires_at = Some(Utc::now() - Duration::seconds(1));
        store.create_session(&session).await.unwrap();

        let err = manager.validate(&session.id).await.unwrap_err();
        assert_eq!(AuthError::from(err).code, AuthErrorCode::SessionExpired);

        let err = manager.validate("missing").await.unwrap_err();
        assert_eq!(AuthError::from(err).code, AuthErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn test_refresh_rules() {
        let (manager, _) = manager();
        let anonymous = manager.create_anonymous("river42").await.unwrap();
        assert_eq!(
            manager.refresh(&anonymous.id).await.unwrap_err(),
            SessionError::NotAuthenticated(anonymous.id.clone())
        );

        let session = manager
            .create_authenticated("u1", Duration::minutes(5))
            .await
            .unwrap();
        let refreshed = manager.refresh(&session.id).await.unwrap();
        assert!(refreshed.expires_at > session.expires_at);
    }

    #[tokio::test]
    async fn test_revoke_and_cleanup() {
        let (manager, store) = manager();
        let session = manager
            .create_authenticated("u1", Duration::hours(1))
            .await
            .unwrap();
        manager.revoke(&session.id).await.unwrap();
        assert!(manager.revoke(&session.id).await.is_err());

        let mut stale = Session::authenticated("u2", Duration::hours(1));
        stale.expires_at = Some(Utc::now() - Duration::hours(1));
        store.create_session(&stale).await.unwrap();
        manager.create_anonymous("river42").await.unwrap();

        assert_eq!(manager.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
    }

    /// Store whose deletes fail for a chosen set of session ids
    struct FlakyStore {
        inner: InMemorySessionStore,
        fail_ids: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
            self.inner.create_session(session).await
        }
        async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
            self.inner.get_session(id).await
        }
        async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
            self.inner.update_session(session).await
        }
        async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
            if self.fail_ids.lock().await.contains(id) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.delete_session(id).await
        }
        async fn find_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
            self.inner.find_sessions_by_user(user_id).await
        }
        async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.delete_expired_sessions(now).await
        }
    }

    #[tokio::test]
    async fn test_revoke_all_continues_past_failures() {
        let store = Arc::new(FlakyStore {
            inner: InMemorySessionStore::new(),
            fail_ids: Mutex::new(HashSet::new()),
        });
        let manager = SessionManager::new(store.clone(), Duration::hours(1));

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                manager
                    .create_authenticated("u1", Duration::hours(1))
                    .await
                    .unwrap()
                    .id,
            );
        }
        store.fail_ids.lock().await.insert(ids[1].clone());

        assert_eq!(manager.revoke_all_for_user("u1").await.unwrap(), 2);
        assert!(manager.get(&ids[1]).await.is_ok());
        assert!(manager.get(&ids[0]).await.is_err());
    }
}
