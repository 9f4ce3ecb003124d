// In-process collaborator implementations backed by tokio RwLocks

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{MagicLinkStore, SessionStore, UserDirectory};
use crate::error::StoreError;
use crate::models::{MagicLinkToken, Session, User};
use crate::utils::validation::normalize_email;

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn create_user(&self, user: User) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        let email = normalize_email(&user.email);
        if users.values().any(|u| normalize_email(&u.email) == email) {
            return Err(StoreError::Conflict(format!("email {email}")));
        }
        if users.contains_key(&user.id) {
            return Err(StoreError::Conflict(format!("user id {}", user.id)));
        }
        users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = normalize_email(email);
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| normalize_email(&u.email) == email)
            .cloned())
    }

    async fn update_user(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("user {}", user.id))),
        }
    }

    async fn is_username_available(&self, username: &str) -> Result<bool, StoreError> {
        let wanted = username.to_lowercase();
        Ok(!self
            .users
            .read()
            .await
            .values()
            .any(|u| u.username.to_lowercase() == wanted))
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!("session {}", session.id)));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update_session(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("session {}", session.id))),
        }
    }

    async fn delete_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    async fn find_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired_at(now));
        Ok(before - sessions.len())
    }
}

/// Default horizon for send attempts kept for rate limiting
pub const DEFAULT_ATTEMPT_RETENTION_HOURS: i64 = 24;

pub struct InMemoryMagicLinkStore {
    tokens: RwLock<HashMap<String, MagicLinkToken>>,
    // (normalized email, issued at); survives token deletion so consumed links still count
    attempts: RwLock<Vec<(String, DateTime<Utc>)>>,
    attempt_retention: Duration,
}

impl Default for InMemoryMagicLinkStore {
    fn default() -> Self {
        Self::with_attempt_retention(Duration::hours(DEFAULT_ATTEMPT_RETENTION_HOURS))
    }
}

impl InMemoryMagicLinkStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep send attempts for `retention`; must outlast the rate-limit window
    #[must_use]
    pub fn with_attempt_retention(retention: Duration) -> Self {
        Self {
            tokens: RwLock::default(),
            attempts: RwLock::default(),
            attempt_retention: retention,
        }
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}

#[async_trait]
impl MagicLinkStore for InMemoryMagicLinkStore {
    async fn save_token(&self, token: &MagicLinkToken) -> Result<(), StoreError> {
        let is_new = self
            .tokens
            .write()
            .await
            .insert(token.token.clone(), token.clone())
            .is_none();
        if is_new {
            self.attempts
                .write()
                .await
                .push((normalize_email(&token.email), token.created_at));
        }
        Ok(())
    }

    async fn get_token(&self, token: &str) -> Result<Option<MagicLinkToken>, StoreError> {
        Ok(self.tokens.read().await.get(token).cloned())
    }

    async fn delete_token(&self, token: &str) -> Result<(), StoreError> {
        self.tokens.write().await.remove(token);
        Ok(())
    }

    async fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tokens = self.tokens.write().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired_at(now));

        let horizon = now - self.attempt_retention;
        self.attempts.write().await.retain(|(_, at)| *at >= horizon);

        Ok(before - tokens.len())
    }

    async fn count_recent_attempts(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let email = normalize_email(email);
        let count = self
            .attempts
            .read()
            .await
            .iter()
            .filter(|(e, at)| *e == email && *at >= since)
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}
