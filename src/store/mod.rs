//! Persistence and delivery collaborators
//!
//! The crate owns no storage. Callers inject implementations of these traits;
//! [`memory`] provides in-process versions for tests and single-node setups.

pub mod memory;

pub use memory::{InMemoryMagicLinkStore, InMemorySessionStore, InMemoryUserDirectory};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{MagicLinkToken, Session, User};

/// User records keyed by id, looked up by email
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Persist a new user
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if the email is already registered
    async fn create_user(&self, user: User) -> Result<User, StoreError>;

    async fn get_user_by_id(&self, id: &str) -> Result<Option<User>, StoreError>;

    /// Lookup is case-insensitive on the email
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Replace an existing user record
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no user has this id
    async fn update_user(&self, user: &User) -> Result<(), StoreError>;

    async fn is_username_available(&self, username: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn update_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn delete_session(&self, id: &str) -> Result<(), StoreError>;
    async fn find_sessions_by_user(&self, user_id: &str) -> Result<Vec<Session>, StoreError>;
    /// Remove sessions whose expiry is at or before `now`, returning how many went
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait MagicLinkStore: Send + Sync {
    async fn save_token(&self, token: &MagicLinkToken) -> Result<(), StoreError>;
    async fn get_token(&self, token: &str) -> Result<Option<MagicLinkToken>, StoreError>;
    async fn delete_token(&self, token: &str) -> Result<(), StoreError>;
    /// Remove expired tokens, returning how many went
    ///
    /// Implementations may also drop send-attempt history here, as long as
    /// anything inside the rate-limit window is kept.
    async fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
    /// Number of tokens issued to `email` since `since`, including ones already consumed
    async fn count_recent_attempts(
        &self,
        email: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError>;
}

/// Outbound mail for passwordless login
#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Deliver `link` (which embeds `token`) to `email`
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Delivery` when the message could not be sent
    async fn send_magic_link(&self, email: &str, token: &str, link: &str)
        -> Result<(), StoreError>;
}
