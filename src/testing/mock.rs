//! Mock collaborators for isolated testing
//!
//! Recording and failing stand-ins for the store and mailer traits.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::models::User;
use crate::store::{EmailSender, UserDirectory};

/// One captured magic-link email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMail {
    pub email: String,
    pub token: String,
    pub link: String,
}

/// Mailer that keeps every message instead of sending it
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl RecordingMailer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn last(&self) -> Option<SentMail> {
        self.sent.lock().await.last().cloned()
    }

    pub async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn sent_to(&self, email: &str) -> Vec<SentMail> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|mail| mail.email == email)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send_magic_link(
        &self,
        email: &str,
        token: &str,
        link: &str,
    ) -> Result<(), StoreError> {
        self.sent.lock().await.push(SentMail {
            email: email.to_string(),
            token: token.to_string(),
            link: link.to_string(),
        });
        Ok(())
    }
}

/// Mailer whose every delivery fails
pub struct FailingMailer;

#[async_trait]
impl EmailSender for FailingMailer {
    async fn send_magic_link(
        &self,
        email: &str,
        _token: &str,
        _link: &str,
    ) -> Result<(), StoreError> {
        Err(StoreError::Delivery(format!("mailbox unavailable for {email}")))
    }
}

/// Directory that reads as empty and refuses every write
pub struct RejectingUserDirectory {
    error: StoreError,
}

impl RejectingUserDirectory {
    #[must_use]
    pub fn new(error: StoreError) -> Self {
        Self { error }
    }
}

#[async_trait]
impl UserDirectory for RejectingUserDirectory {
    async fn create_user(&self, _user: User) -> Result<User, StoreError> {
        Err(self.error.clone())
    }

    async fn get_user_by_id(&self, _id: &str) -> Result<Option<User>, StoreError> {
        Ok(None)
    }

    async fn get_user_by_email(&self, _email: &str) -> Result<Option<User>, StoreError> {
        Ok(None)
    }

    async fn update_user(&self, _user: &User) -> Result<(), StoreError> {
        Err(self.error.clone())
    }

    async fn is_username_available(&self, _username: &str) -> Result<bool, StoreError> {
        Ok(true)
    }
}
