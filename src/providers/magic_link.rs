//! Passwordless login through single-use emailed links
//!
//! `MagicLinkSend` never yields an identity: on success it returns the
//! non-fatal `MAGIC_LINK_SENT` error. `MagicLinkVerify` redeems the token.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;

use super::{unsupported_credential, AuthProvider, Credential, ProviderKind};
use crate::error::{AuthError, AuthErrorCode};
use crate::models::{MagicLinkToken, User, UserStatus, VerifiedIdentity};
use crate::settings::MagicLinkSettings;
use crate::store::{EmailSender, MagicLinkStore, UserDirectory};
use crate::utils::crypto::generate_nonce;
use crate::utils::logging::LoggingHelper;
use crate::utils::validation::{is_valid_email, normalize_email};

pub const PROVIDER_NAME: &str = "magic_link";

/// Tokens shorter than this are too guessable
const MIN_TOKEN_BYTES: usize = 16;

pub struct MagicLinkProvider {
    users: Arc<dyn UserDirectory>,
    tokens: Arc<dyn MagicLinkStore>,
    mailer: Arc<dyn EmailSender>,
    settings: MagicLinkSettings,
}

impl MagicLinkProvider {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserDirectory>,
        tokens: Arc<dyn MagicLinkStore>,
        mailer: Arc<dyn EmailSender>,
        settings: MagicLinkSettings,
    ) -> Self {
        Self {
            users,
            tokens,
            mailer,
            settings,
        }
    }

    fn token_ttl(&self) -> Duration {
        Duration::minutes(i64::try_from(self.settings.ttl_minutes).unwrap_or(15))
    }

    fn rate_window(&self) -> Duration {
        Duration::minutes(i64::try_from(self.settings.rate_window_minutes).unwrap_or(60))
    }

    /// Link embedding the url-encoded token
    #[must_use]
    pub fn build_link(&self, token: &str) -> String {
        let separator = if self.settings.link_base_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{separator}token={}",
            self.settings.link_base_url,
            urlencoding::encode(token)
        )
    }

    /// Issue and mail a login link
    ///
    /// # Errors
    ///
    /// Always returns an error: `MAGIC_LINK_SENT` on success, otherwise
    /// `INVALID_REQUEST`, `RATE_LIMITED`, `USER_DISABLED` or `PROVIDER_ERROR`
    pub async fn send(&self, email: &str) -> AuthError {
        match self.try_send(email).await {
            Ok(sent) => sent,
            Err(e) => e,
        }
    }

    async fn try_send(&self, email: &str) -> Result<AuthError, AuthError> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(AuthError::invalid_request("Invalid email address"));
        }

        // Counted from the store on every call; a cached count would undercount
        let since = Utc::now() - self.rate_window();
        let attempts = self
            .tokens
            .count_recent_attempts(&email, since)
            .await
            .map_err(|e| AuthError::store("Failed to count recent attempts", &e))?;
        if attempts >= self.settings.max_attempts {
            warn!("Magic link rate limit hit: {attempts} sends within window");
            return Err(AuthError::new(
                AuthErrorCode::RateLimited,
                "Too many magic link requests, try again later",
            )
            .with_details(serde_json::json!({
                "retry_after_minutes": self.settings.rate_window_minutes,
            })));
        }

        let user = self.find_or_create_pending_user(&email).await?;
        if user.is_disabled() {
            return Err(AuthError::user_disabled());
        }

        let token = MagicLinkToken::new(
            generate_nonce(self.settings.token_bytes),
            email.clone(),
            Some(user.id.clone()),
            self.token_ttl(),
        );
        self.tokens
            .save_token(&token)
            .await
            .map_err(|e| AuthError::store("Failed to save magic link token", &e))?;

        let link = self.build_link(&token.token);
        if let Err(e) = self.mailer.send_magic_link(&email, &token.token, &link).await {
            // An undelivered token must not stay redeemable
            if let Err(cleanup) = self.tokens.delete_token(&token.token).await {
                LoggingHelper::log_best_effort_failure(
                    "magic link token delete",
                    &user.id,
                    &cleanup,
                );
            }
            return Err(AuthError::provider(format!("Failed to send magic link: {e}")));
        }

        info!("Magic link sent for user {}", user.id);
        Ok(AuthError::new(
            AuthErrorCode::MagicLinkSent,
            "Check your email for a login link",
        )
        .with_details(serde_json::json!({
            "email": email,
            "expires_at": token.expires_at,
        })))
    }

    async fn find_or_create_pending_user(&self, email: &str) -> Result<User, AuthError> {
        if let Some(user) = self
            .users
            .get_user_by_email(email)
            .await
            .map_err(|e| AuthError::store("Failed to look up user", &e))?
        {
            return Ok(user);
        }

        let mut user = User::new(email, email);
        user.status = UserStatus::Pending;
        let user = self
            .users
            .create_user(user)
            .await
            .map_err(|e| AuthError::store("Failed to create pending user", &e))?;
        debug!("Created pending user {} for magic link", user.id);
        Ok(user)
    }

    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let invalid = || {
            AuthError::new(
                AuthErrorCode::TokenInvalid,
                "Invalid or already used login link",
            )
        };

        let mut record = self
            .tokens
            .get_token(token)
            .await
            .map_err(|e| AuthError::store("Failed to load magic link token", &e))?
            .ok_or_else(invalid)?;

        if record.used {
            return Err(invalid());
        }
        if record.is_expired_at(Utc::now()) {
            if let Err(e) = self.tokens.delete_token(token).await {
                LoggingHelper::log_best_effort_failure("expired token delete", &record.email, &e);
            }
            return Err(AuthError::new(AuthErrorCode::TokenExpired, "Login link has expired"));
        }

        // Used-but-undeleted tokens stay unredeemable, so the two calls need not be atomic
        record.mark_used();
        self.tokens
            .save_token(&record)
            .await
            .map_err(|e| AuthError::store("Failed to consume magic link token", &e))?;
        if let Err(e) = self.tokens.delete_token(token).await {
            LoggingHelper::log_best_effort_failure("used token delete", &record.email, &e);
        }

        let user = match &record.user_id {
            Some(user_id) => self.users.get_user_by_id(user_id).await,
            None => self.users.get_user_by_email(&record.email).await,
        }
        .map_err(|e| AuthError::store("Failed to load user", &e))?
        .ok_or_else(|| AuthError::new(AuthErrorCode::UserNotFound, "User not found"))?;

        if user.is_disabled() {
            return Err(AuthError::user_disabled());
        }

        let mut user = user;
        let now = Utc::now();
        if user.status == UserStatus::Pending {
            user.status = UserStatus::Active;
            info!("Activated pending user {}", user.id);
        }
        if !user.email_verified {
            user.email_verified = true;
            user.email_verified_at = Some(now);
        }
        user.last_login_at = Some(now);
        user.updated_at = now;
        self.users
            .update_user(&user)
            .await
            .map_err(|e| AuthError::store("Failed to update user", &e))?;

        Ok(user.to_identity(PROVIDER_NAME))
    }

    /// Sweep expired tokens
    ///
    /// # Errors
    ///
    /// Returns a wrapped store error if the sweep fails
    pub async fn cleanup_expired_tokens(&self) -> Result<usize, AuthError> {
        let removed = self
            .tokens
            .delete_expired_tokens(Utc::now())
            .await
            .map_err(|e| AuthError::store("Failed to delete expired tokens", &e))?;
        LoggingHelper::log_cleanup("magic link tokens", removed);
        Ok(removed)
    }
}

#[async_trait]
impl AuthProvider for MagicLinkProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Internal
    }

    async fn authenticate(&self, credential: &Credential) -> Result<VerifiedIdentity, AuthError> {
        match credential {
            Credential::MagicLinkSend { email } => Err(self.send(email).await),
            Credential::MagicLinkVerify { token } => self.verify(token).await,
            other => Err(unsupported_credential(PROVIDER_NAME, other)),
        }
    }

    fn validate_config(&self) -> Result<(), AuthError> {
        if self.settings.token_bytes < MIN_TOKEN_BYTES {
            return Err(AuthError::configuration(format!(
                "magic link tokens need at least {MIN_TOKEN_BYTES} bytes"
            )));
        }
        if self.settings.ttl_minutes == 0 || self.settings.max_attempts == 0 {
            return Err(AuthError::configuration(
                "magic link ttl_minutes and max_attempts must be positive",
            ));
        }
        url::Url::parse(&self.settings.link_base_url).map_err(|e| {
            AuthError::configuration(format!("Invalid magic link base URL: {e}"))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryMagicLinkStore, InMemoryUserDirectory};
    use crate::testing::fixtures::TestFixtures;
    use crate::testing::mock::{FailingMailer, RecordingMailer};

    struct Harness {
        provider: MagicLinkProvider,
        users: Arc<InMemoryUserDirectory>,
        tokens: Arc<InMemoryMagicLinkStore>,
        mailer: Arc<RecordingMailer>,
    }

    fn harness() -> Harness {
        let users = Arc::new(InMemoryUserDirectory::new());
        let tokens = Arc::new(InMemoryMagicLinkStore::new());
        let mailer = Arc::new(RecordingMailer::new());
        let provider = MagicLinkProvider::new(
            users.clone(),
            tokens.clone(),
            mailer.clone(),
            MagicLinkSettings::default(),
        );
        Harness {
            provider,
            users,
            tokens,
            mailer,
        }
    }

    fn send(email: &str) -> Credential {
        Credential::MagicLinkSend {
            email: email.to_string(),
        }
    }

    fn verify(token: &str) -> Credential {
        Credential::MagicLinkVerify {
            token: token.to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_returns_link_sent_and_creates_pending_user() {
        let h = harness();
        let err = h.provider.authenticate(&send("New@Example.com")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::MagicLinkSent);

        let user = h.users.get_user_by_email("new@example.com").await.unwrap().unwrap();
        assert_eq!(user.status, UserStatus::Pending);

        let sent = h.mailer.last().await.unwrap();
        assert_eq!(sent.email, "new@example.com");
        assert!(sent.link.starts_with("http://localhost:3000/auth/magic-link?token="));
        assert_eq!(h.tokens.len().await, 1);
    }

    #[tokio::test]
    async fn test_verify_activates_user_and_is_single_use() {
        let h = harness();
        h.provider.authenticate(&send("a@b.com")).await.unwrap_err();
        let token = h.mailer.last().await.unwrap().token;

        let identity = h.provider.authenticate(&verify(&token)).await.unwrap();
        assert_eq!(identity.provider, "magic_link");
        assert!(identity.email_verified);

        let user = h.users.get_user_by_email("a@b.com").await.unwrap().unwrap();
        assert_eq!(user.status, UserStatus::Active);
        assert!(user.last_login_at.is_some());

        let again = h.provider.authenticate(&verify(&token)).await.unwrap_err();
        assert_eq!(again.code, AuthErrorCode::TokenInvalid);
    }

    #[tokio::test]
    async fn test_used_but_undeleted_token_is_rejected() {
        let h = harness();
        let mut record = MagicLinkToken::new(
            "leftover".to_string(),
            "a@b.com".to_string(),
            None,
            Duration::minutes(15),
        );
        record.mark_used();
        h.tokens.save_token(&record).await.unwrap();

        let err = h.provider.authenticate(&verify("leftover")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::TokenInvalid);
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected_and_removed() {
        let h = harness();
        let mut record = MagicLinkToken::new(
            "stale".to_string(),
            "a@b.com".to_string(),
            None,
            Duration::minutes(15),
        );
        record.expires_at = Utc::now() - Duration::minutes(1);
        h.tokens.save_token(&record).await.unwrap();

        let err = h.provider.authenticate(&verify("stale")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::TokenExpired);
        assert!(h.tokens.get_token("stale").await.unwrap().is_none());

        let err = h.provider.authenticate(&verify("stale")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::TokenInvalid);
    }

    #[tokio::test]
    async fn test_rate_limit_after_max_attempts() {
        let h = harness();
        for _ in 0..3 {
            let err = h.provider.authenticate(&send("a@b.com")).await.unwrap_err();
            assert_eq!(err.code, AuthErrorCode::MagicLinkSent);
        }
        let err = h.provider.authenticate(&send("a@b.com")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::RateLimited);
        assert_eq!(h.mailer.count().await, 3);

        // Other addresses are unaffected
        let err = h.provider.authenticate(&send("c@d.com")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::MagicLinkSent);
    }

    #[tokio::test]
    async fn test_delivery_failure_deletes_token() {
        let users = Arc::new(InMemoryUserDirectory::new());
        let tokens = Arc::new(InMemoryMagicLinkStore::new());
        let provider = MagicLinkProvider::new(
            users,
            tokens.clone(),
            Arc::new(FailingMailer),
            MagicLinkSettings::default(),
        );

        let err = provider.authenticate(&send("a@b.com")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ProviderError);
        assert!(tokens.is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_email_and_disabled_user() {
        let h = harness();
        let err = h.provider.authenticate(&send("not-an-email")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidRequest);

        let mut user = TestFixtures::user("blocked@b.com");
        user.status = UserStatus::Disabled;
        h.users.create_user(user).await.unwrap();
        let err = h.provider.authenticate(&send("blocked@b.com")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::UserDisabled);
        assert_eq!(h.mailer.count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired_tokens() {
        let h = harness();
        h.provider.authenticate(&send("a@b.com")).await.unwrap_err();
        let mut stale = MagicLinkToken::new(
            "stale".to_string(),
            "b@c.com".to_string(),
            None,
            Duration::minutes(15),
        );
        stale.expires_at = Utc::now() - Duration::seconds(5);
        h.tokens.save_token(&stale).await.unwrap();

        assert_eq!(h.provider.cleanup_expired_tokens().await.unwrap(), 1);
        assert_eq!(h.tokens.len().await, 1);
    }

    #[test]
    fn test_link_building_and_config() {
        let h = harness();
        assert_eq!(
            h.provider.build_link("a+b/c"),
            "http://localhost:3000/auth/magic-link?token=a%2Bb%2Fc"
        );
        assert!(h.provider.validate_config().is_ok());

        let bad = MagicLinkProvider::new(
            h.users.clone(),
            h.tokens.clone(),
            h.mailer.clone(),
            MagicLinkSettings {
                token_bytes: 4,
                ..MagicLinkSettings::default()
            },
        );
        assert_eq!(
            bad.validate_config().unwrap_err().code,
            AuthErrorCode::ConfigurationError
        );
    }
}
