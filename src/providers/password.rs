//! Email + password authentication against the user directory
//!
//! Unknown emails and wrong passwords produce the same `INVALID_CREDENTIALS`
//! error, and both pay for one bcrypt verification: a missing account is
//! checked against a throwaway hash at the configured cost. Disabled accounts
//! are reported as such before the password is checked.

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::{unsupported_credential, AuthProvider, Credential, ProviderKind};
use crate::error::{AuthError, AuthErrorCode, StoreError};
use crate::models::{NewUser, User, UserStatus, VerifiedIdentity};
use crate::settings::PasswordSettings;
use crate::store::UserDirectory;
use crate::utils::crypto::generate_nonce;
use crate::utils::logging::LoggingHelper;
use crate::utils::validation::{is_valid_email, normalize_email, validate_password_strength};

pub const PROVIDER_NAME: &str = "password";

/// Valid bcrypt cost factors
pub const BCRYPT_COST_RANGE: std::ops::RangeInclusive<u32> = 10..=31;

pub struct PasswordProvider {
    users: Arc<dyn UserDirectory>,
    settings: PasswordSettings,
    // Verified against when there is no real hash to check
    dummy_hash: OnceCell<String>,
}

impl PasswordProvider {
    #[must_use]
    pub fn new(users: Arc<dyn UserDirectory>, settings: PasswordSettings) -> Self {
        Self {
            users,
            settings,
            dummy_hash: OnceCell::new(),
        }
    }

    /// Hash a password with the configured cost
    ///
    /// # Errors
    ///
    /// Returns `PROVIDER_ERROR` if hashing fails
    pub async fn hash_password(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_string();
        let cost = self.settings.bcrypt_cost;
        tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|e| AuthError::provider(format!("Password hashing task failed: {e}")))?
            .map_err(|e| AuthError::provider(format!("Password hashing failed: {e}")))
    }

    /// Register a new account
    ///
    /// # Errors
    ///
    /// Returns `INVALID_REQUEST` for a malformed email, `WEAK_PASSWORD` when
    /// the policy is not met, `EMAIL_TAKEN` / `USERNAME_TAKEN` on conflicts, or
    /// a wrapped store error
    pub async fn register(&self, new_user: &NewUser) -> Result<VerifiedIdentity, AuthError> {
        let email = normalize_email(&new_user.email);
        if !is_valid_email(&email) {
            return Err(AuthError::invalid_request("Invalid email address"));
        }
        validate_password_strength(&new_user.password, &self.settings.policy).map_err(
            |problems| {
                AuthError::new(
                    AuthErrorCode::WeakPassword,
                    "Password does not meet the password policy",
                )
                .with_details(serde_json::json!({ "requirements": problems }))
            },
        )?;

        let existing = self
            .users
            .get_user_by_email(&email)
            .await
            .map_err(|e| AuthError::store("Failed to look up user", &e))?;
        if existing.is_some() {
            return Err(email_taken());
        }

        let username = match new_user.username.as_deref().map(str::trim) {
            Some(username) if !username.is_empty() => {
                let available = self
                    .users
                    .is_username_available(username)
                    .await
                    .map_err(|e| AuthError::store("Failed to check username", &e))?;
                if !available {
                    return Err(AuthError::new(
                        AuthErrorCode::UsernameTaken,
                        format!("Username '{username}' is already taken"),
                    ));
                }
                username.to_string()
            }
            _ => email.clone(),
        };

        let mut user = User::new(email, username);
        user.display_name.clone_from(&new_user.display_name);
        user.password_hash = Some(self.hash_password(&new_user.password).await?);

        let user = match self.users.create_user(user).await {
            Ok(user) => user,
            Err(StoreError::Conflict(_)) => return Err(email_taken()),
            Err(e) => return Err(AuthError::store("Failed to create user", &e)),
        };

        info!("Registered user {} via password", user.id);
        Ok(user.to_identity(PROVIDER_NAME))
    }

    /// Replace a user's password after checking the current one
    ///
    /// # Errors
    ///
    /// Returns `USER_NOT_FOUND`, `INVALID_CREDENTIALS` when the current password
    /// is wrong, `WEAK_PASSWORD`, or a wrapped store error
    pub async fn change_password(
        &self,
        user_id: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let mut user = self
            .users
            .get_user_by_id(user_id)
            .await
            .map_err(|e| AuthError::store("Failed to load user", &e))?
            .ok_or_else(|| AuthError::new(AuthErrorCode::UserNotFound, "User not found"))?;

        if !self.password_matches(current_password, user.password_hash.as_deref()).await {
            return Err(AuthError::invalid_credentials());
        }
        validate_password_strength(new_password, &self.settings.policy).map_err(|problems| {
            AuthError::new(
                AuthErrorCode::WeakPassword,
                "Password does not meet the password policy",
            )
            .with_details(serde_json::json!({ "requirements": problems }))
        })?;

        user.password_hash = Some(self.hash_password(new_password).await?);
        user.updated_at = Utc::now();
        self.users
            .update_user(&user)
            .await
            .map_err(|e| AuthError::store("Failed to update password", &e))?;
        info!("Password changed for user {user_id}");
        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> Result<VerifiedIdentity, AuthError> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(AuthError::invalid_credentials());
        }

        let Some(mut user) = self
            .users
            .get_user_by_email(&email)
            .await
            .map_err(|e| AuthError::store("Failed to look up user", &e))?
        else {
            self.password_matches(password, None).await;
            return Err(AuthError::invalid_credentials());
        };

        if user.is_disabled() {
            return Err(AuthError::user_disabled());
        }
        if !self.password_matches(password, user.password_hash.as_deref()).await {
            return Err(AuthError::invalid_credentials());
        }
        if self.settings.require_email_verification && !user.email_verified {
            return Err(AuthError::new(
                AuthErrorCode::EmailNotVerified,
                "Email address has not been verified",
            ));
        }

        let now = Utc::now();
        user.last_login_at = Some(now);
        if user.status == UserStatus::Pending {
            user.status = UserStatus::Active;
        }
        user.updated_at = now;
        if let Err(e) = self.users.update_user(&user).await {
            LoggingHelper::log_best_effort_failure("last-login update", &user.id, &e);
        }

        Ok(user.to_identity(PROVIDER_NAME))
    }

    /// Check `password` against `hash`; with no hash the dummy is checked and
    /// the result is always `false`
    async fn password_matches(&self, password: &str, hash: Option<&str>) -> bool {
        let (hash, real) = match hash {
            Some(hash) => (hash, true),
            None => {
                debug!("No password hash to check; verifying against the dummy");
                match self.dummy_hash().await {
                    Some(dummy) => (dummy, false),
                    None => return false,
                }
            }
        };
        let password = password.to_string();
        let hash = hash.to_string();
        match tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await {
            Ok(Ok(matches)) => matches && real,
            Ok(Err(e)) => {
                warn!("Stored password hash could not be checked: {e}");
                false
            }
            Err(e) => {
                warn!("Password verification task failed: {e}");
                false
            }
        }
    }

    async fn dummy_hash(&self) -> Option<&str> {
        let dummy = self
            .dummy_hash
            .get_or_try_init(|| async { self.hash_password(&generate_nonce(16)).await })
            .await;
        match dummy {
            Ok(hash) => Some(hash.as_str()),
            Err(e) => {
                warn!("Could not prepare dummy password hash: {e}");
                None
            }
        }
    }
}

fn email_taken() -> AuthError {
    AuthError::new(
        AuthErrorCode::EmailTaken,
        "An account with this email already exists",
    )
}

#[async_trait]
impl AuthProvider for PasswordProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Internal
    }

    async fn authenticate(&self, credential: &Credential) -> Result<VerifiedIdentity, AuthError> {
        match credential {
            Credential::Password { email, password } => self.login(email, password).await,
            other => Err(unsupported_credential(PROVIDER_NAME, other)),
        }
    }

    fn validate_config(&self) -> Result<(), AuthError> {
        if !BCRYPT_COST_RANGE.contains(&self.settings.bcrypt_cost) {
            return Err(AuthError::configuration(format!(
                "bcrypt cost {} is outside {}..={}",
                self.settings.bcrypt_cost,
                BCRYPT_COST_RANGE.start(),
                BCRYPT_COST_RANGE.end()
            )));
        }
        if self.settings.policy.min_length == 0 {
            return Err(AuthError::configuration(
                "password policy min_length must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryUserDirectory;
    use crate::testing::fixtures::TestFixtures;

    async fn provider_with_user(
        email: &str,
        password: &str,
    ) -> (PasswordProvider, Arc<InMemoryUserDirectory>) {
        let users = Arc::new(InMemoryUserDirectory::new());
        let provider = PasswordProvider::new(users.clone(), TestFixtures::password_settings());
        provider
            .register(&NewUser::new(email, password))
            .await
            .unwrap();
        (provider, users)
    }

    fn login(email: &str, password: &str) -> Credential {
        Credential::Password {
            email: email.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_successful_login_updates_last_login() {
        let (provider, users) = provider_with_user("a@b.com", "Sunrise42").await;

        let identity = provider.authenticate(&login("A@B.com", "Sunrise42")).await.unwrap();
        assert_eq!(identity.provider, "password");
        assert_eq!(identity.email.as_deref(), Some("a@b.com"));

        let user = users.get_user_by_email("a@b.com").await.unwrap().unwrap();
        assert!(user.last_login_at.is_some());
        assert_ne!(user.password_hash.as_deref(), Some("Sunrise42"));
    }

    #[tokio::test]
    async fn test_unknown_email_and_wrong_password_are_indistinguishable() {
        let (provider, _) = provider_with_user("a@b.com", "Sunrise42").await;

        let wrong_password = provider.authenticate(&login("a@b.com", "wrong")).await.unwrap_err();
        let unknown = provider
            .authenticate(&login("nobody@b.com", "Sunrise42"))
            .await
            .unwrap_err();
        let malformed = provider.authenticate(&login("nobody", "x")).await.unwrap_err();

        assert_eq!(wrong_password, unknown);
        assert_eq!(unknown, malformed);
        assert_eq!(unknown.code, AuthErrorCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_unknown_email_pays_for_a_bcrypt_check() {
        let (provider, _) = provider_with_user("a@b.com", "Sunrise42").await;
        assert!(provider.dummy_hash.get().is_none());

        let err = provider
            .authenticate(&login("nobody@b.com", "Sunrise42"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::invalid_credentials());

        // The throwaway hash uses the configured cost, so the work matches a real mismatch
        let dummy = provider.dummy_hash.get().unwrap();
        assert!(dummy.starts_with("$2b$10$"));
        // And nothing ever verifies against it successfully
        assert!(!provider.password_matches("Sunrise42", None).await);
    }

    #[tokio::test]
    async fn test_disabled_account_reports_disabled_even_with_wrong_password() {
        let (provider, users) = provider_with_user("a@b.com", "Sunrise42").await;
        let mut user = users.get_user_by_email("a@b.com").await.unwrap().unwrap();
        user.status = UserStatus::Disabled;
        users.update_user(&user).await.unwrap();

        let err = provider.authenticate(&login("a@b.com", "wrong")).await.unwrap_err();
        assert_eq!(err.code.as_str(), "USER_DISABLED");
    }

    #[tokio::test]
    async fn test_email_verification_policy() {
        let users = Arc::new(InMemoryUserDirectory::new());
        let mut settings = TestFixtures::password_settings();
        settings.require_email_verification = true;
        let provider = PasswordProvider::new(users.clone(), settings);
        provider
            .register(&NewUser::new("a@b.com", "Sunrise42"))
            .await
            .unwrap();

        let err = provider.authenticate(&login("a@b.com", "Sunrise42")).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::EmailNotVerified);

        let mut user = users.get_user_by_email("a@b.com").await.unwrap().unwrap();
        user.email_verified = true;
        users.update_user(&user).await.unwrap();
        assert!(provider.authenticate(&login("a@b.com", "Sunrise42")).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_rules() {
        let (provider, _) = provider_with_user("a@b.com", "Sunrise42").await;

        let weak = provider
            .register(&NewUser::new("c@d.com", "short"))
            .await
            .unwrap_err();
        assert_eq!(weak.code, AuthErrorCode::WeakPassword);
        assert!(weak.details.is_some());

        let taken = provider
            .register(&NewUser::new("A@b.com", "Sunrise42"))
            .await
            .unwrap_err();
        assert_eq!(taken.code, AuthErrorCode::EmailTaken);

        let invalid = provider
            .register(&NewUser::new("nope", "Sunrise42"))
            .await
            .unwrap_err();
        assert_eq!(invalid.code, AuthErrorCode::InvalidRequest);

        let identity = provider
            .register(&NewUser::new("e@f.com", "Sunrise42"))
            .await
            .unwrap();
        assert_eq!(identity.username.as_deref(), Some("e@f.com"));

        let mut named = NewUser::new("g@h.com", "Sunrise42");
        named.username = Some("e@f.com".to_string());
        let err = provider.register(&named).await.unwrap_err();
        assert_eq!(err.code, AuthErrorCode::UsernameTaken);
    }

    #[tokio::test]
    async fn test_change_password() {
        let (provider, users) = provider_with_user("a@b.com", "Sunrise42").await;
        let user = users.get_user_by_email("a@b.com").await.unwrap().unwrap();

        let err = provider
            .change_password(&user.id, "wrong", "Moonrise77")
            .await
            .unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidCredentials);

        provider
            .change_password(&user.id, "Sunrise42", "Moonrise77")
            .await
            .unwrap();
        assert!(provider.authenticate(&login("a@b.com", "Sunrise42")).await.is_err());
        assert!(provider.authenticate(&login("a@b.com", "Moonrise77")).await.is_ok());
    }

    #[test]
    fn test_validate_config_checks_cost() {
        let users = Arc::new(InMemoryUserDirectory::new());
        let mut settings = TestFixtures::password_settings();
        settings.bcrypt_cost = 4;
        let provider = PasswordProvider::new(users, settings);
        let err = provider.validate_config().unwrap_err();
        assert_eq!(err.code, AuthErrorCode::ConfigurationError);
    }

    #[tokio::test]
    async fn test_rejects_other_credentials() {
        let (provider, _) = provider_with_user("a@b.com", "Sunrise42").await;
        let err = provider
            .authenticate(&Credential::Anonymous {
                username: "river42".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidRequest);
    }
}
