//! Username-only principals
//!
//! Each anonymous principal gets a fresh stable id and a non-expiring session.
//! With a user directory configured, a lightweight `is_anonymous` user record
//! is created under that id so content can be attributed to it from the first
//! write. An upgrade flips that record in place (see [`AnonymousProvider::promote`])
//! and the session keeps pointing at the same id.

use async_trait::async_trait;
use chrono::Utc;
use log::info;
use std::sync::Arc;

use super::{unsupported_credential, AuthProvider, Credential, ProviderKind};
use crate::error::{AuthError, AuthErrorCode, StoreError};
use crate::models::{Session, User, UserStatus, VerifiedIdentity};
use crate::session::SessionManager;
use crate::settings::AnonymousSettings;
use crate::store::UserDirectory;
use crate::utils::logging::LoggingHelper;
use crate::utils::validation::validate_username;

pub const PROVIDER_NAME: &str = "anonymous";

pub struct AnonymousProvider {
    sessions: Arc<SessionManager>,
    users: Option<Arc<dyn UserDirectory>>,
    settings: AnonymousSettings,
}

impl AnonymousProvider {
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        users: Option<Arc<dyn UserDirectory>>,
        settings: AnonymousSettings,
    ) -> Self {
        Self {
            sessions,
            users,
            settings,
        }
    }

    /// Create the anonymous principal and return its identity and session
    ///
    /// # Errors
    ///
    /// Returns `INVALID_REQUEST` for a rejected username, `USERNAME_TAKEN` when
    /// the directory already has it, or a wrapped collaborator error
    pub async fn create_principal(
        &self,
        username: &str,
    ) -> Result<(VerifiedIdentity, Session), AuthError> {
        let username = username.trim();
        validate_username(
            username,
            self.settings.min_username_length,
            self.settings.max_username_length,
        )
        .map_err(AuthError::invalid_request)?;

        if let Some(users) = &self.users {
            let available = users
                .is_username_available(username)
                .await
                .map_err(|e| AuthError::store("Failed to check username", &e))?;
            if !available {
                return Err(AuthError::new(
                    AuthErrorCode::UsernameTaken,
                    format!("Username '{username}' is already taken"),
                ));
            }
        }

        let session = self.sessions.create_anonymous(username).await?;
        let Some(id) = session.principal_id.clone() else {
            return Err(AuthError::configuration(
                "anonymous session was created without a principal id",
            ));
        };

        if let Some(users) = &self.users {
            let mut user = User::new(
                format!("anon-{id}@{}", self.settings.placeholder_email_domain),
                username,
            );
            user.id.clone_from(&id);
            user.is_anonymous = true;

            if let Err(e) = users.create_user(user).await {
                if let Err(rollback) = self.sessions.revoke(&session.id).await {
                    LoggingHelper::log_best_effort_failure(
                        "session rollback",
                        &session.id,
                        &rollback,
                    );
                }
                return Err(AuthError::store("Failed to create anonymous user", &e));
            }
        }

        let mut identity = VerifiedIdentity::new(id, PROVIDER_NAME);
        identity.username = Some(username.to_string());
        identity
            .metadata
            .insert("session_id".to_string(), serde_json::json!(session.id));
        identity
            .metadata
            .insert("is_anonymous".to_string(), serde_json::json!(true));

        info!(
            "Created anonymous principal {} with session {}",
            identity.id, session.id
        );
        Ok((identity, session))
    }

    /// Carry an anonymous principal over to `identity`, returning the user id
    /// the upgraded session continues under
    ///
    /// When `identity` is new to the directory, the anonymous record is
    /// flipped in place (real email, verification, profile) and the principal
    /// id is returned, so nothing attributed to it moves. When `identity`
    /// already belongs to another account, the anonymous record is linked to
    /// that account and its id is returned instead.
    ///
    /// # Errors
    ///
    /// Returns a wrapped collaborator error if the directory cannot be read or updated
    pub async fn promote(
        &self,
        principal_id: &str,
        identity: &VerifiedIdentity,
    ) -> Result<String, AuthError> {
        let Some(users) = &self.users else {
            return Ok(principal_id.to_string());
        };

        let Some(mut record) = users
            .get_user_by_id(principal_id)
            .await
            .map_err(|e| AuthError::store("Failed to load anonymous user", &e))?
        else {
            return Ok(principal_id.to_string());
        };
        if let Some(linked) = &record.linked_user_id {
            return Ok(linked.clone());
        }
        if !record.is_anonymous {
            return Ok(record.id);
        }

        let now = Utc::now();
        let existing = Self::existing_account(&**users, principal_id, identity).await?;
        if let Some(existing) = existing {
            record.linked_user_id = Some(existing.clone());
            record.updated_at = now;
            users
                .update_user(&record)
                .await
                .map_err(|e| AuthError::store("Failed to link anonymous user", &e))?;
            info!("Linked anonymous principal {principal_id} to existing user {existing}");
            return Ok(existing);
        }

        record.is_anonymous = false;
        record.status = UserStatus::Active;
        if let Some(email) = &identity.email {
            record.email.clone_from(email);
            record.email_verified = identity.email_verified;
            record.email_verified_at = identity
                .email_verified
                .then(|| identity.verified_at.unwrap_or(now));
        }
        if identity.display_name.is_some() {
            record.display_name.clone_from(&identity.display_name);
        }
        if identity.avatar_url.is_some() {
            record.avatar_url.clone_from(&identity.avatar_url);
        }
        record.last_login_at = Some(now);
        record.updated_at = now;
        users
            .update_user(&record)
            .await
            .map_err(|e| AuthError::store("Failed to promote anonymous user", &e))?;

        info!(
            "Promoted anonymous principal {principal_id} via {}",
            identity.provider
        );
        Ok(record.id)
    }

    /// Non-anonymous account `identity` already maps to, by id or by email
    async fn existing_account(
        users: &dyn UserDirectory,
        principal_id: &str,
        identity: &VerifiedIdentity,
    ) -> Result<Option<String>, AuthError> {
        let lookup = |e: StoreError| AuthError::store("Failed to look up user", &e);

        if let Some(user) = users.get_user_by_id(&identity.id).await.map_err(lookup)? {
            if !user.is_anonymous {
                return Ok(Some(user.id));
            }
        }
        if let Some(email) = &identity.email {
            if let Some(user) = users.get_user_by_email(email).await.map_err(lookup)? {
                if user.id != principal_id && !user.is_anonymous {
                    return Ok(Some(user.id));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl AuthProvider for AnonymousProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Internal
    }

    async fn authenticate(&self, credential: &Credential) -> Result<VerifiedIdentity, AuthError> {
        match credential {
            Credential::Anonymous { username } => self
                .create_principal(username)
                .await
                .map(|(identity, _)| identity),
            other => Err(unsupported_credential(PROVIDER_NAME, other)),
        }
    }

    fn validate_config(&self) -> Result<(), AuthError> {
        let settings = &self.settings;
        if settings.min_username_length == 0
            || settings.min_username_length > settings.max_username_length
        {
            return Err(AuthError::configuration(
                "anonymous username length bounds are inconsistent",
            ));
        }
        if settings.placeholder_email_domain.trim().is_empty() {
            return Err(AuthError::configuration(
                "anonymous placeholder_email_domain is required",
            ));
        }
        Ok(())
    }
}
