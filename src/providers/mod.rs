//! Authentication providers
//!
//! Every strategy turns a provider-specific [`Credential`] into a
//! [`VerifiedIdentity`] behind the one [`AuthProvider`] contract, so the
//! registry can dispatch without knowing which strategy it holds.
//!
//! - [`oauth`] - federated authorization-code and ID-token login
//! - [`password`] - email + password against the user directory
//! - [`magic_link`] - passwordless email links
//! - [`anonymous`] - username-only principals backed by a non-expiring session

pub mod anonymous;
pub mod magic_link;
pub mod oauth;
pub mod password;

pub use anonymous::AnonymousProvider;
pub use magic_link::MagicLinkProvider;
pub use oauth::OAuthProvider;
pub use password::PasswordProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AuthError;
use crate::models::VerifiedIdentity;

/// Whether a provider delegates identity to a third party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Federated,
    Internal,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Federated => "federated",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific credential payload
///
/// Deserializes from a `type`-tagged JSON object, e.g.
/// `{"type": "password", "email": "...", "password": "..."}`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Authorization code returned to the OAuth callback
    AuthorizationCode { code: String },
    /// ID token obtained by a non-redirect client
    IdToken { id_token: String },
    Password { email: String, password: String },
    MagicLinkSend { email: String },
    MagicLinkVerify { token: String },
    Anonymous { username: String },
    /// Payload for providers registered outside this crate
    Custom { payload: serde_json::Value },
}

impl Credential {
    /// Short label for logs and error messages
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthorizationCode { .. } => "authorization_code",
            Self::IdToken { .. } => "id_token",
            Self::Password { .. } => "password",
            Self::MagicLinkSend { .. } => "magic_link_send",
            Self::MagicLinkVerify { .. } => "magic_link_verify",
            Self::Anonymous { .. } => "anonymous",
            Self::Custom { .. } => "custom",
        }
    }
}

// Secrets stay out of Debug output
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { email, .. } => f
                .debug_struct("Password")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            Self::MagicLinkSend { email } => {
                f.debug_struct("MagicLinkSend").field("email", email).finish()
            }
            Self::Anonymous { username } => {
                f.debug_struct("Anonymous").field("username", username).finish()
            }
            other => f
                .debug_struct("Credential")
                .field("kind", &other.kind())
                .finish_non_exhaustive(),
        }
    }
}

/// Authentication strategy contract
///
/// Implementations must be safe to share across request-handling tasks; the
/// registry stores them as `Arc<dyn AuthProvider>`.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Stable registry key (e.g. "google", "password")
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Turn a credential into a verified identity
    ///
    /// # Arguments
    /// * `credential` - The provider-specific credential payload
    ///
    /// # Returns
    /// * `Ok(VerifiedIdentity)` - identity whose `provider` equals [`name`](Self::name)
    /// * `Err(AuthError)` - typed failure; some codes (e.g. `MAGIC_LINK_SENT`) are non-fatal
    ///
    /// # Errors
    /// Returns an error if:
    /// - The credential variant is not one this provider accepts
    /// - The credential is invalid, expired or already consumed
    /// - A collaborator (user directory, token store, mailer) fails
    async fn authenticate(&self, credential: &Credential) -> Result<VerifiedIdentity, AuthError>;

    /// Self-check run once at registration
    ///
    /// # Errors
    /// Returns `CONFIGURATION_ERROR` describing the first problem found
    fn validate_config(&self) -> Result<(), AuthError>;
}

/// Error for a credential variant the provider does not handle
#[must_use]
pub fn unsupported_credential(provider: &str, credential: &Credential) -> AuthError {
    AuthError::invalid_request(format!(
        "Provider '{provider}' does not accept {} credentials",
        credential.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_wire_format() {
        let credential: Credential = serde_json::from_value(serde_json::json!({
            "type": "password",
            "email": "a@b.com",
            "password": "hunter2"
        }))
        .unwrap();
        assert_eq!(credential.kind(), "password");

        let debug = format!("{credential:?}");
        assert!(debug.contains("a@b.com"));
        assert!(!debug.contains("hunter2"));

        let credential: Credential = serde_json::from_value(serde_json::json!({
            "type": "magic_link_verify",
            "token": "secret-token"
        }))
        .unwrap();
        assert!(!format!("{credential:?}").contains("secret-token"));
    }

    #[test]
    fn test_unsupported_credential_message() {
        let err = unsupported_credential(
            "anonymous",
            &Credential::IdToken {
                id_token: "x".to_string(),
            },
        );
        assert!(err.message.contains("id_token"));
    }
}
