//! Common authentication error types
//!
//! `AuthError` is the typed result every provider returns from `authenticate`.
//! It is not an exception: it carries a stable code the boundary layer can map
//! to a response, a human readable message and optional structured details.

use serde::{Serialize, Serializer};
use std::fmt;

/// Stable error codes shared by every authentication path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthErrorCode {
    InvalidCredentials,
    UserNotFound,
    UserDisabled,
    ProviderError,
    ProviderNotFound,
    TokenExpired,
    TokenInvalid,
    SessionNotFound,
    SessionExpired,
    EmailNotVerified,
    UsernameTaken,
    EmailTaken,
    RateLimited,
    /// Non-fatal: a magic link was dispatched, no identity is available yet
    MagicLinkSent,
    WeakPassword,
    InvalidRequest,
    ConfigurationError,
    RefreshNotAllowed,
    TokenNotExpired,
    RefreshWindowExceeded,
    /// Extension point for codes defined outside this crate
    Other(String),
}

impl AuthErrorCode {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::UserDisabled => "USER_DISABLED",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::ProviderNotFound => "PROVIDER_NOT_FOUND",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            Self::UsernameTaken => "USERNAME_TAKEN",
            Self::EmailTaken => "EMAIL_TAKEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::MagicLinkSent => "MAGIC_LINK_SENT",
            Self::WeakPassword => "WEAK_PASSWORD",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ConfigurationError => "CONFIGURATION_ERROR",
            Self::RefreshNotAllowed => "REFRESH_NOT_ALLOWED",
            Self::TokenNotExpired => "TOKEN_NOT_EXPIRED",
            Self::RefreshWindowExceeded => "REFRESH_WINDOW_EXCEEDED",
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for AuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuthErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Authentication failure carried through every provider's `authenticate` contract
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthError {
    pub code: AuthErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuthError {
    #[must_use]
    pub fn new(code: AuthErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The single error returned for unknown emails and wrong passwords alike
    #[must_use]
    pub fn invalid_credentials() -> Self {
        Self::new(AuthErrorCode::InvalidCredentials, "Invalid email or password")
    }

    #[must_use]
    pub fn user_disabled() -> Self {
        Self::new(AuthErrorCode::UserDisabled, "User account is disabled")
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::InvalidRequest, message)
    }

    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::ProviderError, message)
    }

    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AuthErrorCode::ConfigurationError, message)
    }

    #[must_use]
    pub fn provider_not_found(name: &str) -> Self {
        Self::new(
            AuthErrorCode::ProviderNotFound,
            format!("Provider '{name}' is not registered"),
        )
    }

    /// Wrap a collaborator failure with context
    #[must_use]
    pub fn store(context: &str, err: &StoreError) -> Self {
        Self::new(AuthErrorCode::ProviderError, format!("{context}: {err}"))
    }

    #[must_use]
    pub fn is(&self, code: &AuthErrorCode) -> bool {
        &self.code == code
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Errors reported by injected store collaborators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("record already exists: {0}")]
    Conflict(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_render_as_stable_strings() {
        assert_eq!(AuthErrorCode::UserDisabled.as_str(), "USER_DISABLED");
        assert_eq!(
            AuthErrorCode::Other("ACCOUNT_LOCKED".to_string()).as_str(),
            "ACCOUNT_LOCKED"
        );
        assert_eq!(
            AuthError::invalid_credentials().to_string(),
            "INVALID_CREDENTIALS: Invalid email or password"
        );
    }

    #[test]
    fn test_auth_error_serializes_code_and_details() {
        let err = AuthError::new(AuthErrorCode::RateLimited, "Too many attempts")
            .with_details(serde_json::json!({ "retry_after_minutes": 60 }));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["details"]["retry_after_minutes"], 60);

        let bare = serde_json::to_value(AuthError::user_disabled()).unwrap();
        assert!(bare.get("details").is_none());
    }

    #[test]
    fn test_store_errors_are_wrapped_with_context() {
        let err = AuthError::store(
            "Failed to load user",
            &StoreError::Backend("connection reset".to_string()),
        );
        assert!(err.is(&AuthErrorCode::ProviderError));
        assert!(err.message.contains("Failed to load user"));
        assert!(err.message.contains("connection reset"));
    }
}
