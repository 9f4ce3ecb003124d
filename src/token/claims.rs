use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::VerifiedIdentity;

/// Identity metadata keys that already have a dedicated claim
const PROMOTED_METADATA_KEYS: &[&str] = &["session_id", "is_anonymous"];

/// Domain part of a signed token: who the bearer is
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct IdentityClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl IdentityClaims {
    /// Claims for an anonymous principal: no user id, never expires once signed
    #[must_use]
    pub fn anonymous(session_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: None,
            session_id: session_id.into(),
            username: Some(username.into()),
            email: None,
            provider: "anonymous".to_string(),
            anonymous: true,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn authenticated(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            user_id: Some(user_id.into()),
            session_id: session_id.into(),
            username: None,
            email: None,
            provider: provider.into(),
            anonymous: false,
            metadata: HashMap::new(),
        }
    }

    /// Build claims from a provider's verified identity and the session it was bound to
    ///
    /// Anonymous identities keep their stable id in `user_id` so content
    /// attribution survives a later migration. Provider metadata is carried
    /// over, minus the keys that map onto dedicated claims.
    #[must_use]
    pub fn from_identity(identity: &VerifiedIdentity, session_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(identity.id.clone()),
            session_id: session_id.into(),
            username: identity.username.clone(),
            email: identity.email.clone(),
            provider: identity.provider.clone(),
            anonymous: identity.is_anonymous(),
            metadata: identity
                .metadata
                .iter()
                .filter(|(key, _)| !PROMOTED_METADATA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Full signed token payload: registered claims plus the identity
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Claims {
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub nbf: i64,
    /// Omitted for anonymous tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    pub jti: String,
    #[serde(flatten)]
    pub identity: IdentityClaims,
}

impl Claims {
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp.and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }

    #[must_use]
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.iat, 0).single()
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.identity.anonymous
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.identity.user_id.as_deref()
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.identity.session_id
    }
}
