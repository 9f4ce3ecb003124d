use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Result of a successful authentication
///
/// A transient handoff object: providers produce it, the caller turns it into a
/// session or a signed token. It is never persisted as-is.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct VerifiedIdentity {
    pub id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    /// Name of the provider that produced this identity
    pub provider: String,
    pub email_verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl VerifiedIdentity {
    #[must_use]
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            ..Self::default()
        }
    }

    /// Session id recorded by providers that create one while authenticating
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get("session_id").and_then(|v| v.as_str())
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.metadata
            .get("is_anonymous")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// Created ahead of a first login (magic link) and not yet activated
    Pending,
    Active,
    Disabled,
}

/// User record as held by the external user directory
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub password_hash: Option<String>,
    pub status: UserStatus,
    pub is_anonymous: bool,
    /// Set on an anonymous record whose principal was merged into an existing
    /// account; content owned by this id belongs to that account
    #[serde(default)]
    pub linked_user_id: Option<String>,
    pub email_verified: bool,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    /// Create a fresh active user with a generated id
    #[must_use]
    pub fn new(email: impl Into<String>, username: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.into(),
            username: username.into(),
            display_name: None,
            avatar_url: None,
            password_hash: None,
            status: UserStatus::Active,
            is_anonymous: false,
            linked_user_id: None,
            email_verified: false,
            email_verified_at: None,
            created_at: now,
            updated_at: now,
            last_login_at: None,
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.status == UserStatus::Disabled
    }

    /// Build the identity handed back to the caller after a successful login
    #[must_use]
    pub fn to_identity(&self, provider: &str) -> VerifiedIdentity {
        VerifiedIdentity {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            username: Some(self.username.clone()),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
            provider: provider.to_string(),
            email_verified: self.email_verified,
            verified_at: self.email_verified_at,
            metadata: HashMap::new(),
        }
    }
}

/// Registration input for the password provider
#[derive(Deserialize, Clone)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    /// Defaults to the email when absent
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl NewUser {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            username: None,
            display_name: None,
        }
    }
}

/// Server-tracked continuity record for a principal
///
/// Exactly one of two shapes holds: anonymous with no user id, or
/// authenticated with a user id and an expiry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    /// Stable id of the anonymous principal that opened the session; content
    /// written before an upgrade is attributed to it
    #[serde(default)]
    pub principal_id: Option<String>,
    pub is_anonymous: bool,
    pub username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` never expires (anonymous sessions only)
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    #[must_use]
    pub fn anonymous(username: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            principal_id: Some(Uuid::new_v4().to_string()),
            is_anonymous: true,
            username: Some(username.into()),
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn authenticated(user_id: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: Some(user_id.into()),
            principal_id: None,
            is_anonymous: false,
            username: None,
            created_at: now,
            updated_at: now,
            expires_at: Some(now + ttl),
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self.is_anonymous && self.user_id.is_some()
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Single-use passwordless login token
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MagicLinkToken {
    pub token: String,
    pub email: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
}

impl MagicLinkToken {
    #[must_use]
    pub fn new(token: String, email: String, user_id: Option<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token,
            email,
            user_id,
            created_at: now,
            expires_at: now + ttl,
            used: false,
            used_at: None,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn mark_used(&mut self) {
        self.used = true;
        self.used_at = Some(Utc::now());
    }
}
