//! Opaque OAuth state for the third-party redirect round trip
//!
//! An [`OAuthState`] is sealed with AES-256-GCM (random nonce prefixed to the
//! ciphertext, base64url encoded). The client can neither read nor alter it,
//! and the codec refuses it once the embedded expiry has passed.

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{AuthError, AuthErrorCode};
use crate::settings::StateSettings;
use crate::utils::crypto::{
    decrypt_data, derive_encryption_key, encrypt_data, generate_csrf_token, ENCRYPTION_KEY_SIZE,
};
use crate::utils::validation::validate_redirect_target;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OAuthState {
    /// CSRF nonce
    pub nonce: String,
    pub provider: String,
    /// Where the client goes after the callback completes
    pub redirect_url: String,
    /// Anonymous session to migrate once the user is known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("state token expired")]
    Expired,
    #[error("invalid state token: {0}")]
    Invalid(String),
    #[error("state was issued for provider '{expected}', not '{actual}'")]
    ProviderMismatch { expected: String, actual: String },
    #[error("invalid redirect target: {0}")]
    InvalidRedirect(String),
    #[error("failed to seal state: {0}")]
    Encoding(String),
}

impl From<StateError> for AuthError {
    fn from(err: StateError) -> Self {
        let code = match &err {
            StateError::Expired => AuthErrorCode::TokenExpired,
            StateError::Invalid(_) | StateError::ProviderMismatch { .. } => {
                AuthErrorCode::TokenInvalid
            }
            StateError::InvalidRedirect(_) => AuthErrorCode::InvalidRequest,
            StateError::Encoding(_) => AuthErrorCode::ConfigurationError,
        };
        Self::new(code, err.to_string())
    }
}

pub struct StateCodec {
    key: [u8; ENCRYPTION_KEY_SIZE],
    ttl: Duration,
}

impl StateCodec {
    #[must_use]
    pub fn new(key: [u8; ENCRYPTION_KEY_SIZE], ttl: Duration) -> Self {
        Self { key, ttl }
    }

    /// Derive the key from a configured secret (base64 of 32 bytes, or any passphrase)
    #[must_use]
    pub fn from_secret(secret: &str, ttl: Duration) -> Self {
        Self::new(derive_encryption_key(secret), ttl)
    }

    #[must_use]
    pub fn from_settings(settings: &StateSettings) -> Self {
        let ttl = Duration::minutes(i64::try_from(settings.ttl_minutes).unwrap_or(10));
        Self::from_secret(&settings.secret, ttl)
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Build a fresh state record for `provider` and seal it
    ///
    /// Returns the sealed token together with the record it encodes.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidRedirect` if `redirect_url` is not a safe
    /// relative path, or `StateError::Encoding` if sealing fails
    pub fn issue(
        &self,
        provider: &str,
        redirect_url: &str,
        session_id: Option<&str>,
    ) -> Result<(String, OAuthState), StateError> {
        validate_redirect_target(redirect_url).map_err(StateError::InvalidRedirect)?;

        let now = Utc::now();
        let state = OAuthState {
            nonce: generate_csrf_token(),
            provider: provider.to_string(),
            redirect_url: redirect_url.to_string(),
            session_id: session_id.map(str::to_string),
            issued_at: now,
            expires_at: now + self.ttl,
        };
        let token = self.encode(&state)?;
        Ok((token, state))
    }

    /// Seal a state record as-is
    ///
    /// # Errors
    ///
    /// Returns `StateError::Encoding` if serialization or encryption fails
    pub fn encode(&self, state: &OAuthState) -> Result<String, StateError> {
        let token =
            encrypt_data(state, &self.key).map_err(|e| StateError::Encoding(format!("{e:#}")))?;
        debug!(
            "Sealed OAuth state for provider {}: {} characters",
            state.provider,
            token.len()
        );
        Ok(token)
    }

    /// Open a sealed state and reject it if expired
    ///
    /// # Errors
    ///
    /// Returns `StateError::Invalid` for anything that fails authentication and
    /// `StateError::Expired` once the embedded expiry has passed
    pub fn decode(&self, token: &str) -> Result<OAuthState, StateError> {
        self.decode_at(token, Utc::now())
    }

    /// [`decode`](Self::decode) against an explicit clock
    ///
    /// # Errors
    ///
    /// See [`decode`](Self::decode)
    pub fn decode_at(&self, token: &str, now: DateTime<Utc>) -> Result<OAuthState, StateError> {
        let state: OAuthState = decrypt_data(token, &self.key).map_err(|e| {
            debug!("Failed to decrypt OAuth state: {e}");
            StateError::Invalid("cannot decrypt state parameter".to_string())
        })?;

        if now >= state.expires_at {
            warn!("Rejected expired OAuth state for provider {}", state.provider);
            return Err(StateError::Expired);
        }
        Ok(state)
    }

    /// Decode and require that the state was issued for `provider`
    ///
    /// # Errors
    ///
    /// See [`decode`](Self::decode); additionally `StateError::ProviderMismatch`
    pub fn decode_for_provider(
        &self,
        token: &str,
        provider: &str,
    ) -> Result<OAuthState, StateError> {
        let state = self.decode(token)?;
        if state.provider != provider {
            warn!(
                "OAuth state provider mismatch: issued for {}, presented to {provider}",
                state.provider
            );
            return Err(StateError::ProviderMismatch {
                expected: state.provider,
                actual: provider.to_string(),
            });
        }
        Ok(state)
    }
}
