//! Signed identity tokens
//!
//! Tokens are compact RS256 JWTs carrying [`Claims`]. Anonymous tokens never
//! carry `exp`; authenticated tokens always do. An expired authenticated token
//! can be exchanged for a fresh one within the configured refresh window.

pub mod claims;
pub mod jwt;

pub use claims::{Claims, IdentityClaims};

use chrono::{Duration, Utc};
use log::{debug, warn};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{AuthError, AuthErrorCode};
use crate::settings::TokenSettings;
use jwt::JwtHeader;

/// Smallest RSA modulus accepted for signing or verification
pub const MIN_RSA_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Token signature verification failed")]
    SignatureInvalid,
    #[error("Token has expired")]
    Expired,
    #[error("Token is not yet valid")]
    NotYetValid,
    #[error("Claim '{claim}' validation failed: expected '{expected}', got '{actual}'")]
    ClaimMismatch {
        claim: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Signing key rejected: {0}")]
    Key(String),
    #[error("Token signing failed: {0}")]
    Signing(String),
    #[error("Token service was built without a signing key")]
    NoSigningKey,
    #[error("Anonymous or non-expiring tokens cannot be refreshed")]
    RefreshNotAllowed,
    #[error("Token has not expired yet")]
    NotExpired,
    #[error("Token expired outside the refresh window")]
    RefreshWindowExceeded,
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        let code = match &err {
            TokenError::Expired => AuthErrorCode::TokenExpired,
            TokenError::RefreshNotAllowed => AuthErrorCode::RefreshNotAllowed,
            TokenError::NotExpired => AuthErrorCode::TokenNotExpired,
            TokenError::RefreshWindowExceeded => AuthErrorCode::RefreshWindowExceeded,
            TokenError::Key(_) | TokenError::Signing(_) | TokenError::NoSigningKey => {
                AuthErrorCode::ConfigurationError
            }
            TokenError::Malformed(_)
            | TokenError::UnsupportedAlgorithm(_)
            | TokenError::SignatureInvalid
            | TokenError::NotYetValid
            | TokenError::ClaimMismatch { .. } => AuthErrorCode::TokenInvalid,
        };
        Self::new(code, err.to_string())
    }
}

/// Issuer-side parameters of the token service
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub issuer: String,
    pub audience: Option<String>,
    /// Applied to authenticated tokens issued with a non-positive TTL
    pub default_ttl: Duration,
    pub refresh_window: Duration,
    pub leeway_seconds: i64,
    pub key_id: Option<String>,
}

impl TokenConfig {
    #[must_use]
    pub fn from_settings(settings: &TokenSettings) -> Self {
        Self {
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            default_ttl: settings.default_ttl(),
            refresh_window: settings.refresh_window(),
            leeway_seconds: i64::try_from(settings.leeway_seconds).unwrap_or(0),
            key_id: None,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self::from_settings(&TokenSettings::default())
    }
}

pub struct TokenService {
    signing_key: Option<SigningKey<Sha256>>,
    verifying_key: VerifyingKey<Sha256>,
    config: TokenConfig,
}

impl TokenService {
    /// Build an issuing service from a PEM private key (PKCS#8 or PKCS#1)
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Key` if the PEM cannot be parsed or the key is
    /// shorter than 2048 bits
    pub fn from_private_pem(pem: &str, config: TokenConfig) -> Result<Self, TokenError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| TokenError::Key(format!("Failed to parse RSA private key: {e}")))?;
        check_key_size(&private_key.to_public_key())?;

        let verifying_key = VerifyingKey::<Sha256>::new(private_key.to_public_key());
        Ok(Self {
            signing_key: Some(SigningKey::<Sha256>::new(private_key)),
            verifying_key,
            config,
        })
    }

    /// Build a verify-only service from a PEM public key (SPKI or PKCS#1)
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Key` if the PEM cannot be parsed or the key is
    /// shorter than 2048 bits
    pub fn verifier_from_public_pem(pem: &str, config: TokenConfig) -> Result<Self, TokenError> {
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| TokenError::Key(format!("Failed to parse RSA public key: {e}")))?;
        check_key_size(&public_key)?;

        Ok(Self {
            signing_key: None,
            verifying_key: VerifyingKey::<Sha256>::new(public_key),
            config,
        })
    }

    /// Build the service described by `[token]` settings
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Key` if no usable signing key is configured
    pub fn from_settings(settings: &TokenSettings) -> Result<Self, TokenError> {
        let pem = settings
            .load_private_key_pem()
            .map_err(|e| TokenError::Key(format!("{e:#}")))?;
        Self::from_private_pem(&pem, TokenConfig::from_settings(settings))
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Sign a token for `identity`
    ///
    /// Anonymous identities never receive an expiry. Authenticated identities
    /// get `ttl`, or the default TTL when `ttl` is zero or negative.
    ///
    /// # Errors
    ///
    /// Returns an error if the service has no signing key or signing fails
    pub fn issue_token(
        &self,
        identity: &IdentityClaims,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        self.issue_claims(identity, ttl).map(|(token, _)| token)
    }

    /// Like [`issue_token`](Self::issue_token) but also returns the signed claims
    ///
    /// # Errors
    ///
    /// Returns an error if the service has no signing key or signing fails
    pub fn issue_claims(
        &self,
        identity: &IdentityClaims,
        ttl: Duration,
    ) -> Result<(String, Claims), TokenError> {
        let now = Utc::now().timestamp();
        let exp = if identity.anonymous {
            None
        } else if ttl > Duration::zero() {
            Some(now + ttl.num_seconds())
        } else {
            Some(now + self.config.default_ttl.num_seconds())
        };

        let claims = Claims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            iat: now,
            nbf: now,
            exp,
            jti: Uuid::new_v4().to_string(),
            identity: identity.clone(),
        };
        let token = self.sign_claims(&claims)?;
        debug!(
            "Issued {} token for session {}",
            if identity.anonymous { "anonymous" } else { "authenticated" },
            identity.session_id
        );
        Ok((token, claims))
    }

    /// Sign a fully formed claim set as-is
    ///
    /// # Errors
    ///
    /// Returns an error if the service has no signing key or signing fails
    pub fn sign_claims(&self, claims: &Claims) -> Result<String, TokenError> {
        let key = self.signing_key.as_ref().ok_or(TokenError::NoSigningKey)?;
        jwt::encode_rs256(&JwtHeader::rs256(self.config.key_id.as_deref()), claims, key)
    }

    /// Verify signature, validity window, issuer and audience
    ///
    /// Tokens without `exp` never fail on expiry.
    ///
    /// # Errors
    ///
    /// Returns the first failed check
    pub fn verify_token(&self, token: &str) -> Result<Claims, TokenError> {
        let claims = self.decode_verified(token)?;
        self.check_validity_window(&claims)?;
        Ok(claims)
    }

    /// Exchange an expired authenticated token for a new one
    ///
    /// The old token must carry a valid signature, issuer and audience, must be
    /// past its expiry and no further past it than the refresh window. The new
    /// token keeps the identity claims and gets a fresh `jti`.
    ///
    /// # Errors
    ///
    /// Returns `RefreshNotAllowed` for anonymous or non-expiring tokens,
    /// `NotExpired` for tokens still valid and `RefreshWindowExceeded` for
    /// tokens expired too long ago
    pub fn refresh_token(&self, token: &str, new_ttl: Duration) -> Result<String, TokenError> {
        let claims = self.decode_verified(token)?;

        let exp = match claims.exp {
            Some(exp) if !claims.identity.anonymous => exp,
            _ => return Err(TokenError::RefreshNotAllowed),
        };

        let now = Utc::now().timestamp();
        if now <= exp {
            return Err(TokenError::NotExpired);
        }
        if now - exp > self.config.refresh_window.num_seconds() {
            warn!(
                "Refresh refused for session {}: expired {}s ago",
                claims.identity.session_id,
                now - exp
            );
            return Err(TokenError::RefreshWindowExceeded);
        }

        self.issue_token(&claims.identity, new_ttl)
    }

    /// Decode claims without checking anything; for diagnostics only
    ///
    /// # Errors
    ///
    /// Returns `TokenError::Malformed` if the token cannot be parsed
    pub fn decode_unverified(token: &str) -> Result<Claims, TokenError> {
        jwt::split(token)?.claims()
    }

    fn decode_verified(&self, token: &str) -> Result<Claims, TokenError> {
        let jwt = jwt::split(token)?;
        if jwt.header.alg != jwt::RS256 {
            return Err(TokenError::UnsupportedAlgorithm(jwt.header.alg));
        }
        jwt.verify_rs256(&self.verifying_key)?;

        let claims: Claims = jwt.claims()?;
        if claims.iss != self.config.issuer {
            return Err(TokenError::ClaimMismatch {
                claim: "iss",
                expected: self.config.issuer.clone(),
                actual: claims.iss,
            });
        }
        if claims.aud != self.config.audience {
            return Err(TokenError::ClaimMismatch {
                claim: "aud",
                expected: self.config.audience.clone().unwrap_or_default(),
                actual: claims.aud.unwrap_or_default(),
            });
        }
        Ok(claims)
    }

    fn check_validity_window(&self, claims: &Claims) -> Result<(), TokenError> {
        let now = Utc::now().timestamp();
        let leeway = self.config.leeway_seconds;
        if claims.exp.is_some_and(|exp| now > exp + leeway) {
            return Err(TokenError::Expired);
        }
        if claims.nbf > now + leeway {
            return Err(TokenError::NotYetValid);
        }
        Ok(())
    }
}

fn check_key_size(key: &RsaPublicKey) -> Result<(), TokenError> {
    let bits = key.size() * 8;
    if bits < MIN_RSA_KEY_BITS {
        return Err(TokenError::Key(format!(
            "RSA key is {bits} bits, at least {MIN_RSA_KEY_BITS} required"
        )));
    }
    Ok(())
}
