// ID token validation with JWKS discovery and caching
// Supports RS256 and ES256 signature verification plus claims validation

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use p256::{
    ecdsa::{
        signature::Verifier as _, Signature as EcdsaSignature, VerifyingKey as EcdsaVerifyingKey,
    },
    EncodedPoint,
};
use rsa::{pkcs1v15::VerifyingKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::error::{AuthError, AuthErrorCode};
use crate::settings::IdTokenValidationConfig;
use crate::token::{jwt, TokenError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdTokenError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("ID token signature verification failed")]
    SignatureInvalid,
    #[error("Claim '{claim}' validation failed: expected '{expected}', got '{actual}'")]
    ClaimValidationFailed {
        claim: &'static str,
        expected: String,
        actual: String,
    },
    #[error("Failed to fetch JWKS: {0}")]
    JwksFetchFailed(String),
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("ID token has expired")]
    TokenExpired,
    #[error("ID token is not yet valid")]
    TokenNotYetValid,
    #[error("Invalid ID token: {0}")]
    InvalidToken(String),
    #[error("Failed to decode key: {0}")]
    KeyDecodingFailed(String),
}

impl From<TokenError> for IdTokenError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::SignatureInvalid => Self::SignatureInvalid,
            TokenError::UnsupportedAlgorithm(alg) => Self::UnsupportedAlgorithm(alg),
            other => Self::InvalidToken(other.to_string()),
        }
    }
}

impl From<IdTokenError> for AuthError {
    fn from(err: IdTokenError) -> Self {
        let code = match &err {
            IdTokenError::TokenExpired => AuthErrorCode::TokenExpired,
            IdTokenError::JwksFetchFailed(_) => AuthErrorCode::ProviderError,
            _ => AuthErrorCode::TokenInvalid,
        };
        Self::new(code, err.to_string())
    }
}

// ============================================================================
// Claims & Keys
// ============================================================================

/// Claims read from a provider's ID token
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdTokenClaims {
    pub iss: Option<String>,
    /// String or array of strings
    pub aud: Option<serde_json::Value>,
    pub exp: Option<i64>,
    pub nbf: Option<i64>,
    pub iat: Option<i64>,
    pub sub: Option<String>,
    pub email: Option<String>,
    /// Apple sends `"true"` as a string
    pub email_verified: Option<serde_json::Value>,
    pub name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub preferred_username: Option<String>,
    pub picture: Option<String>,
}

impl IdTokenClaims {
    #[must_use]
    pub fn audiences(&self) -> Vec<String> {
        match &self.aud {
            Some(serde_json::Value::String(aud)) => vec![aud.clone()],
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => vec![],
        }
    }

    #[must_use]
    pub fn is_email_verified(&self) -> bool {
        match &self.email_verified {
            Some(serde_json::Value::Bool(verified)) => *verified,
            Some(serde_json::Value::String(verified)) => verified.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// `name`, else `given_name family_name`
    #[must_use]
    pub fn display_name(&self) -> Option<String> {
        if let Some(name) = self.name.as_ref().filter(|n| !n.trim().is_empty()) {
            return Some(name.clone());
        }
        let joined = format!(
            "{} {}",
            self.given_name.as_deref().unwrap_or(""),
            self.family_name.as_deref().unwrap_or("")
        );
        let joined = joined.trim();
        (!joined.is_empty()).then(|| joined.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JsonWebKey {
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,

    // RSA keys
    pub n: Option<String>,
    pub e: Option<String>,

    // EC keys
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
}

// ============================================================================
// JWKS Cache
// ============================================================================

#[derive(Debug)]
pub struct JwksCache {
    keys: HashMap<String, JsonWebKey>,
    last_updated: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    cache_duration: Duration,
    retry_backoff: Duration,
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new(Duration::hours(1))
    }
}

impl JwksCache {
    #[must_use]
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            keys: HashMap::new(),
            last_updated: None,
            last_failure: None,
            cache_duration,
            retry_backoff: Duration::minutes(5),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.last_updated
            .is_some_and(|updated| Utc::now() - updated < self.cache_duration)
    }

    #[must_use]
    pub fn should_retry_fetch(&self) -> bool {
        self.last_failure
            .map_or(true, |failed| Utc::now() - failed >= self.retry_backoff)
    }

    /// Look up by kid; a token without kid matches only a single-key set
    #[must_use]
    pub fn get_key(&self, kid: Option<&str>) -> Option<&JsonWebKey> {
        match kid {
            Some(kid) => self.keys.get(kid),
            None if self.keys.len() == 1 => self.keys.values().next(),
            None => None,
        }
    }

    pub fn store_keys(&mut self, keys: Vec<JsonWebKey>) {
        self.keys = keys
            .into_iter()
            .enumerate()
            .map(|(index, key)| {
                let kid = key
                    .kid
                    .clone()
                    .unwrap_or_else(|| format!("{}_{index}", key.kty));
                (kid, key)
            })
            .collect();
        debug!("💾 Cached {} signing keys", self.keys.len());
        self.last_updated = Some(Utc::now());
        self.last_failure = None;
    }

    pub fn record_fetch_failure(&mut self) {
        self.last_failure = Some(Utc::now());
    }
}

// ============================================================================
// Validator
// ============================================================================

/// Validates ID tokens issued by one provider
#[derive(Debug, Clone)]
pub struct IdTokenValidator {
    provider: String,
    jwks_uri: Option<String>,
    expected_issuer: Option<String>,
    expected_audience: String,
    config: IdTokenValidationConfig,
    cache: Arc<RwLock<JwksCache>>,
    http: reqwest::Client,
}

impl IdTokenValidator {
    #[must_use]
    pub fn new(
        provider: &str,
        jwks_uri: Option<String>,
        expected_issuer: Option<String>,
        expected_audience: String,
        config: IdTokenValidationConfig,
        http: reqwest::Client,
    ) -> Self {
        let cache_duration =
            Duration::seconds(i64::try_from(config.cache_duration_seconds).unwrap_or(3600));
        Self {
            provider: provider.to_string(),
            jwks_uri,
            expected_issuer,
            expected_audience,
            config,
            cache: Arc::new(RwLock::new(JwksCache::new(cache_duration))),
            http,
        }
    }

    #[must_use]
    pub fn has_jwks_uri(&self) -> bool {
        self.jwks_uri.is_some()
    }

    /// Seed the cache with a known key set (static keys or tests)
    pub async fn preload_keys(&self, keys: Vec<JsonWebKey>) {
        self.cache.write().await.store_keys(keys);
    }

    /// Fetch the provider's JWKS and replace the cached keys
    ///
    /// # Errors
    /// Returns error if no JWKS URI is configured, a recent fetch failed, or
    /// the key set cannot be fetched or parsed
    pub async fn refresh_keys(&self) -> Result<(), IdTokenError> {
        let jwks_uri = self.jwks_uri.as_deref().ok_or_else(|| {
            IdTokenError::JwksFetchFailed(format!("No JWKS URI configured for {}", self.provider))
        })?;

        if !self.cache.read().await.should_retry_fetch() {
            return Err(IdTokenError::JwksFetchFailed(
                "Skipping fetch due to recent failure and backoff".to_string(),
            ));
        }

        debug!("🔑 Fetching JWKS for provider '{}' from {jwks_uri}", self.provider);
        // No lock held across the request
        match self.fetch_jwks(jwks_uri).await {
            Ok(jwks) => {
                self.cache.write().await.store_keys(jwks.keys);
                Ok(())
            }
            Err(e) => {
                self.cache.write().await.record_fetch_failure();
                Err(e)
            }
        }
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JsonWebKeySet, IdTokenError> {
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| IdTokenError::JwksFetchFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(IdTokenError::JwksFetchFailed(format!(
                "JWKS request failed with status: {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| IdTokenError::JwksFetchFailed(format!("Failed to parse JWKS: {e}")))
    }

    async fn get_public_key(&self, kid: Option<&str>) -> Result<JsonWebKey, IdTokenError> {
        {
            let cache = self.cache.read().await;
            if cache.is_valid() || self.jwks_uri.is_none() {
                if let Some(key) = cache.get_key(kid) {
                    debug!("🎯 Found cached key {kid:?} for provider '{}'", self.provider);
                    return Ok(key.clone());
                }
            }
        }

        // Cache miss, expired, or key rotated
        if self.jwks_uri.is_some() {
            self.refresh_keys().await?;
            if let Some(key) = self.cache.read().await.get_key(kid) {
                return Ok(key.clone());
            }
        }

        Err(IdTokenError::KeyNotFound(
            kid.unwrap_or("<none>").to_string(),
        ))
    }

    /// Verify signature and claims of an ID token
    ///
    /// # Errors
    /// Returns error if token is malformed, signature verification fails, or
    /// an enabled claim check fails
    pub async fn validate(&self, token: &str) -> Result<IdTokenClaims, IdTokenError> {
        debug!("🔒 Starting ID token validation for provider '{}'", self.provider);
        let jwt = jwt::split(token)?;

        match jwt.header.alg.as_str() {
            "RS256" | "ES256" => {}
            alg => return Err(IdTokenError::UnsupportedAlgorithm(alg.to_string())),
        }

        let key = self.get_public_key(jwt.header.kid.as_deref()).await?;
        match jwt.header.alg.as_str() {
            "RS256" => Self::verify_rsa_signature(&jwt, &key)?,
            _ => Self::verify_ecdsa_signature(&jwt, &key)?,
        }
        debug!("✅ ID token signature verified");

        let claims: IdTokenClaims = jwt.claims()?;
        self.validate_claims(&claims)?;

        info!("🎉 ID token validated for provider '{}'", self.provider);
        Ok(claims)
    }

    fn verify_rsa_signature(
        jwt: &jwt::UnverifiedJwt<'_>,
        key: &JsonWebKey,
    ) -> Result<(), IdTokenError> {
        let n = decode_key_part(key.n.as_deref(), "RSA modulus (n)")?;
        let e = decode_key_part(key.e.as_deref(), "RSA exponent (e)")?;

        let rsa_key = RsaPublicKey::new(
            rsa::BigUint::from_bytes_be(&n),
            rsa::BigUint::from_bytes_be(&e),
        )
        .map_err(|e| IdTokenError::KeyDecodingFailed(format!("Invalid RSA key: {e}")))?;

        jwt.verify_rs256(&VerifyingKey::<Sha256>::new(rsa_key))
            .map_err(IdTokenError::from)
    }

    fn verify_ecdsa_signature(
        jwt: &jwt::UnverifiedJwt<'_>,
        key: &JsonWebKey,
    ) -> Result<(), IdTokenError> {
        if key.crv.as_deref().is_some_and(|crv| crv != "P-256") {
            return Err(IdTokenError::KeyDecodingFailed(format!(
                "ES256 needs a P-256 key, got {:?}",
                key.crv
            )));
        }
        let x = decode_key_part(key.x.as_deref(), "ECDSA x coordinate")?;
        let y = decode_key_part(key.y.as_deref(), "ECDSA y coordinate")?;

        // Uncompressed SEC1 point: 0x04 || x || y
        let mut point_bytes = vec![0x04];
        point_bytes.extend_from_slice(&x);
        point_bytes.extend_from_slice(&y);
        let encoded_point = EncodedPoint::from_bytes(&point_bytes)
            .map_err(|e| IdTokenError::KeyDecodingFailed(format!("Invalid EC point: {e}")))?;
        let verifying_key = EcdsaVerifyingKey::from_encoded_point(&encoded_point)
            .map_err(|e| IdTokenError::KeyDecodingFailed(format!("Invalid ECDSA key: {e}")))?;

        // JWS carries raw r || s, not DER
        let signature = EcdsaSignature::from_slice(&jwt.signature)
            .map_err(|_| IdTokenError::SignatureInvalid)?;
        verifying_key
            .verify(jwt.signing_input.as_bytes(), &signature)
            .map_err(|_| IdTokenError::SignatureInvalid)
    }

    fn validate_claims(&self, claims: &IdTokenClaims) -> Result<(), IdTokenError> {
        let now = Utc::now().timestamp();
        let clock_skew = i64::try_from(self.config.clock_skew_seconds).unwrap_or(300);

        if self.config.validate_expiration {
            if claims.exp.is_some_and(|exp| now > exp + clock_skew) {
                return Err(IdTokenError::TokenExpired);
            }
            if claims.nbf.is_some_and(|nbf| now < nbf - clock_skew) {
                return Err(IdTokenError::TokenNotYetValid);
            }
        }

        if self.config.validate_issuer {
            if let Some(expected) = &self.expected_issuer {
                let actual = claims.iss.as_deref().unwrap_or_default();
                if actual != expected {
                    return Err(IdTokenError::ClaimValidationFailed {
                        claim: "iss",
                        expected: expected.clone(),
                        actual: actual.to_string(),
                    });
                }
            }
        }

        if self.config.validate_audience {
            let audiences = claims.audiences();
            if !audiences.iter().any(|aud| *aud == self.expected_audience) {
                return Err(IdTokenError::ClaimValidationFailed {
                    claim: "aud",
                    expected: self.expected_audience.clone(),
                    actual: format!("{audiences:?}"),
                });
            }
        }

        if claims.sub.as_deref().map_or(true, str::is_empty) {
            return Err(IdTokenError::InvalidToken(
                "Missing or invalid 'sub' claim".to_string(),
            ));
        }
        Ok(())
    }
}

fn decode_key_part(part: Option<&str>, what: &str) -> Result<Vec<u8>, IdTokenError> {
    let part = part.ok_or_else(|| IdTokenError::KeyDecodingFailed(format!("Missing {what}")))?;
    general_purpose::URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| IdTokenError::KeyDecodingFailed(format!("Invalid {what} encoding: {e}")))
}
