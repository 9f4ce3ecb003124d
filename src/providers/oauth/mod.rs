//! Federated OAuth 2.0 / OpenID Connect provider
//!
//! Wraps the three-legged authorization-code flow. The opaque `state` string is
//! produced and checked by [`crate::state::StateCodec`]; this provider only
//! threads it into the authorization URL.

pub mod id_token;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashMap;

use self::id_token::{IdTokenClaims, IdTokenValidator};
use super::{unsupported_credential, AuthProvider, Credential, ProviderKind};
use crate::error::AuthError;
use crate::models::VerifiedIdentity;
use crate::settings::ProviderSettings;
use crate::token::jwt;
use crate::utils::logging::LoggingHelper;

/// Endpoints published by providers that need no discovery round trip
struct WellKnownEndpoints {
    authorization: &'static str,
    token: &'static str,
    userinfo: Option<&'static str>,
    jwks_uri: &'static str,
    issuer: Option<&'static str>,
}

fn well_known_endpoints(name: &str) -> Option<WellKnownEndpoints> {
    match name {
        "google" => Some(WellKnownEndpoints {
            authorization: "https://accounts.google.com/o/oauth2/v2/auth",
            token: "https://oauth2.googleapis.com/token",
            userinfo: Some("https://openidconnect.googleapis.com/v1/userinfo"),
            jwks_uri: "https://www.googleapis.com/oauth2/v3/certs",
            issuer: Some("https://accounts.google.com"),
        }),
        "microsoft" => Some(WellKnownEndpoints {
            authorization: "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
            token: "https://login.microsoftonline.com/common/oauth2/v2.0/token",
            userinfo: Some("https://graph.microsoft.com/oidc/userinfo"),
            jwks_uri: "https://login.microsoftonline.com/common/discovery/v2.0/keys",
            // The common endpoint issues per-tenant `iss` values
            issuer: None,
        }),
        "apple" => Some(WellKnownEndpoints {
            authorization: "https://appleid.apple.com/auth/authorize",
            token: "https://appleid.apple.com/auth/token",
            userinfo: None,
            jwks_uri: "https://appleid.apple.com/auth/keys",
            issuer: Some("https://appleid.apple.com"),
        }),
        _ => None,
    }
}

/// Subset of an OpenID discovery document
#[derive(Debug, Default, Deserialize)]
struct DiscoveryDocument {
    issuer: Option<String>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    userinfo_endpoint: Option<String>,
    jwks_uri: Option<String>,
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: Option<i64>,
}

#[derive(Debug)]
pub struct OAuthProvider {
    name: String,
    display_name: String,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_url: Option<String>,
    scopes: Vec<String>,
    extra_auth_params: HashMap<String, String>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    userinfo_endpoint: Option<String>,
    validator: IdTokenValidator,
    http: reqwest::Client,
}

impl OAuthProvider {
    /// Build from settings, filling gaps with the well-known endpoints for the
    /// provider name. Missing credentials surface later in `validate_config`.
    #[must_use]
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self::build(settings, DiscoveryDocument::default(), reqwest::Client::new())
    }

    /// Like [`Self::from_settings`], but resolves missing endpoints from the
    /// configured OpenID discovery document first
    ///
    /// # Errors
    ///
    /// Returns `PROVIDER_ERROR` if the discovery document cannot be fetched or parsed
    pub async fn discover(settings: &ProviderSettings) -> Result<Self, AuthError> {
        let http = reqwest::Client::new();
        let Some(discovery_url) = settings.discovery_url.as_deref() else {
            return Ok(Self::build(settings, DiscoveryDocument::default(), http));
        };

        debug!("🔍 Resolving endpoints for {} from {discovery_url}", settings.name);
        let document = http
            .get(discovery_url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::provider(format!("Discovery request failed: {e}")))?
            .json::<DiscoveryDocument>()
            .await
            .map_err(|e| AuthError::provider(format!("Invalid discovery document: {e}")))?;

        Ok(Self::build(settings, document, http))
    }

    fn build(
        settings: &ProviderSettings,
        discovered: DiscoveryDocument,
        http: reqwest::Client,
    ) -> Self {
        let known = well_known_endpoints(&settings.name);
        let pick = |configured: &Option<String>,
                    discovered: Option<String>,
                    known: Option<&'static str>| {
            configured
                .clone()
                .or(discovered)
                .or_else(|| known.map(str::to_string))
        };

        let client_id = settings.get_client_id();
        let jwks_uri = pick(
            &settings.jwks_uri,
            discovered.jwks_uri,
            known.as_ref().map(|k| k.jwks_uri),
        );
        let issuer = pick(
            &settings.issuer,
            discovered.issuer,
            known.as_ref().and_then(|k| k.issuer),
        );
        let validator = IdTokenValidator::new(
            &settings.name,
            jwks_uri,
            issuer,
            client_id.clone().unwrap_or_default(),
            settings.id_token_validation.clone(),
            http.clone(),
        );

        Self {
            name: settings.name.clone(),
            display_name: settings
                .display_name
                .clone()
                .unwrap_or_else(|| settings.name.clone()),
            client_secret: settings.get_client_secret(),
            client_id,
            redirect_url: settings.redirect_url.clone(),
            scopes: settings.scopes.clone(),
            extra_auth_params: settings.extra_auth_params.clone(),
            authorization_endpoint: pick(
                &settings.authorization_endpoint,
                discovered.authorization_endpoint,
                known.as_ref().map(|k| k.authorization),
            ),
            token_endpoint: pick(
                &settings.token_endpoint,
                discovered.token_endpoint,
                known.as_ref().map(|k| k.token),
            ),
            userinfo_endpoint: pick(
                &settings.userinfo_endpoint,
                discovered.userinfo_endpoint,
                known.as_ref().and_then(|k| k.userinfo),
            ),
            validator,
            http,
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn id_token_validator(&self) -> &IdTokenValidator {
        &self.validator
    }

    /// Build the provider authorization URL carrying the opaque `state`
    ///
    /// # Errors
    ///
    /// Returns `CONFIGURATION_ERROR` if the endpoint, client id or redirect URL is missing
    pub fn authorization_url(&self, state: &str) -> Result<String, AuthError> {
        let endpoint = self.authorization_endpoint.as_deref().ok_or_else(|| {
            AuthError::configuration(format!(
                "Provider {} missing authorization_endpoint",
                self.name
            ))
        })?;
        let client_id = self.require_client_id()?;
        let redirect_url = self.require_redirect_url()?;

        let mut url = url::Url::parse(endpoint)
            .map_err(|e| AuthError::configuration(format!("Invalid authorization_endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);

        for (key, value) in &self.extra_auth_params {
            url.query_pairs_mut().append_pair(key, value);
        }

        debug!(
            "Built authorization URL for {} with scopes {:?}",
            self.name, self.scopes
        );
        Ok(url.to_string())
    }

    /// Exchange an authorization code at the token endpoint
    ///
    /// # Errors
    ///
    /// Returns `CONFIGURATION_ERROR` for missing settings, `PROVIDER_ERROR` when
    /// the request fails or the provider rejects the code
    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, AuthError> {
        if code.trim().is_empty() {
            return Err(AuthError::invalid_request("Authorization code is required"));
        }
        let token_endpoint = self.token_endpoint.as_deref().ok_or_else(|| {
            AuthError::configuration(format!("Provider {} missing token_endpoint", self.name))
        })?;
        let client_id = self.require_client_id()?;
        let redirect_url = self.require_redirect_url()?;
        let client_secret = self.client_secret.as_deref().ok_or_else(|| {
            AuthError::configuration(format!(
                "Client secret not configured for provider {}",
                self.name
            ))
        })?;

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_url),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];

        LoggingHelper::log_token_exchange_start(&self.name);
        let response = self
            .http
            .post(token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::provider(format!("Failed to exchange code for token: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AuthError::provider(format!(
                "Token exchange failed with status {status}: {error_text}"
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::provider(format!("Failed to parse token response: {e}")))?;
        LoggingHelper::log_token_exchange_summary(
            &self.name,
            tokens.id_token.is_some(),
            tokens.refresh_token.is_some(),
            &tokens.token_type,
        );
        Ok(tokens)
    }

    /// Verify an ID token handed over directly by a non-redirect client
    ///
    /// # Errors
    ///
    /// Returns `CONFIGURATION_ERROR` when no JWKS is known for the provider,
    /// otherwise the mapped validation failure
    pub async fn verify_id_token(&self, id_token: &str) -> Result<VerifiedIdentity, AuthError> {
        if !self.validator.has_jwks_uri() {
            return Err(AuthError::configuration(format!(
                "Provider {} has no jwks_uri; ID tokens cannot be verified",
                self.name
            )));
        }
        let claims = self.validator.validate(id_token).await?;
        self.identity_from_claims(&claims, true)
    }

    async fn complete_code_flow(&self, code: &str) -> Result<VerifiedIdentity, AuthError> {
        let tokens = self.exchange_code(code).await?;

        if let Some(id_token) = tokens.id_token.as_deref() {
            if self.validator.has_jwks_uri() {
                let claims = self.validator.validate(id_token).await?;
                return self.identity_from_claims(&claims, true);
            }
            // Received straight from the token endpoint over TLS
            let claims: IdTokenClaims = jwt::split(id_token)
                .and_then(|jwt| jwt.claims())
                .map_err(AuthError::from)?;
            return self.identity_from_claims(&claims, false);
        }

        let access_token = tokens.access_token.as_deref().ok_or_else(|| {
            AuthError::provider("Token response carried neither id_token nor access_token")
        })?;
        let claims = self.fetch_userinfo(access_token).await?;
        self.identity_from_claims(&claims, false)
    }

    async fn fetch_userinfo(&self, access_token: &str) -> Result<IdTokenClaims, AuthError> {
        let endpoint = self.userinfo_endpoint.as_deref().ok_or_else(|| {
            AuthError::provider(format!(
                "Provider {} returned no id_token and has no userinfo_endpoint",
                self.name
            ))
        })?;
        debug!("Fetching userinfo for {}", self.name);
        self.http
            .get(endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| AuthError::provider(format!("Userinfo request failed: {e}")))?
            .json()
            .await
            .map_err(|e| AuthError::provider(format!("Invalid userinfo response: {e}")))
    }

    fn identity_from_claims(
        &self,
        claims: &IdTokenClaims,
        signature_verified: bool,
    ) -> Result<VerifiedIdentity, AuthError> {
        let subject = claims
            .sub
            .as_deref()
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| AuthError::provider("Provider response is missing the subject"))?;

        let mut identity = VerifiedIdentity::new(subject, self.name.as_str());
        identity.email.clone_from(&claims.email);
        identity.username.clone_from(&claims.preferred_username);
        identity.display_name = claims.display_name();
        identity.avatar_url.clone_from(&claims.picture);
        identity.email_verified = claims.is_email_verified();
        identity.verified_at = identity.email_verified.then(chrono::Utc::now);
        identity
            .metadata
            .insert("subject".to_string(), serde_json::json!(subject));
        identity.metadata.insert(
            "id_token_verified".to_string(),
            serde_json::json!(signature_verified),
        );

        info!("✅ {} identity resolved for subject {subject}", self.display_name);
        Ok(identity)
    }

    fn require_client_id(&self) -> Result<&str, AuthError> {
        self.client_id.as_deref().ok_or_else(|| {
            AuthError::configuration(format!("Client ID not configured for provider {}", self.name))
        })
    }

    fn require_redirect_url(&self) -> Result<&str, AuthError> {
        self.redirect_url.as_deref().ok_or_else(|| {
            AuthError::configuration(format!(
                "Redirect URL not configured for provider {}",
                self.name
            ))
        })
    }
}

#[async_trait]
impl AuthProvider for OAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Federated
    }

    async fn authenticate(&self, credential: &Credential) -> Result<VerifiedIdentity, AuthError> {
        match credential {
            Credential::AuthorizationCode { code } => self.complete_code_flow(code).await,
            Credential::IdToken { id_token } => self.verify_id_token(id_token).await,
            other => Err(unsupported_credential(&self.name, other)),
        }
    }

    fn validate_config(&self) -> Result<(), AuthError> {
        let missing =
            |value: &Option<String>| value.as_deref().map_or(true, |v| v.trim().is_empty());

        if self.name.trim().is_empty() {
            return Err(AuthError::configuration("OAuth provider name is required"));
        }
        for (field, value) in [
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_url", &self.redirect_url),
            ("authorization_endpoint", &self.authorization_endpoint),
            ("token_endpoint", &self.token_endpoint),
        ] {
            if missing(value) {
                return Err(AuthError::configuration(format!(
                    "{} OAuth provider requires {field}",
                    self.display_name
                )));
            }
        }
        if self.scopes.iter().all(|scope| scope.trim().is_empty()) {
            return Err(AuthError::configuration(format!(
                "{} OAuth provider requires at least one scope",
                self.display_name
            )));
        }
        Ok(())
    }
}
