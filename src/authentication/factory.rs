//! Service factory for wiring configured authentication services
//!
//! Builds the token service, state codec, session manager and every enabled
//! provider from [`AuthSettings`] plus the injected store collaborators, and
//! registers the providers in a fresh [`ProviderRegistry`].

use anyhow::{Context, Result};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AuthError, AuthErrorCode};
use crate::models::{Session, VerifiedIdentity};
use crate::providers::{
    AnonymousProvider, AuthProvider, Credential, MagicLinkProvider, OAuthProvider, PasswordProvider,
};
use crate::registry::ProviderRegistry;
use crate::session::SessionManager;
use crate::settings::AuthSettings;
use crate::state::{OAuthState, StateCodec};
use crate::store::{
    EmailSender, InMemoryMagicLinkStore, InMemorySessionStore, InMemoryUserDirectory,
    MagicLinkStore, SessionStore, UserDirectory,
};
use crate::token::{IdentityClaims, TokenService};
use crate::utils::logging::LoggingHelper;

/// Store collaborators the core depends on but does not implement
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserDirectory>,
    pub sessions: Arc<dyn SessionStore>,
    pub magic_links: Arc<dyn MagicLinkStore>,
    pub mailer: Arc<dyn EmailSender>,
}

impl Collaborators {
    /// In-memory stores around the given mailer; for tests and local development
    #[must_use]
    pub fn in_memory(mailer: Arc<dyn EmailSender>) -> Self {
        Self {
            users: Arc::new(InMemoryUserDirectory::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            magic_links: Arc::new(InMemoryMagicLinkStore::new()),
            mailer,
        }
    }
}

/// First leg of an OAuth login
#[derive(Debug, Clone)]
pub struct OAuthRedirect {
    pub authorization_url: String,
    /// Opaque sealed state, also embedded in `authorization_url`
    pub state_token: String,
    pub state: OAuthState,
}

/// Session plus the signed token handed to the client
#[derive(Debug, Clone)]
pub struct SignedSession {
    pub session: Session,
    pub token: String,
}

/// Fully wired authentication core
pub struct AuthServices {
    pub registry: Arc<ProviderRegistry>,
    pub tokens: Arc<TokenService>,
    pub state_codec: Arc<StateCodec>,
    pub sessions: Arc<SessionManager>,
    oauth: HashMap<String, Arc<OAuthProvider>>,
    password: Option<Arc<PasswordProvider>>,
    magic_link: Option<Arc<MagicLinkProvider>>,
    anonymous: Option<Arc<AnonymousProvider>>,
}

impl AuthServices {
    /// Dispatch a credential through the registry
    ///
    /// # Errors
    ///
    /// Returns `PROVIDER_NOT_FOUND` or the provider's own failure
    pub async fn authenticate(
        &self,
        provider: &str,
        credential: &Credential,
    ) -> Result<VerifiedIdentity, AuthError> {
        self.registry.authenticate(provider, credential).await
    }

    /// Seal a state record and build the provider's authorization URL
    ///
    /// `session_id` carries an anonymous session through the redirect so it can
    /// be migrated once the provider answers.
    ///
    /// # Errors
    ///
    /// Returns `PROVIDER_NOT_FOUND` for unknown providers, `INVALID_REQUEST` for
    /// an unsafe redirect target, or a configuration failure
    pub fn begin_oauth(
        &self,
        provider: &str,
        redirect_url: &str,
        session_id: Option<&str>,
    ) -> Result<OAuthRedirect, AuthError> {
        let oauth = self.oauth_provider(provider)?;
        let (state_token, state) = self.state_codec.issue(provider, redirect_url, session_id)?;
        let authorization_url = oauth.authorization_url(&state_token)?;
        Ok(OAuthRedirect {
            authorization_url,
            state_token,
            state,
        })
    }

    /// Check the returned state and exchange the authorization code
    ///
    /// # Errors
    ///
    /// Returns `TOKEN_EXPIRED` / `TOKEN_INVALID` for a stale, forged or
    /// mismatched state, otherwise the provider's own failure
    pub async fn complete_oauth(
        &self,
        provider: &str,
        state_token: &str,
        code: &str,
    ) -> Result<(VerifiedIdentity, OAuthState), AuthError> {
        let state = self.state_codec.decode_for_provider(state_token, provider)?;
        let identity = self
            .registry
            .authenticate(
                provider,
                &Credential::AuthorizationCode {
                    code: code.to_string(),
                },
            )
            .await?;
        Ok((identity, state))
    }

    /// Bind an identity to a session and sign a token for it
    ///
    /// Anonymous identities reuse the session their provider created and get a
    /// non-expiring token; everyone else gets a fresh authenticated session and
    /// a token with the default TTL.
    ///
    /// # Errors
    ///
    /// Returns a session failure or a token signing failure
    pub async fn sign_in(&self, identity: &VerifiedIdentity) -> Result<SignedSession, AuthError> {
        let session = match identity.session_id() {
            Some(session_id) if identity.is_anonymous() => {
                self.sessions.validate(session_id).await?
            }
            _ => {
                self.sessions
                    .create_authenticated(&identity.id, self.sessions.authenticated_ttl())
                    .await?
            }
        };
        self.sign_session(identity, session)
    }

    /// Promote an anonymous session to `identity`, keeping the session id
    ///
    /// The session continues under the anonymous principal's id, whose user
    /// record is flipped in place, so content written while anonymous stays
    /// attributed. If `identity` already belongs to another account, the
    /// principal is linked to it and the session moves to that account. The
    /// provider's own subject travels in the token as `provider_subject`.
    ///
    /// # Errors
    ///
    /// Returns `INVALID_REQUEST` if the session is already authenticated,
    /// `SESSION_NOT_FOUND`, or a directory or signing failure
    pub async fn upgrade_session(
        &self,
        session_id: &str,
        identity: &VerifiedIdentity,
    ) -> Result<SignedSession, AuthError> {
        if identity.is_anonymous() {
            return Err(AuthError::invalid_request(
                "An anonymous identity cannot upgrade a session",
            ));
        }

        let current = self.sessions.get(session_id).await?;
        let user_id = match current.principal_id.as_deref() {
            Some(principal_id) if current.is_anonymous => match &self.anonymous {
                Some(anonymous) => anonymous.promote(principal_id, identity).await?,
                None => principal_id.to_string(),
            },
            _ => identity.id.clone(),
        };

        let session = self.sessions.migrate_to_user(session_id, &user_id).await?;

        let mut continued = identity.clone();
        if continued.id != user_id {
            continued
                .metadata
                .insert("provider_subject".to_string(), serde_json::json!(identity.id));
            continued.id = user_id;
        }
        self.sign_session(&continued, session)
    }

    fn sign_session(
        &self,
        identity: &VerifiedIdentity,
        session: Session,
    ) -> Result<SignedSession, AuthError> {
        let claims = IdentityClaims::from_identity(identity, session.id.clone());
        // Zero means "never" for anonymous claims and "default" for everyone else
        let token = self.tokens.issue_token(&claims, Duration::zero())?;
        Ok(SignedSession { session, token })
    }

    /// Registered OAuth provider by name
    ///
    /// # Errors
    ///
    /// Returns `PROVIDER_NOT_FOUND` when no such OAuth provider is configured
    pub fn oauth_provider(&self, name: &str) -> Result<&Arc<OAuthProvider>, AuthError> {
        self.oauth
            .get(name)
            .ok_or_else(|| AuthError::provider_not_found(name))
    }

    #[must_use]
    pub fn password(&self) -> Option<&Arc<PasswordProvider>> {
        self.password.as_ref()
    }

    #[must_use]
    pub fn magic_link(&self) -> Option<&Arc<MagicLinkProvider>> {
        self.magic_link.as_ref()
    }

    #[must_use]
    pub fn anonymous(&self) -> Option<&Arc<AnonymousProvider>> {
        self.anonymous.as_ref()
    }

    /// Run both cleanup sweeps, returning (sessions, magic-link tokens) removed
    ///
    /// # Errors
    ///
    /// Returns the first store failure
    pub async fn cleanup_expired(&self) -> Result<(usize, usize), AuthError> {
        let sessions = self.sessions.cleanup_expired().await?;
        let tokens = match &self.magic_link {
            Some(magic_link) => magic_link.cleanup_expired_tokens().await?,
            None => 0,
        };
        Ok((sessions, tokens))
    }
}

/// Factory for creating authentication services with dependency injection
pub struct AuthServiceFactory;

impl AuthServiceFactory {
    /// Build every enabled service and register its provider
    ///
    /// OAuth providers that are missing credentials or whose discovery fails are
    /// skipped with a log line; a misconfigured internal provider aborts the build.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing key cannot be loaded or an enabled
    /// internal provider fails its configuration check
    pub async fn build(
        settings: &AuthSettings,
        collaborators: Collaborators,
    ) -> Result<AuthServices> {
        log::info!("🏭 Starting authentication service factory...");

        let tokens = Arc::new(
            TokenService::from_settings(&settings.token)
                .context("Failed to initialise token service")?,
        );
        let state_codec = Arc::new(StateCodec::from_settings(&settings.state));
        let sessions = Arc::new(SessionManager::new(
            collaborators.sessions.clone(),
            settings.session.authenticated_ttl(),
        ));
        let registry = Arc::new(ProviderRegistry::new());

        let oauth = Self::register_oauth_providers(&registry, settings).await;

        let password = if settings.password.enabled {
            let provider = Arc::new(PasswordProvider::new(
                collaborators.users.clone(),
                settings.password.clone(),
            ));
            Self::register(&registry, provider.clone()).await?;
            Some(provider)
        } else {
            LoggingHelper::log_provider_disabled("password");
            None
        };

        let magic_link = if settings.magic_link.enabled {
            let provider = Arc::new(MagicLinkProvider::new(
                collaborators.users.clone(),
                collaborators.magic_links.clone(),
                collaborators.mailer.clone(),
                settings.magic_link.clone(),
            ));
            Self::register(&registry, provider.clone()).await?;
            Some(provider)
        } else {
            LoggingHelper::log_provider_disabled("magic_link");
            None
        };

        let anonymous = if settings.anonymous.enabled {
            let provider = Arc::new(AnonymousProvider::new(
                sessions.clone(),
                Some(collaborators.users.clone()),
                settings.anonymous.clone(),
            ));
            Self::register(&registry, provider.clone()).await?;
            Some(provider)
        } else {
            LoggingHelper::log_provider_disabled("anonymous");
            None
        };

        LoggingHelper::log_providers_summary(&registry.names().await);
        log::info!("🏭 Authentication service factory completed successfully");

        Ok(AuthServices {
            registry,
            tokens,
            state_codec,
            sessions,
            oauth,
            password,
            magic_link,
            anonymous,
        })
    }

    async fn register(registry: &ProviderRegistry, provider: Arc<dyn AuthProvider>) -> Result<()> {
        let name = provider.name().to_string();
        registry
            .register(provider)
            .await
            .with_context(|| format!("Failed to register provider '{name}'"))
    }

    async fn register_oauth_providers(
        registry: &ProviderRegistry,
        settings: &AuthSettings,
    ) -> HashMap<String, Arc<OAuthProvider>> {
        let mut oauth = HashMap::new();

        for provider_settings in &settings.providers {
            if !provider_settings.enabled {
                LoggingHelper::log_provider_disabled(&provider_settings.name);
                continue;
            }

            let provider = match OAuthProvider::discover(provider_settings).await {
                Ok(provider) => Arc::new(provider),
                Err(e) => {
                    log::error!(
                        "❌ Failed to initialize provider {}: {e}",
                        provider_settings.name
                    );
                    continue;
                }
            };

            match registry.register(provider.clone()).await {
                Ok(()) => {
                    oauth.insert(provider_settings.name.clone(), provider);
                }
                Err(e) if e.code == AuthErrorCode::ConfigurationError => {
                    LoggingHelper::log_oauth_provider_not_configured(provider.display_name());
                }
                Err(e) => {
                    log::error!(
                        "❌ Failed to register provider {}: {e}",
                        provider_settings.name
                    );
                }
            }
        }

        if oauth.is_empty() {
            log::info!("⚠️  OAuth authentication is disabled - no configured providers");
        }
        oauth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::TestFixtures;
    use crate::testing::mock::RecordingMailer;

    async fn services(settings: &AuthSettings) -> AuthServices {
        AuthServiceFactory::build(
            settings,
            Collaborators::in_memory(Arc::new(RecordingMailer::new())),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_builds_enabled_providers() {
        let services = services(&TestFixtures::settings()).await;
        assert_eq!(
            services.registry.names().await,
            vec!["anonymous", "google", "magic_link", "password"]
        );
        assert!(services.oauth_provider("google").is_ok());
        assert!(services.password().is_some());
    }

    #[tokio::test]
    async fn test_disabled_and_unconfigured_providers_are_skipped() {
        let mut settings = TestFixtures::settings();
        settings.magic_link.enabled = false;
        settings.providers[0].client_secret = None;

        let services = services(&settings).await;
        assert!(!services.registry.contains("magic_link").await);
        assert!(!services.registry.contains("google").await);
        assert_eq!(
            services.oauth_provider("google").unwrap_err().code,
            AuthErrorCode::ProviderNotFound
        );
    }

    #[tokio::test]
    async fn test_missing_signing_key_aborts() {
        let mut settings = TestFixtures::settings();
        settings.token.private_key_pem = None;
        let result = AuthServiceFactory::build(
            &settings,
            Collaborators::in_memory(Arc::new(RecordingMailer::new())),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_begin_oauth_seals_session_into_state() {
        let services = services(&TestFixtures::settings()).await;
        let redirect = services
            .begin_oauth("google", "/home", Some("session-1"))
            .unwrap();

        assert!(redirect.authorization_url.contains(&redirect.state_token));
        let state = services
            .state_codec
            .decode_for_provider(&redirect.state_token, "google")
            .unwrap();
        assert_eq!(state, redirect.state);
        assert_eq!(state.session_id.as_deref(), Some("session-1"));

        let err = services.begin_oauth("google", "https://evil.example", None).unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_anonymous_sign_in_then_upgrade() {
        let services = services(&TestFixtures::settings()).await;
        let identity = services
            .authenticate(
                "anonymous",
                &Credential::Anonymous {
                    username: "river42".to_string(),
                },
            )
            .await
            .unwrap();

        let signed = services.sign_in(&identity).await.unwrap();
        let claims = services.tokens.verify_token(&signed.token).unwrap();
        assert!(claims.is_anonymous());
        assert!(claims.exp.is_none());
        assert_eq!(claims.session_id(), signed.session.id);

        let anonymous_owner = claims.user_id().map(str::to_string);
        assert_eq!(anonymous_owner.as_deref(), Some(identity.id.as_str()));

        let verified = VerifiedIdentity::new("user-77", "google");
        let upgraded = services
            .upgrade_session(&signed.session.id, &verified)
            .await
            .unwrap();
        assert_eq!(upgraded.session.id, signed.session.id);
        assert_eq!(upgraded.session.principal_id, signed.session.principal_id);
        let claims = services.tokens.verify_token(&upgraded.token).unwrap();
        // Content owner is unchanged across the upgrade
        assert_eq!(claims.user_id().map(str::to_string), anonymous_owner);
        assert_eq!(claims.identity.metadata["provider_subject"], "user-77");
        assert!(!claims.is_anonymous());
        assert!(claims.exp.is_some());

        // Second migration is refused
        let err = services
            .upgrade_session(&signed.session.id, &VerifiedIdentity::new("user-78", "password"))
            .await
            .unwrap_err();
        assert_eq!(err.code, AuthErrorCode::InvalidRequest);
        let session = services.sessions.get(&signed.session.id).await.unwrap();
        assert_eq!(session.user_id, anonymous_owner);
    }
}
