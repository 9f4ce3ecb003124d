//! Name -> provider map shared across request handlers
//!
//! Registration happens at startup and dispatch on every request, so the map
//! sits behind a reader/writer lock. Registration fails closed: a provider is
//! only inserted after its `validate_config` passes and its name is free.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::AuthError;
use crate::models::VerifiedIdentity;
use crate::providers::{AuthProvider, Credential};
use crate::utils::logging::LoggingHelper;

#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn AuthProvider>>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert a provider under its own name
    ///
    /// # Errors
    ///
    /// Returns the provider's `CONFIGURATION_ERROR` when its self-check fails, or
    /// `INVALID_REQUEST` when the name is already taken
    pub async fn register(&self, provider: Arc<dyn AuthProvider>) -> Result<(), AuthError> {
        let name = provider.name().to_string();
        if let Err(e) = provider.validate_config() {
            LoggingHelper::log_provider_rejected(&name, &e.message);
            return Err(e);
        }

        let mut providers = self.providers.write().await;
        if providers.contains_key(&name) {
            LoggingHelper::log_provider_rejected(&name, "name already registered");
            return Err(AuthError::invalid_request(format!(
                "Provider '{name}' is already registered"
            )));
        }
        LoggingHelper::log_provider_registered(&name, provider.kind().as_str());
        providers.insert(name, provider);
        Ok(())
    }

    /// Remove a provider, returning it if it was registered
    pub async fn unregister(&self, name: &str) -> Option<Arc<dyn AuthProvider>> {
        self.providers.write().await.remove(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn AuthProvider>> {
        self.providers.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.providers.read().await.contains_key(name)
    }

    /// Registered names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.providers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.read().await.is_empty()
    }

    /// Dispatch a credential to the named provider
    ///
    /// # Errors
    ///
    /// Returns `PROVIDER_NOT_FOUND` for unknown names, otherwise whatever the
    /// provider returns
    pub async fn authenticate(
        &self,
        name: &str,
        credential: &Credential,
    ) -> Result<VerifiedIdentity, AuthError> {
        // Lock is released before the provider does any I/O
        let provider = self
            .get(name)
            .await
            .ok_or_else(|| AuthError::provider_not_found(name))?;

        let result = provider.authenticate(credential).await;
        LoggingHelper::log_authentication(
            name,
            result
                .as_ref()
                .map(|identity| identity.id.as_str())
                .map_err(|e| e.code.as_str()),
        );
        result
    }
}
