// Centralized logging utilities to keep provider and factory logging consistent
use log::{debug, info, warn};

pub struct LoggingHelper;

impl LoggingHelper {
    /// Log provider registration status
    pub fn log_provider_registered(name: &str, kind: &str) {
        info!("✅ Provider '{name}' registered ({kind})");
    }

    /// Log a provider rejected at registration time
    pub fn log_provider_rejected(name: &str, reason: &str) {
        warn!("❌ Provider '{name}' rejected: {reason}");
    }

    /// Log that a provider is disabled in configuration
    pub fn log_provider_disabled(name: &str) {
        info!("⏭️  Provider {name} is disabled, skipping");
    }

    /// Log that an OAuth provider is missing its client credentials
    pub fn log_oauth_provider_not_configured(display_name: &str) {
        info!("❌ {display_name} OAuth2 not configured - missing client credentials");
    }

    /// Log summary of registered providers
    pub fn log_providers_summary(provider_names: &[String]) {
        info!("🎯 Registered authentication providers: {provider_names:?}");
    }

    /// Log the outcome of an authentication attempt without leaking credentials
    pub fn log_authentication(provider: &str, outcome: Result<&str, &str>) {
        match outcome {
            Ok(identity_id) => info!("🔐 Authenticated identity {identity_id} via {provider}"),
            Err(code) => debug!("Authentication via {provider} failed with {code}"),
        }
    }

    /// Log token exchange start
    pub fn log_token_exchange_start(provider: &str) {
        debug!("🔄 Exchanging authorization code for tokens with {provider}");
    }

    /// Log token exchange summary
    pub fn log_token_exchange_summary(
        provider: &str,
        id_token_present: bool,
        refresh_token_present: bool,
        token_type: &str,
    ) {
        debug!(
            "🔍 Token exchange summary for {provider}: \
             id_token={}, refresh_token={}, token_type={token_type}",
            if id_token_present { "present" } else { "missing" },
            if refresh_token_present { "present" } else { "missing" },
        );
    }

    /// Log a best-effort operation that failed but did not abort the caller
    pub fn log_best_effort_failure(operation: &str, subject: &str, err: &dyn std::fmt::Display) {
        warn!("⚠️  Best-effort {operation} failed for {subject}: {err}");
    }

    /// Log the result of a cleanup sweep
    pub fn log_cleanup(kind: &str, removed: usize) {
        if removed > 0 {
            info!("🧹 Removed {removed} expired {kind}");
        } else {
            debug!("🧹 No expired {kind} to remove");
        }
    }
}
