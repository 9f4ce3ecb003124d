//! Input validation shared by the providers and the state codec
//!
//! Email syntax, password strength, anonymous usernames and post-login
//! redirect targets.

use crate::settings::PasswordPolicy;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+",
        r"@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?",
        r"(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$",
    ))
    .expect("email pattern is valid")
});

static USERNAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("username pattern is valid"));

// Path traversal, protocol-relative and control characters
static SUSPICIOUS_REDIRECT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\.\.|^/{2,}|\\|[\x00-\x1F\x7F]|%(?:00|0[aAdD]|09|5c)")
        .expect("redirect pattern is valid")
});

const MAX_EMAIL_LENGTH: usize = 254;
const MAX_REDIRECT_LENGTH: usize = 2048;

/// Syntactic email check; no deliverability lookup
#[must_use]
pub fn is_valid_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LENGTH && EMAIL_PATTERN.is_match(email)
}

/// Lower-case and trim an email for lookups
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Check a password against the configured policy
///
/// # Errors
///
/// Returns the list of unmet requirements
pub fn validate_password_strength(
    password: &str,
    policy: &PasswordPolicy,
) -> Result<(), Vec<String>> {
    let mut problems = Vec::new();

    if password.chars().count() < policy.min_length {
        problems.push(format!(
            "must be at least {} characters long",
            policy.min_length
        ));
    }
    if policy.require_uppercase && !password.chars().any(char::is_uppercase) {
        problems.push("must contain an uppercase letter".to_string());
    }
    if policy.require_lowercase && !password.chars().any(char::is_lowercase) {
        problems.push("must contain a lowercase letter".to_string());
    }
    if policy.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
        problems.push("must contain a digit".to_string());
    }
    if policy.require_symbol && !password.chars().any(|c| !c.is_alphanumeric()) {
        problems.push("must contain a symbol".to_string());
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

/// Validate an anonymous username
///
/// # Errors
///
/// Returns a human readable reason when the username is rejected
pub fn validate_username(username: &str, min_len: usize, max_len: usize) -> Result<(), String> {
    if username.trim().is_empty() {
        return Err("username is required".to_string());
    }
    let len = username.chars().count();
    if len < min_len || len > max_len {
        return Err(format!(
            "username must be between {min_len} and {max_len} characters"
        ));
    }
    if !USERNAME_PATTERN.is_match(username) {
        return Err(
            "username may only contain letters, digits, '.', '_' and '-'".to_string(),
        );
    }
    Ok(())
}

/// Validate a post-authentication redirect target
///
/// Only same-site relative paths are accepted, which rules out open redirects
/// through the OAuth round trip.
///
/// # Errors
///
/// Returns a reason when the target is not a safe relative path
pub fn validate_redirect_target(target: &str) -> Result<(), String> {
    if target.len() > MAX_REDIRECT_LENGTH {
        warn!("Excessively long redirect target: {} characters", target.len());
        return Err("redirect target is too long".to_string());
    }
    if !target.starts_with('/') || target.starts_with("//") || target.contains("://") {
        warn!("Rejected non-relative redirect target");
        return Err("redirect target must be a relative path".to_string());
    }
    if SUSPICIOUS_REDIRECT_PATTERN.is_match(target) {
        warn!("Suspicious pattern detected in redirect target");
        return Err("redirect target contains forbidden characters".to_string());
    }
    if let Ok(decoded) = urlencoding::decode(target) {
        if decoded != target && SUSPICIOUS_REDIRECT_PATTERN.is_match(&decoded) {
            warn!("Encoded attack pattern detected in redirect target");
            return Err("redirect target contains forbidden characters".to_string());
        }
    }
    Ok(())
}
