//! Per-request identity propagation
//!
//! The boundary verifies the bearer token once and runs the rest of the request
//! inside [`RequestIdentity::scope`]. Downstream code reads it back with
//! [`RequestIdentity::current`]. No claims means anonymous, never an error;
//! requiring authentication is a boundary policy.

use std::future::Future;
use std::sync::Arc;

use crate::error::{AuthError, AuthErrorCode};
use crate::token::{Claims, TokenService};

tokio::task_local! {
    static CURRENT_IDENTITY: RequestIdentity;
}

/// Verified claims attached to the in-flight request, if any
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestIdentity {
    claims: Option<Arc<Claims>>,
}

impl RequestIdentity {
    #[must_use]
    pub fn new(claims: Claims) -> Self {
        Self {
            claims: Some(Arc::new(claims)),
        }
    }

    /// Identity of a request that carried no token
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Verify an `Authorization` header value
    ///
    /// A missing header yields [`Self::none`]; a present but invalid token is an
    /// error so the boundary can answer 401 instead of silently downgrading.
    ///
    /// # Errors
    ///
    /// Returns `TOKEN_INVALID` for a non-bearer scheme or a token that fails
    /// verification, `TOKEN_EXPIRED` for an expired one
    pub fn from_bearer_header(
        tokens: &TokenService,
        header: Option<&str>,
    ) -> Result<Self, AuthError> {
        let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
            return Ok(Self::none());
        };
        let token = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AuthError::new(
                    AuthErrorCode::TokenInvalid,
                    "Authorization header must use the Bearer scheme",
                )
            })?;

        Ok(Self::new(tokens.verify_token(token)?))
    }

    #[must_use]
    pub fn claims(&self) -> Option<&Claims> {
        self.claims.as_deref()
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.claims.as_ref().and_then(|c| c.user_id())
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.claims.as_ref().map(|c| c.session_id())
    }

    /// True for anonymous claims and for requests without claims
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.claims.as_ref().map_or(true, |c| c.is_anonymous())
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        !self.is_anonymous()
    }

    /// Run `fut` with this identity visible through [`Self::current`]
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT_IDENTITY.scope(self, fut).await
    }

    /// Identity of the enclosing [`Self::scope`], or [`Self::none`] outside one
    #[must_use]
    pub fn current() -> Self {
        CURRENT_IDENTITY
            .try_with(Clone::clone)
            .unwrap_or_default()
    }
}
