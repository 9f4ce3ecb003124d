#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Authentication and identity-session core
//!
//! Pluggable providers (federated OAuth, password, magic link, anonymous)
//! dispatched through a [`ProviderRegistry`], RS256 identity tokens, encrypted
//! OAuth state and a session lifecycle that carries an anonymous principal over
//! to a verified one without changing its session id.

/// Version of the pinauth library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod authentication;
pub mod context;
pub mod error;
pub mod models;
pub mod providers;
pub mod registry;
pub mod session;
pub mod settings;
pub mod state;
pub mod store;
pub mod token;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use authentication::{AuthServiceFactory, AuthServices, Collaborators};
pub use context::RequestIdentity;
pub use error::{AuthError, AuthErrorCode, StoreError};
pub use models::{MagicLinkToken, NewUser, Session, User, UserStatus, VerifiedIdentity};
pub use providers::{AuthProvider, Credential, ProviderKind};
pub use registry::ProviderRegistry;
pub use session::SessionManager;
pub use settings::AuthSettings;
pub use state::{OAuthState, StateCodec};
pub use token::{Claims, IdentityClaims, TokenService};
