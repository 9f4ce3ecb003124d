//! Testing utilities shared by unit and integration tests
//!
//! Compiled for `cfg(test)` and behind the `testing` feature so integration
//! tests under `tests/` can reach them.
//!
//! - [`fixtures`] - test keys, settings and pre-built records
//! - [`mock`] - recording and failing collaborator implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pinauth::testing::{fixtures::TestFixtures, mock::RecordingMailer};
//!
//! let settings = TestFixtures::settings();
//! let mailer = std::sync::Arc::new(RecordingMailer::new());
//! ```

pub mod fixtures;
pub mod mock;

pub use fixtures::TestFixtures;

/// Common test constants
pub mod constants {
    pub const TEST_CLIENT_ID: &str = "test-client-id";

    pub const TEST_CLIENT_SECRET: &str = "test-client-secret";

    /// Callback registered with OAuth test providers
    pub const TEST_REDIRECT_URL: &str = "https://app.example.com/oauth2/callback";

    /// Secret for the state codec in test settings
    pub const TEST_STATE_SECRET: &str = "test-state-secret-not-for-production";
}
