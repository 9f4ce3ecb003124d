//! Session lifecycle
//!
//! - [`manager`] - create, migrate, validate, refresh and revoke sessions

pub mod manager;

pub use manager::{SessionError, SessionManager};
