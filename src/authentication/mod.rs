//! Service factory wiring settings and collaborators into a ready-to-use core

pub mod factory;

pub use factory::{
    AuthServiceFactory, AuthServices, Collaborators, OAuthRedirect, SignedSession,
};
