//! HTTP client middleware.

pub mod auth;

pub use auth::{Credential, CredentialMiddleware};
