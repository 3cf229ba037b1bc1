//! devauth - OAuth2 device-code sessions for headless clients.
//!
//! A CLI or embedded device without a browser or redirect URI authenticates
//! by showing the user a verification page and code, polling until the user
//! approves, then persisting and refreshing bearer tokens transparently for
//! every API call.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod storage;

pub use auth::{AuthSession, CredentialStore, DeviceAuthorization, Endpoints, PollPolicy, SessionState};
pub use error::{DevauthError, Result};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};
