//! Authentication module for devauth.
//!
//! This module provides the OAuth2 device-code session: an expiry-aware
//! credential store over any key-value backend, and the session that drives
//! device-code issuance, polling, refresh and authenticated API calls.

pub mod clock;
pub mod credentials;
pub mod session;
pub mod tokens;

pub use clock::{Clock, SystemClock};
pub use credentials::{keys, CredentialStore};
pub use session::{AuthSession, Endpoints, PollPolicy};
pub use tokens::{DeviceAuthorization, SessionState};
