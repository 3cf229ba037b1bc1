//! HTTP transport and middleware.

pub mod api;
pub mod middleware;

pub use api::{HttpTransport, RawResponse, DEFAULT_TIMEOUT_SECS};
pub use middleware::Credential;
