//! Error types and result aliases for devauth.
//!
//! Errors fall into two groups:
//! - Protocol lifecycle failures (validation, state, response shape,
//!   HTTP status, API status, cancellation)
//! - Ambient failures (network, storage, configuration, serialization)

use thiserror::Error;

/// Main error type for devauth operations.
///
/// Use [`requires_reauth`](Self::requires_reauth) and [`is_retriable`](Self::is_retriable)
/// to decide how a caller should react.
#[derive(Error, Debug)]
pub enum DevauthError {
    /// Attempt to store an absent (null) credential value.
    #[error("Invalid {key}: refusing to store a null value. Delete the key instead.")]
    Validation {
        /// The credential key that was being written.
        key: String,
    },

    /// Operation invoked in the wrong lifecycle state.
    #[error("{0}")]
    State(String),

    /// A successful HTTP response whose JSON body lacks a required field.
    #[error("Response is missing {0}")]
    ApiShape(String),

    /// Non-200 status from the device-code or token endpoint, or poll exhaustion.
    #[error("Protocol error {status}: {body}")]
    Protocol {
        /// HTTP status code of the last response.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// HTTP 200 with an API-level status other than `ok`.
    #[error("API error: {0}")]
    Api(String),

    /// The device-code poll loop was cancelled by the caller.
    #[error("Authentication was cancelled before the device code was approved.")]
    Cancelled,

    /// A stored credential value has the wrong type.
    #[error("Stored credential '{0}' is malformed. Run 'devauth logout' then 'devauth login'.")]
    InvalidCredentials(String),

    /// Request timed out.
    #[error("Request timed out. The server may be slow or unreachable. Try again later.")]
    Timeout,

    /// Server is unreachable (connection failed).
    #[error("Server is unavailable. Check your network connection or try again later.")]
    Unavailable,

    /// Network error during HTTP request.
    #[error("Network error: {0}. Check your internet connection.")]
    Network(String),

    /// Failed to access the OS keyring.
    #[error("Failed to access credential storage: {0}. Ensure your system keyring is unlocked.")]
    CredentialStorage(String),

    /// General configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}. Check file permissions and format.")]
    ConfigRead(String),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON or TOML serialization/deserialization failed.
    #[error("Data serialization error: {0}. This may indicate corrupted data.")]
    Serialization(String),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl DevauthError {
    /// Checks if this error can be resolved by logging in again.
    #[must_use]
    pub const fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::InvalidCredentials(_) | Self::Cancelled | Self::Protocol { status: 401, .. }
        )
    }

    /// Checks if this error is transient and the operation might succeed on retry.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout | Self::Unavailable)
    }
}

/// Result type alias using [`DevauthError`].
pub type Result<T> = std::result::Result<T, DevauthError>;

impl From<serde_json::Error> for DevauthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {err}"))
    }
}

impl From<toml::de::Error> for DevauthError {
    fn from(err: toml::de::Error) -> Self {
        Self::ConfigRead(format!("TOML parse error: {err}"))
    }
}

impl From<keyring::Error> for DevauthError {
    fn from(err: keyring::Error) -> Self {
        Self::CredentialStorage(err.to_string())
    }
}

impl From<reqwest::Error> for DevauthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unavailable
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for DevauthError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(inner) => inner.into(),
            reqwest_middleware::Error::Middleware(inner) => Self::Network(inner.to_string()),
        }
    }
}
