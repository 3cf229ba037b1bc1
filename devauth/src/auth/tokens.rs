//! Session states and the wire shapes of the auth endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Derived authentication state of a credential record.
///
/// Computed on every read, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No usable credentials.
    Unauthenticated,
    /// A device code was issued and no refresh token exists yet.
    Authenticating,
    /// A refresh token exists but no valid access token.
    Refreshing,
    /// A non-expired access token exists.
    Authenticated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Refreshing => write!(f, "refreshing"),
            Self::Authenticated => write!(f, "authenticated"),
        }
    }
}

/// What the user needs to approve a device: a page to visit and the code to enter there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    /// Verification page, always carrying an `http://` or `https://` scheme.
    pub verification_url: String,
    /// Code to enter on the verification page.
    pub device_code: String,
}

/// Response from the device-code endpoint.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeviceCodeResponse {
    pub device_code: Option<String>,
    pub verification_url: Option<String>,
    pub expires_in_s: Option<f64>,
    /// Suggested poll interval in seconds.
    pub interval: Option<f64>,
}

/// Response from the token endpoint. Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenResponse {
    pub token_type: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<f64>,
}

/// Envelope of every API endpoint response.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApiEnvelope {
    pub status: Option<String>,
    #[serde(default)]
    pub result: Value,
    pub message: Option<String>,
}

/// Parses a JSON body, treating a literal `null` as the default (empty) object.
pub(crate) fn parse_body<T>(body: &str) -> serde_json::Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    Ok(serde_json::from_str::<Option<T>>(body)?.unwrap_or_default())
}

/// Prepends `https://` to a verification URL that carries no scheme.
pub(crate) fn normalize_verification_url(url: &str) -> String {
    if url.contains("http://") || url.contains("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}
