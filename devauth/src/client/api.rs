//! Form-encoded HTTP transport.

use std::time::Duration;

use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use url::Url;

use crate::client::middleware::{Credential, CredentialMiddleware};
use crate::error::{DevauthError, Result};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Status code and full body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
}

impl RawResponse {
    /// Whether the status is exactly 200.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Posts URL-encoded forms and hands back every response, 4xx and 5xx included.
///
/// Only network-level failures become errors; they are never retried.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ClientWithMiddleware,
}

impl HttpTransport {
    /// Create a transport with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let inner_client = Client::builder()
            .user_agent(format!("devauth/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        let client = ClientBuilder::new(inner_client)
            .with(CredentialMiddleware::new())
            .build();

        Ok(Self { client })
    }

    /// POST `form` to `url`, authorized by `credential`.
    ///
    /// # Errors
    ///
    /// Returns [`DevauthError::InvalidCredentials`] if the credential cannot be
    /// carried in a header; nothing is sent then. Otherwise fails only if the
    /// request could not be completed.
    pub async fn post_form<K, V>(
        &self,
        url: &Url,
        form: &[(K, V)],
        credential: Credential,
    ) -> Result<RawResponse>
    where
        K: serde::Serialize + Sync,
        V: serde::Serialize + Sync,
    {
        if credential.to_header().is_err() {
            return Err(DevauthError::InvalidCredentials(credential.field().to_string()));
        }
        tracing::debug!(%url, scheme = credential.scheme(), "POST");

        let response = self
            .client
            .post(url.clone())
            .with_extension(credential)
            .form(form)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        tracing::debug!(%url, status, "Response received");

        Ok(RawResponse { status, body })
    }
}
