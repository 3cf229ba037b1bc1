//! Authentication middleware for injecting Basic or Bearer credentials.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::InvalidHeaderValue;
use http::{Extensions, HeaderValue};
use oauth2::{AccessToken, ClientId, ClientSecret};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result};

/// Proof of authorization attached to one outbound request.
///
/// Chosen fresh per request: a valid access token yields `Bearer`, anything
/// else falls back to the client's own `Basic` identity.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Client id and secret, sent as `Basic base64(id:secret)`.
    Basic {
        client_id: ClientId,
        client_secret: ClientSecret,
    },
    /// User access token, sent as `Bearer <token>`.
    Bearer(AccessToken),
}

impl Credential {
    /// Renders the `Authorization` header value.
    #[must_use]
    pub fn header_value(&self) -> String {
        match self {
            Self::Basic {
                client_id,
                client_secret,
            } => {
                let pair = format!("{}:{}", client_id.as_str(), client_secret.secret());
                format!("Basic {}", STANDARD.encode(pair))
            },
            Self::Bearer(token) => format!("Bearer {}", token.secret()),
        }
    }

    /// The header value, marked sensitive.
    ///
    /// Fails when the secret holds bytes a header cannot carry.
    pub fn to_header(&self) -> std::result::Result<HeaderValue, InvalidHeaderValue> {
        let mut value = HeaderValue::from_str(&self.header_value())?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Name of the stored field this credential comes from.
    #[must_use]
    pub const fn field(&self) -> &'static str {
        match self {
            Self::Basic { .. } => "client_secret",
            Self::Bearer(_) => "access_token",
        }
    }

    /// Short label for logs; never includes the secret.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Basic { .. } => "basic",
            Self::Bearer(_) => "bearer",
        }
    }
}

/// Middleware that renders the request's [`Credential`] extension into the
/// `Authorization` header.
#[derive(Debug, Default)]
pub struct CredentialMiddleware;

impl CredentialMiddleware {
    /// Create a new credential middleware.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for CredentialMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if let Some(credential) = extensions.get::<Credential>() {
            let value = credential.to_header().map_err(|err| {
                tracing::warn!(
                    scheme = credential.scheme(),
                    "Credential contains characters not allowed in a header"
                );
                reqwest_middleware::Error::middleware(err)
            })?;
            req.headers_mut().insert(http::header::AUTHORIZATION, value);
        }

        next.run(req, extensions).await
    }
}
