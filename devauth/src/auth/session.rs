//! Device-code grant flow, token refresh and API call dispatch.
//!
//! The flow has two entry points. [`AuthSession::begin_authentication`] asks
//! the device-code endpoint for a code and a verification page the user
//! visits out-of-band. [`AuthSession::complete_authentication`] then polls the
//! token endpoint until the code is approved or the attempt budget runs out.
//! After that every [`AuthSession::call`] attaches the access token,
//! refreshing it first when only a refresh token is left.

use std::collections::BTreeMap;
use std::time::Duration;

use oauth2::{AccessToken, ClientId, ClientSecret, DeviceAuthorizationUrl, TokenUrl};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::clock::expiry_after;
use crate::auth::credentials::{keys, CredentialStore};
use crate::auth::tokens::{
    normalize_verification_url, parse_body, ApiEnvelope, DeviceAuthorization, DeviceCodeResponse,
    SessionState, TokenResponse,
};
use crate::client::{Credential, HttpTransport, RawResponse, DEFAULT_TIMEOUT_SECS};
use crate::error::{DevauthError, Result};

/// Default API endpoint.
pub const DEFAULT_API_ENDPOINT: &str = "https://services.example.com/api/1/";
/// Default device-code endpoint.
pub const DEFAULT_DEVICE_CODE_URL: &str = "https://services.example.com/oauth2/device/code/generate";
/// Default token endpoint.
pub const DEFAULT_TOKEN_URL: &str = "https://services.example.com/oauth2/token";

/// Poll interval used when the server suggested none.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Nominal time budget of the device-code poll loop.
pub const DEFAULT_POLL_BUDGET: Duration = Duration::from_secs(600);

/// The three remote endpoints a session talks to.
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// Endpoint receiving every API call.
    pub api: Url,
    /// Endpoint issuing device codes.
    pub device_code: DeviceAuthorizationUrl,
    /// Endpoint exchanging device codes and refresh tokens for access tokens.
    pub token: TokenUrl,
}

impl Endpoints {
    /// Resolves endpoints, falling back to the defaults for every `None`.
    ///
    /// # Errors
    ///
    /// Returns [`DevauthError::InvalidUrl`] if any URL cannot be parsed.
    pub fn new(api: Option<&str>, device_code: Option<&str>, token: Option<&str>) -> Result<Self> {
        Ok(Self {
            api: Url::parse(api.unwrap_or(DEFAULT_API_ENDPOINT))?,
            device_code: DeviceAuthorizationUrl::new(
                device_code.unwrap_or(DEFAULT_DEVICE_CODE_URL).to_string(),
            )?,
            token: TokenUrl::new(token.unwrap_or(DEFAULT_TOKEN_URL).to_string())?,
        })
    }

    /// The default endpoints.
    ///
    /// # Errors
    ///
    /// Never fails for the built-in defaults; kept fallible for symmetry with [`Endpoints::new`].
    pub fn defaults() -> Result<Self> {
        Self::new(None, None, None)
    }
}

/// How long and how often [`AuthSession::complete_authentication`] polls.
///
/// The loop makes `budget / interval` attempts, counted down one per attempt
/// while the remainder is positive. Slow requests therefore stretch the real
/// wait past `budget`; set `deadline` to also stop on elapsed wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Interval when the server suggested none.
    pub interval: Duration,
    /// Nominal budget that fixes the attempt count.
    pub budget: Duration,
    /// Optional hard wall-clock cutoff, checked before each attempt.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            budget: DEFAULT_POLL_BUDGET,
            deadline: None,
        }
    }
}

/// One client identity authenticating against one credential record.
///
/// Mutating operations take `&mut self`, so a session can never run two
/// flows at once. Sessions sharing a backing store must be serialized by
/// the caller.
#[derive(Debug)]
pub struct AuthSession {
    client_id: ClientId,
    client_secret: ClientSecret,
    store: CredentialStore,
    endpoints: Endpoints,
    poll: PollPolicy,
    transport: HttpTransport,
}

impl AuthSession {
    /// Creates a session with default endpoints and poll policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        store: CredentialStore,
    ) -> Result<Self> {
        Ok(Self {
            client_id: ClientId::new(client_id.into()),
            client_secret: ClientSecret::new(client_secret.into()),
            store,
            endpoints: Endpoints::defaults()?,
            poll: PollPolicy::default(),
            transport: HttpTransport::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))?,
        })
    }

    /// Replaces the endpoints.
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Replaces the poll policy.
    #[must_use]
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Replaces the HTTP transport.
    #[must_use]
    pub fn with_transport(mut self, transport: HttpTransport) -> Self {
        self.transport = transport;
        self
    }

    /// The credential store.
    pub const fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// The credential store, mutably.
    pub fn store_mut(&mut self) -> &mut CredentialStore {
        &mut self.store
    }

    /// The resolved endpoints.
    pub const fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// The client identifier.
    pub fn client_id(&self) -> &str {
        self.client_id.as_str()
    }

    /// Derived state of the credential record.
    pub fn state(&self) -> Result<SessionState> {
        self.store.state()
    }

    /// Forgets every session credential.
    pub fn logout(&mut self) -> Result<()> {
        self.store.logout()
    }

    /// Requests a device code and returns what the user must see.
    ///
    /// A stale in-flight or completed login is discarded first. Nothing is
    /// shown or opened here; presenting the result is up to the caller.
    ///
    /// # Errors
    ///
    /// - [`DevauthError::Protocol`] for a non-200 status
    /// - [`DevauthError::ApiShape`] if `verification_url`, `device_code` or
    ///   `expires_in_s` is missing; nothing is stored in that case
    pub async fn begin_authentication(&mut self) -> Result<DeviceAuthorization> {
        if self.store.authenticating()? || self.store.authenticated()? {
            tracing::info!("Beginning authentication while already logged in");
            self.store.logout()?;
        }

        tracing::debug!("Requesting a new device code");
        let form = [("client_id", self.client_id.as_str())];
        let response = self.request(self.endpoints.device_code.url(), &form).await?;

        if !response.is_ok() {
            return Err(DevauthError::Protocol {
                status: response.status,
                body: response.body,
            });
        }

        let payload: DeviceCodeResponse = parse_body(&response.body)?;
        let url = payload
            .verification_url
            .ok_or_else(|| DevauthError::ApiShape("verification_url".to_string()))?;
        let device_code = payload
            .device_code
            .ok_or_else(|| DevauthError::ApiShape("device_code".to_string()))?;
        let expires = payload
            .expires_in_s
            .and_then(|secs| expiry_after(self.store.now(), secs))
            .ok_or_else(|| DevauthError::ApiShape("expires_in_s".to_string()))?;

        self.store.set(keys::DEVICE_CODE, device_code.as_str())?;
        self.store.set_expiry(keys::DEVICE_EXPIRES, expires)?;
        if let Some(interval) = payload.interval.filter(|secs| *secs > 0.0) {
            self.store.set(keys::DEVICE_INTERVAL, interval)?;
        }

        Ok(DeviceAuthorization {
            verification_url: normalize_verification_url(&url),
            device_code,
        })
    }

    /// Blocks until the device code is approved or the attempt budget is spent.
    ///
    /// # Errors
    ///
    /// - [`DevauthError::State`] without a valid device code
    /// - [`DevauthError::Protocol`] with the last status and body once the
    ///   attempts are exhausted
    pub async fn complete_authentication(&mut self) -> Result<()> {
        self.complete_authentication_with(&CancellationToken::new()).await
    }

    /// Like [`complete_authentication`](Self::complete_authentication), aborting
    /// with [`DevauthError::Cancelled`] once `cancel` fires.
    ///
    /// Cancellation only stops the loop; whatever was already stored stays.
    pub async fn complete_authentication_with(&mut self, cancel: &CancellationToken) -> Result<()> {
        if self.store.device_code()?.is_none() {
            return Err(DevauthError::State(
                "Cannot finish authenticating without a valid device code. Call begin_authentication first."
                    .to_string(),
            ));
        }

        tracing::debug!("Checking if the device code has been authorized");
        let interval = self
            .store
            .device_interval()?
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|interval| !interval.is_zero())
            .unwrap_or(if self.poll.interval.is_zero() {
                DEFAULT_POLL_INTERVAL
            } else {
                self.poll.interval
            });

        let started = Instant::now();
        let mut remaining = self.poll.budget.as_secs_f64() / interval.as_secs_f64();
        let mut last_response = None;

        while !self.store.authenticated()? && remaining > 0.0 {
            if let Some(deadline) = self.poll.deadline {
                if started.elapsed() >= deadline {
                    tracing::warn!(?deadline, "Device authorization deadline reached");
                    break;
                }
            }

            remaining -= 1.0;
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Self::cancelled()),
                response = self.check_device_code() => response?,
            };
            last_response = Some(response);

            if !self.store.authenticated()? {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(Self::cancelled()),
                    () = tokio::time::sleep(interval) => {},
                }
            }
        }

        if self.store.authenticated()? {
            tracing::info!("Device authorized");
            return Ok(());
        }

        match last_response {
            Some(response) => Err(DevauthError::Protocol {
                status: response.status,
                body: response.body,
            }),
            None => Err(DevauthError::State(
                "Device authorization deadline passed before the first poll".to_string(),
            )),
        }
    }

    /// Exchanges the stored refresh token for a new access token.
    ///
    /// A non-200 answer is returned, not raised.
    ///
    /// # Errors
    ///
    /// Returns [`DevauthError::State`] without a refresh token, or a transport error.
    pub async fn refresh_access_token(&mut self) -> Result<RawResponse> {
        let refresh_token = self
            .store
            .refresh_token()?
            .ok_or_else(|| DevauthError::State("No refresh token to exchange".to_string()))?;
        self.exchange_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ])
        .await
    }

    /// Calls `method` on the API endpoint and returns the raw response.
    ///
    /// Without a valid access token but with a refresh token, a refresh is
    /// attempted first; its outcome is ignored and the call goes out either
    /// way. `method` and `client_id` always override same-named `params`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if a request could not be completed.
    pub async fn call_raw<I, K, V>(&mut self, method: &str, params: I) -> Result<RawResponse>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut form: Vec<(String, String)> = params
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .filter(|(key, _)| key != "method" && key != "client_id")
            .collect();
        form.push(("method".to_string(), method.to_string()));
        form.push(("client_id".to_string(), self.client_id.as_str().to_string()));

        if self.store.access_token()?.is_none() && self.store.refresh_token()?.is_some() {
            tracing::debug!("Access token missing or expired, refreshing before call");
            let refreshed = self.refresh_access_token().await?;
            if !refreshed.is_ok() {
                tracing::debug!(status = refreshed.status, "Refresh failed, calling anyway");
            }
        }

        self.request(&self.endpoints.api, form.as_slice()).await
    }

    /// Calls `method` and returns the `result` of an `ok` response.
    ///
    /// # Errors
    ///
    /// - [`DevauthError::Protocol`] for a non-200 status
    /// - [`DevauthError::Api`] with the server's message for any other status
    /// - [`DevauthError::ApiShape`] if `status`, or `message` on failure, is missing
    pub async fn call<I, K, V>(&mut self, method: &str, params: I) -> Result<Value>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let response = self.call_raw(method, params).await?;
        if !response.is_ok() {
            return Err(DevauthError::Protocol {
                status: response.status,
                body: response.body,
            });
        }

        let envelope: ApiEnvelope = parse_body(&response.body)?;
        match envelope.status.as_deref() {
            Some("ok") => Ok(envelope.result),
            Some(_) => {
                let message = envelope
                    .message
                    .ok_or_else(|| DevauthError::ApiShape("message".to_string()))?;
                Err(DevauthError::Api(message))
            },
            None => Err(DevauthError::ApiShape("status".to_string())),
        }
    }

    /// Invokes any remote method by name with string parameters.
    pub async fn invoke(&mut self, method: &str, params: &BTreeMap<String, String>) -> Result<Value> {
        self.call(method, params.clone()).await
    }

    async fn check_device_code(&mut self) -> Result<RawResponse> {
        let device_code = match self.store.get(keys::DEVICE_CODE)? {
            Some(Value::String(code)) => code,
            _ => {
                return Err(DevauthError::State(
                    "Device code disappeared while polling".to_string(),
                ))
            },
        };
        self.exchange_token(&[
            ("grant_type", "device_code"),
            ("device_code", device_code.as_str()),
        ])
        .await
    }

    /// Posts a grant to the token endpoint and stores whatever it returns.
    ///
    /// Fields missing from the response leave the stored values untouched.
    async fn exchange_token(&mut self, form: &[(&str, &str)]) -> Result<RawResponse> {
        let response = self.request(self.endpoints.token.url(), form).await?;

        if response.is_ok() {
            let payload: TokenResponse = parse_body(&response.body)?;
            if let Some(token_type) = payload.token_type {
                self.store.set(keys::TOKEN_TYPE, token_type)?;
            }
            if let Some(access_token) = payload.access_token {
                self.store.set(keys::ACCESS_TOKEN, access_token)?;
            }
            if let Some(refresh_token) = payload.refresh_token {
                self.store.set(keys::REFRESH_TOKEN, refresh_token)?;
            }
            if let Some(expires_in) = payload.expires_in {
                let expires = expiry_after(self.store.now(), expires_in)
                    .ok_or_else(|| DevauthError::ApiShape("a usable expires_in".to_string()))?;
                self.store.set_expiry(keys::ACCESS_TOKEN_EXPIRES, expires)?;
            }
            tracing::debug!("Successfully authenticated");
        } else {
            tracing::debug!(status = response.status, body = %response.body, "Token response");
        }

        Ok(response)
    }

    /// Bearer while a valid access token exists, otherwise the client's Basic identity.
    fn credential(&self) -> Result<Credential> {
        Ok(match self.store.access_token()? {
            Some(token) => Credential::Bearer(AccessToken::new(token)),
            None => Credential::Basic {
                client_id: self.client_id.clone(),
                client_secret: self.client_secret.clone(),
            },
        })
    }

    async fn request<K, V>(&self, url: &Url, form: &[(K, V)]) -> Result<RawResponse>
    where
        K: serde::Serialize + Sync,
        V: serde::Serialize + Sync,
    {
        let credential = self.credential()?;
        self.transport.post_form(url, form, credential).await
    }

    fn cancelled() -> DevauthError {
        tracing::warn!("Device authorization polling cancelled");
        DevauthError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeyValueStore, MemoryStore};
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_string, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BASIC: &str = "Basic dGVzdF9jbGllbnQ6dGVzdF9zZWNyZXQ=";
    const DEVICE_PATH: &str = "/oauth2/device/code/generate";
    const TOKEN_PATH: &str = "/oauth2/token";
    const API_PATH: &str = "/api/1/";

    fn fast_poll() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(125),
            budget: Duration::from_millis(500),
            deadline: None,
        }
    }

    fn session(server: &MockServer, backing: &MemoryStore, poll: PollPolicy) -> AuthSession {
        let uri = server.uri();
        let endpoints = Endpoints::new(
            Some(&format!("{uri}{API_PATH}")),
            Some(&format!("{uri}{DEVICE_PATH}")),
            Some(&format!("{uri}{TOKEN_PATH}")),
        )
        .unwrap();
        AuthSession::new("test_client", "test_secret", CredentialStore::new(backing.clone()))
            .unwrap()
            .with_endpoints(endpoints)
            .with_poll_policy(poll)
    }

    fn epoch_in(secs: i64) -> f64 {
        crate::auth::clock::to_epoch_secs(Utc::now() + chrono::Duration::seconds(secs))
    }

    fn authenticated_backing(access_token: &str) -> MemoryStore {
        let mut backing = MemoryStore::new();
        backing.set(keys::ACCESS_TOKEN, json!(access_token)).unwrap();
        backing
            .set(keys::ACCESS_TOKEN_EXPIRES, json!(epoch_in(3600)))
            .unwrap();
        backing
    }

    fn pending_device_backing() -> MemoryStore {
        let mut backing = MemoryStore::new();
        backing.set(keys::DEVICE_CODE, json!("abc")).unwrap();
        backing.set(keys::DEVICE_EXPIRES, json!(epoch_in(300))).unwrap();
        backing
    }

    async fn request_bodies(server: &MockServer, at: &str) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|req| req.url.path() == at)
            .map(|req| String::from_utf8_lossy(&req.body).into_owned())
            .collect()
    }

    #[test]
    fn default_endpoints_resolve() {
        let endpoints = Endpoints::defaults().unwrap();
        assert_eq!(endpoints.api.as_str(), DEFAULT_API_ENDPOINT);
        assert_eq!(endpoints.device_code.url().as_str(), DEFAULT_DEVICE_CODE_URL);
        assert_eq!(endpoints.token.url().as_str(), DEFAULT_TOKEN_URL);
    }

    #[test]
    fn endpoint_overrides_replace_only_given_urls() {
        let endpoints = Endpoints::new(None, None, Some("https://auth.example.org/token")).unwrap();
        assert_eq!(endpoints.api.as_str(), DEFAULT_API_ENDPOINT);
        assert_eq!(endpoints.token.url().as_str(), "https://auth.example.org/token");
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let err = Endpoints::new(Some("not a url"), None, None).unwrap_err();
        assert!(matches!(err, DevauthError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn begin_returns_normalized_url_and_device_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .and(header("authorization", BASIC))
            .and(body_string("client_id=test_client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "abc",
                "verification_url": "example.com/x",
                "expires_in_s": 300
            })))
            .expect(1)
            .mount(&server)
            .await;
        let backing = MemoryStore::new();
        let mut session = session(&server, &backing, fast_poll());

        let authorization = session.begin_authentication().await.unwrap();

        assert_eq!(authorization.verification_url, "https://example.com/x");
        assert_eq!(authorization.device_code, "abc");
        assert!(session.store().authenticating().unwrap());
        assert_eq!(session.state().unwrap(), SessionState::Authenticating);
        assert!(!backing.snapshot().contains_key(keys::DEVICE_INTERVAL));
    }

    #[tokio::test]
    async fn begin_stores_suggested_interval() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "abc",
                "verification_url": "https://example.com/x",
                "expires_in_s": 300,
                "interval": 5
            })))
            .mount(&server)
            .await;
        let backing = MemoryStore::new();
        let mut session = session(&server, &backing, fast_poll());

        let authorization = session.begin_authentication().await.unwrap();

        assert_eq!(authorization.verification_url, "https://example.com/x");
        assert_eq!(session.store().device_interval().unwrap(), Some(5.0));
    }

    #[tokio::test]
    async fn begin_without_verification_url_stores_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "abc",
                "expires_in_s": 300
            })))
            .mount(&server)
            .await;
        let backing = MemoryStore::new();
        let mut session = session(&server, &backing, fast_poll());

        let err = session.begin_authentication().await.unwrap_err();

        assert!(matches!(err, DevauthError::ApiShape(ref field) if field == "verification_url"));
        let stored = backing.snapshot();
        assert!(!stored.contains_key(keys::DEVICE_CODE));
        assert!(!stored.contains_key(keys::DEVICE_EXPIRES));
    }

    #[tokio::test]
    async fn begin_non_200_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;
        let backing = MemoryStore::new();
        let mut session = session(&server, &backing, fast_poll());

        let err = session.begin_authentication().await.unwrap_err();

        assert!(matches!(
            err,
            DevauthError::Protocol { status: 503, ref body } if body == "maintenance"
        ));
    }

    #[tokio::test]
    async fn begin_while_authenticated_logs_out_first() {
        let server = MockServer::start().await;
        // The device request must already fall back to Basic.
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .and(header("authorization", BASIC))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let mut backing = authenticated_backing("T");
        backing.set(keys::REFRESH_TOKEN, json!("R")).unwrap();
        backing.set("host_setting", json!("kept")).unwrap();
        let mut session = session(&server, &backing, fast_poll());

        assert!(session.begin_authentication().await.is_err());

        assert_eq!(session.store().access_token().unwrap(), None);
        assert_eq!(session.store().refresh_token().unwrap(), None);
        assert_eq!(session.state().unwrap(), SessionState::Unauthenticated);
        assert!(backing.snapshot().contains_key("host_setting"));
    }

    #[tokio::test]
    async fn begin_while_refreshing_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "abc",
                "verification_url": "example.com/x",
                "expires_in_s": 300
            })))
            .mount(&server)
            .await;
        let mut backing = MemoryStore::new();
        backing.set(keys::REFRESH_TOKEN, json!("R")).unwrap();
        let mut session = session(&server, &backing, fast_poll());

        session.begin_authentication().await.unwrap();

        assert_eq!(session.store().refresh_token().unwrap().as_deref(), Some("R"));
        assert_eq!(session.store().device_code().unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn begin_while_authenticating_discards_pending_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(DEVICE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "fresh",
                "verification_url": "https://example.com/x",
                "expires_in_s": 300
            })))
            .expect(1)
            .mount(&server)
            .await;
        let mut backing = pending_device_backing();
        backing.set(keys::DEVICE_INTERVAL, json!(7.0)).unwrap();
        let mut session = session(&server, &backing, fast_poll());
        assert_eq!(session.state().unwrap(), SessionState::Authenticating);

        session.begin_authentication().await.unwrap();

        assert_eq!(session.store().device_interval().unwrap(), None);
        assert!(!backing.snapshot().contains_key(keys::DEVICE_INTERVAL));
        assert_eq!(session.store().device_code().unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn call_with_unsendable_token_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "result": 1
            })))
            .expect(0)
            .mount(&server)
            .await;
        let backing = authenticated_backing("T\nX");
        let mut session = session(&server, &backing, fast_poll());

        let err = session.call("get", [("key", "v")]).await.unwrap_err();

        assert!(matches!(err, DevauthError::InvalidCredentials(ref field) if field == "access_token"));
        assert!(request_bodies(&server, API_PATH).await.is_empty());
    }

    #[tokio::test]
    async fn complete_without_device_code_is_state_error() {
        let server = MockServer::start().await;
        let backing = MemoryStore::new();
        let mut session = session(&server, &backing, fast_poll());

        let err = session.complete_authentication().await.unwrap_err();

        assert!(matches!(err, DevauthError::State(_)));
        assert!(request_bodies(&server, TOKEN_PATH).await.is_empty());
    }

    #[tokio::test]
    async fn complete_with_expired_device_code_is_state_error() {
        let server = MockServer::start().await;
        let mut backing = MemoryStore::new();
        backing.set(keys::DEVICE_CODE, json!("abc")).unwrap();
        backing.set(keys::DEVICE_EXPIRES, json!(epoch_in(-1))).unwrap();
        let mut session = session(&server, &backing, fast_poll());

        let err = session.complete_authentication().await.unwrap_err();

        assert!(matches!(err, DevauthError::State(_)));
    }

    #[tokio::test]
    async fn complete_exhausts_attempts_with_last_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string("grant_type=device_code&device_code=abc"))
            .respond_with(ResponseTemplate::new(400).set_body_string("authorization_pending"))
            .expect(4)
            .mount(&server)
            .await;
        let backing = pending_device_backing();
        let mut session = session(&server, &backing, fast_poll());

        let err = session.complete_authentication().await.unwrap_err();

        assert!(matches!(
            err,
            DevauthError::Protocol { status: 400, ref body } if body == "authorization_pending"
        ));
        assert!(!session.store().authenticated().unwrap());
    }

    #[tokio::test]
    async fn complete_uses_stored_interval_for_attempt_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400))
            .expect(4)
            .mount(&server)
            .await;
        let mut backing = pending_device_backing();
        backing.set(keys::DEVICE_INTERVAL, json!(0.125)).unwrap();
        let poll = PollPolicy {
            interval: Duration::from_secs(10),
            ..fast_poll()
        };
        let mut session = session(&server, &backing, poll);

        assert!(session.complete_authentication().await.is_err());
    }

    #[tokio::test]
    async fn interval_longer_than_budget_still_polls_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "T",
                "refresh_token": "R",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        let backing = pending_device_backing();
        let poll = PollPolicy {
            interval: Duration::from_secs(10),
            budget: Duration::from_secs(1),
            deadline: None,
        };
        let mut session = session(&server, &backing, poll);

        session.complete_authentication().await.unwrap();

        assert!(session.store().authenticated().unwrap());
    }

    #[tokio::test]
    async fn complete_then_call_attaches_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(header("authorization", BASIC))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "T",
                "refresh_token": "R",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .and(header("authorization", "Bearer T"))
            .and(body_string_contains("key=v"))
            .and(body_string_contains("method=get"))
            .and(body_string_contains("client_id=test_client"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "result": {"n": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let backing = pending_device_backing();
        let mut session = session(&server, &backing, fast_poll());

        session.complete_authentication().await.unwrap();
        assert_eq!(session.state().unwrap(), SessionState::Authenticated);

        let result = session.call("get", [("key", "v")]).await.unwrap();
        assert_eq!(result, json!({"n": 1}));
    }

    #[tokio::test]
    async fn complete_stops_when_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("authorization_pending"))
            .mount(&server)
            .await;
        let backing = pending_device_backing();
        let poll = PollPolicy {
            interval: Duration::from_secs(30),
            budget: Duration::from_secs(600),
            deadline: None,
        };
        let mut session = session(&server, &backing, poll);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = session.complete_authentication_with(&cancel).await.unwrap_err();

        assert!(matches!(err, DevauthError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(session.store().device_code().unwrap().as_deref(), Some("abc"));
        assert!(request_bodies(&server, TOKEN_PATH).await.len() <= 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_sends_nothing() {
        let server = MockServer::start().await;
        let backing = pending_device_backing();
        let mut session = session(&server, &backing, fast_poll());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = session.complete_authentication_with(&cancel).await.unwrap_err();

        assert!(matches!(err, DevauthError::Cancelled));
        assert!(request_bodies(&server, TOKEN_PATH).await.is_empty());
    }

    #[tokio::test]
    async fn deadline_cuts_polling_short() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("authorization_pending"))
            .mount(&server)
            .await;
        let backing = pending_device_backing();
        let poll = PollPolicy {
            interval: Duration::from_millis(125),
            budget: Duration::from_secs(600),
            deadline: Some(Duration::from_millis(300)),
        };
        let mut session = session(&server, &backing, poll);

        let err = session.complete_authentication().await.unwrap_err();

        assert!(matches!(err, DevauthError::Protocol { status: 400, .. }));
        let attempts = request_bodies(&server, TOKEN_PATH).await.len();
        assert!((1..=4).contains(&attempts), "made {attempts} attempts");
    }

    #[tokio::test]
    async fn token_exchange_leaves_missing_fields_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "T",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        let mut backing = pending_device_backing();
        backing.set(keys::REFRESH_TOKEN, json!("R")).unwrap();
        let mut session = session(&server, &backing, fast_poll());

        session.complete_authentication().await.unwrap();

        let stored = backing.snapshot();
        assert_eq!(stored.get(keys::REFRESH_TOKEN), Some(&json!("R")));
        assert_eq!(stored.get(keys::ACCESS_TOKEN), Some(&json!("T")));
        assert!(!stored.contains_key(keys::TOKEN_TYPE));
    }

    #[tokio::test]
    async fn call_returns_api_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "message": "bad key"
            })))
            .mount(&server)
            .await;
        let backing = authenticated_backing("T");
        let mut session = session(&server, &backing, fast_poll());

        let err = session.call("get", [("key", "v")]).await.unwrap_err();

        assert!(matches!(err, DevauthError::Api(ref message) if message == "bad key"));
    }

    #[tokio::test]
    async fn call_error_without_message_is_api_shape_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "error"})))
            .mount(&server)
            .await;
        let backing = authenticated_backing("T");
        let mut session = session(&server, &backing, fast_poll());

        let err = session.call("get", [("key", "v")]).await.unwrap_err();

        assert!(matches!(err, DevauthError::ApiShape(ref field) if field == "message"));
    }

    #[tokio::test]
    async fn call_non_200_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;
        let backing = authenticated_backing("T");
        let mut session = session(&server, &backing, fast_poll());

        let err = session.call("get", Vec::<(String, String)>::new()).await.unwrap_err();

        assert!(matches!(err, DevauthError::Protocol { status: 401, .. }));
        assert!(err.requires_reauth());
    }

    #[tokio::test]
    async fn call_refreshes_expired_access_token_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(header("authorization", BASIC))
            .and(body_string("grant_type=refresh_token&refresh_token=R"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "token_type": "bearer",
                "access_token": "T2",
                "refresh_token": "R2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .and(header("authorization", "Bearer T2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "result": []
            })))
            .expect(1)
            .mount(&server)
            .await;
        let mut backing = MemoryStore::new();
        backing.set(keys::REFRESH_TOKEN, json!("R")).unwrap();
        backing.set(keys::ACCESS_TOKEN, json!("stale")).unwrap();
        backing
            .set(keys::ACCESS_TOKEN_EXPIRES, json!(epoch_in(-60)))
            .unwrap();
        let mut session = session(&server, &backing, fast_poll());
        assert_eq!(session.state().unwrap(), SessionState::Refreshing);

        let result = session.call("list", [("page", "1")]).await.unwrap();

        assert_eq!(result, json!([]));
        let stored = backing.snapshot();
        assert_eq!(stored.get(keys::REFRESH_TOKEN), Some(&json!("R2")));
        assert_eq!(stored.get(keys::TOKEN_TYPE), Some(&json!("bearer")));
    }

    #[tokio::test]
    async fn call_proceeds_after_failed_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .and(header("authorization", BASIC))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "message": "Invalid access token"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let mut backing = MemoryStore::new();
        backing.set(keys::REFRESH_TOKEN, json!("R")).unwrap();
        let mut session = session(&server, &backing, fast_poll());

        let err = session.call("get", [("key", "v")]).await.unwrap_err();

        assert!(matches!(err, DevauthError::Api(ref message) if message == "Invalid access token"));
    }

    #[tokio::test]
    async fn call_without_any_token_uses_basic_and_skips_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .and(header("authorization", BASIC))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "result": "public"
            })))
            .expect(1)
            .mount(&server)
            .await;
        let backing = MemoryStore::new();
        let mut session = session(&server, &backing, fast_poll());

        let result = session.call("search", [("query", "x")]).await.unwrap();

        assert_eq!(result, json!("public"));
        assert!(request_bodies(&server, TOKEN_PATH).await.is_empty());
    }

    #[tokio::test]
    async fn reserved_params_are_overridden() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "result": null
            })))
            .mount(&server)
            .await;
        let backing = authenticated_backing("T");
        let mut session = session(&server, &backing, fast_poll());

        let raw = session
            .call_raw("get", [("method", "other"), ("client_id", "spoofed"), ("key", "v")])
            .await
            .unwrap();

        assert!(raw.is_ok());
        let bodies = request_bodies(&server, API_PATH).await;
        assert_eq!(bodies, vec!["key=v&method=get&client_id=test_client".to_string()]);
    }

    #[tokio::test]
    async fn invoke_forwards_named_method() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(API_PATH))
            .and(body_string_contains("method=currentUser"))
            .and(body_string_contains("extras=followingCount"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "result": {"key": "s1"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        let backing = authenticated_backing("T");
        let mut session = session(&server, &backing, fast_poll());
        let params = BTreeMap::from([("extras".to_string(), "followingCount".to_string())]);

        let result = session.invoke("currentUser", &params).await.unwrap();

        assert_eq!(result, json!({"key": "s1"}));
    }
}
