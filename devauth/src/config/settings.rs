//! Application configuration settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthSession, CredentialStore, Endpoints, PollPolicy};
use crate::client::{HttpTransport, DEFAULT_TIMEOUT_SECS};
use crate::error::{DevauthError, Result};
use crate::storage::{FileStore, KeyringStore};

/// Main configuration for devauth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevauthConfig {
    /// Client identity.
    pub client: ClientConfig,
    /// Endpoint overrides.
    pub endpoints: EndpointsConfig,
    /// Device-code polling.
    pub poll: PollConfig,
    /// Where the credential record lives.
    pub storage: StorageConfig,
    /// HTTP client settings.
    pub http: HttpConfig,
}

/// Client identity issued by the service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// OAuth client ID.
    pub client_id: Option<String>,
    /// OAuth client secret.
    pub client_secret: Option<String>,
}

/// Endpoint overrides; `None` keeps the built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// API endpoint receiving method calls.
    pub api_endpoint: Option<String>,
    /// Device-code endpoint.
    pub device_code_url: Option<String>,
    /// Token endpoint.
    pub token_url: Option<String>,
}

/// Device-code polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Interval when the server suggests none, in seconds.
    pub interval_secs: f64,
    /// Nominal budget that fixes the attempt count, in seconds.
    pub budget_secs: f64,
    /// Optional hard wall-clock cutoff, in seconds.
    pub deadline_secs: Option<f64>,
}

impl Default for PollConfig {
    fn default() -> Self {
        let defaults = PollPolicy::default();
        Self {
            interval_secs: defaults.interval.as_secs_f64(),
            budget_secs: defaults.budget.as_secs_f64(),
            deadline_secs: None,
        }
    }
}

/// Credential storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file on disk.
    #[default]
    File,
    /// OS keyring.
    Keyring,
}

/// Credential storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend holding the credential record.
    pub backend: StorageBackend,
    /// File path for the `file` backend; defaults to the data directory.
    pub path: Option<PathBuf>,
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Environment variables that can override configuration.
pub mod env {
    pub const CLIENT_ID: &str = "DEVAUTH_CLIENT_ID";
    pub const CLIENT_SECRET: &str = "DEVAUTH_CLIENT_SECRET";
    pub const API_URL: &str = "DEVAUTH_API_URL";
    pub const LOG_LEVEL: &str = "DEVAUTH_LOG";
}

impl DevauthConfig {
    /// Apply environment variable overrides to the configuration.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(client_id) = std::env::var(env::CLIENT_ID) {
            self.client.client_id = Some(client_id);
        }

        if let Ok(client_secret) = std::env::var(env::CLIENT_SECRET) {
            self.client.client_secret = Some(client_secret);
        }

        if let Ok(url) = std::env::var(env::API_URL) {
            self.endpoints.api_endpoint = Some(url);
        }

        self
    }

    /// Resolve the endpoints, filling gaps with defaults.
    pub fn endpoints(&self) -> Result<Endpoints> {
        Endpoints::new(
            self.endpoints.api_endpoint.as_deref(),
            self.endpoints.device_code_url.as_deref(),
            self.endpoints.token_url.as_deref(),
        )
    }

    /// Validate and convert the poll settings.
    pub fn poll_policy(&self) -> Result<PollPolicy> {
        let interval = positive_secs("poll.interval_secs", self.poll.interval_secs)?;
        let budget = positive_secs("poll.budget_secs", self.poll.budget_secs)?;
        let deadline = self
            .poll
            .deadline_secs
            .map(|secs| positive_secs("poll.deadline_secs", secs))
            .transpose()?;
        Ok(PollPolicy {
            interval,
            budget,
            deadline,
        })
    }

    /// Open the configured credential store.
    pub fn credential_store(&self) -> Result<CredentialStore> {
        Ok(match self.storage.backend {
            StorageBackend::File => {
                let store = match &self.storage.path {
                    Some(path) => FileStore::with_path(path.clone()),
                    None => FileStore::new()?,
                };
                CredentialStore::new(store)
            },
            StorageBackend::Keyring => CredentialStore::new(KeyringStore::new()?),
        })
    }

    /// Build a session from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DevauthError::Config`] if no client id is configured, or any
    /// error from resolving endpoints, poll settings or storage.
    pub fn session(&self) -> Result<AuthSession> {
        let client_id = self
            .client
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                DevauthError::Config(format!(
                    "No client id configured. Set [client] client_id or {}.",
                    env::CLIENT_ID
                ))
            })?;
        let client_secret = self.client.client_secret.clone().unwrap_or_default();
        let transport = HttpTransport::new(Duration::from_secs(self.http.timeout_secs))?;

        Ok(
            AuthSession::new(client_id, client_secret, self.credential_store()?)?
                .with_endpoints(self.endpoints()?)
                .with_poll_policy(self.poll_policy()?)
                .with_transport(transport),
        )
    }
}

fn positive_secs(field: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|duration| !duration.is_zero())
        .ok_or_else(|| DevauthError::Config(format!("{field} must be a positive number of seconds")))
}
