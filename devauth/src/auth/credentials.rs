//! Typed, expiry-aware view over a credential record.
//!
//! [`CredentialStore`] owns the interpretation of a [`KeyValueStore`] but never
//! caches it: every property re-reads the backing store. Values with a paired
//! expiry read as absent once expired, while staying physically stored until
//! [`CredentialStore::logout`] removes them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::auth::clock::{from_epoch_secs, to_epoch_secs, Clock, SystemClock};
use crate::auth::tokens::SessionState;
use crate::error::{DevauthError, Result};
use crate::storage::KeyValueStore;

/// Logical field names of the credential record.
pub mod keys {
    pub const DEVICE_CODE: &str = "device_code";
    pub const DEVICE_EXPIRES: &str = "device_expires";
    pub const DEVICE_INTERVAL: &str = "device_interval";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const ACCESS_TOKEN_EXPIRES: &str = "access_token_expires";
    pub const TOKEN_TYPE: &str = "token_type";

    /// Fields removed by logout. `token_type` is informational and survives.
    pub const SESSION_KEYS: [&str; 6] = [
        DEVICE_CODE,
        DEVICE_EXPIRES,
        DEVICE_INTERVAL,
        REFRESH_TOKEN,
        ACCESS_TOKEN,
        ACCESS_TOKEN_EXPIRES,
    ];
}

/// Expiry-aware accessors and derived state over a caller-supplied backing store.
pub struct CredentialStore {
    backing: Box<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    /// Wraps `backing`, comparing expiries against the system clock.
    pub fn new(backing: impl KeyValueStore + 'static) -> Self {
        Self::with_clock(backing, Arc::new(SystemClock))
    }

    /// Wraps `backing`, comparing expiries against `clock`.
    pub fn with_clock(backing: impl KeyValueStore + 'static, clock: Arc<dyn Clock>) -> Self {
        Self {
            backing: Box::new(backing),
            clock,
        }
    }

    /// Current instant according to this store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The device code, while it has not expired.
    pub fn device_code(&self) -> Result<Option<String>> {
        self.expiring_string(keys::DEVICE_CODE, keys::DEVICE_EXPIRES)
    }

    /// The refresh token. Refresh tokens carry no local expiry.
    pub fn refresh_token(&self) -> Result<Option<String>> {
        self.string(keys::REFRESH_TOKEN)
    }

    /// The access token, while it has not expired.
    pub fn access_token(&self) -> Result<Option<String>> {
        self.expiring_string(keys::ACCESS_TOKEN, keys::ACCESS_TOKEN_EXPIRES)
    }

    /// When the stored access token expires, whether or not it already has.
    pub fn access_token_expires_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .number(keys::ACCESS_TOKEN_EXPIRES)?
            .and_then(from_epoch_secs))
    }

    /// Server-suggested poll interval in seconds, if stored and positive.
    pub fn device_interval(&self) -> Result<Option<f64>> {
        match self.backing.get(keys::DEVICE_INTERVAL)? {
            Some(Value::Number(n)) => Ok(n.as_f64().filter(|secs| *secs > 0.0)),
            _ => Ok(None),
        }
    }

    /// A device code was issued and no refresh token exists yet.
    pub fn authenticating(&self) -> Result<bool> {
        Ok(self.device_code()?.is_some() && self.refresh_token()?.is_none())
    }

    /// A refresh token exists but no valid access token.
    pub fn refreshing(&self) -> Result<bool> {
        Ok(self.refresh_token()?.is_some() && self.access_token()?.is_none())
    }

    /// A non-expired access token exists.
    pub fn authenticated(&self) -> Result<bool> {
        Ok(self.access_token()?.is_some())
    }

    /// The single derived state, by precedence authenticated, refreshing, authenticating.
    pub fn state(&self) -> Result<SessionState> {
        if self.authenticated()? {
            Ok(SessionState::Authenticated)
        } else if self.refreshing()? {
            Ok(SessionState::Refreshing)
        } else if self.authenticating()? {
            Ok(SessionState::Authenticating)
        } else {
            Ok(SessionState::Unauthenticated)
        }
    }

    /// Passes through to the backing store's membership test.
    pub fn contains(&self, key: &str) -> Result<bool> {
        self.backing.contains(key)
    }

    /// Passes through to the backing store's raw read.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.backing.get(key)
    }

    /// Writes `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`DevauthError::Validation`] for a JSON `null`, leaving the
    /// store untouched. Delete the key instead of nulling it.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if value.is_null() {
            return Err(DevauthError::Validation {
                key: key.to_string(),
            });
        }
        self.backing.set(key, value)
    }

    /// Writes an absolute expiry instant under `key`.
    pub fn set_expiry(&mut self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.set(key, to_epoch_secs(at))
    }

    /// Removes `key`; removing an absent key is not an error.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        if self.backing.contains(key)? {
            self.backing.delete(key)?;
        }
        Ok(())
    }

    /// Deletes every session field. Unrecognized keys are left alone.
    pub fn logout(&mut self) -> Result<()> {
        for key in keys::SESSION_KEYS {
            self.delete(key)?;
        }
        Ok(())
    }

    fn string(&self, key: &str) -> Result<Option<String>> {
        match self.backing.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(DevauthError::InvalidCredentials(key.to_string())),
        }
    }

    fn number(&self, key: &str) -> Result<Option<f64>> {
        match self.backing.get(key)? {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| DevauthError::InvalidCredentials(key.to_string())),
            Some(_) => Err(DevauthError::InvalidCredentials(key.to_string())),
        }
    }

    /// Reads `key` only if `expires_key` holds an instant at or after now.
    fn expiring_string(&self, key: &str, expires_key: &str) -> Result<Option<String>> {
        if !self.backing.contains(key)? {
            return Ok(None);
        }
        let Some(expires) = self.number(expires_key)? else {
            return Ok(None);
        };
        if expires >= to_epoch_secs(self.now()) {
            self.string(key)
        } else {
            Ok(None)
        }
    }
}
