//! Secure credential storage using the operating system keyring.
//!
//! This module provides platform-specific secure storage for the credential record:
//! - macOS: Keychain
//! - Linux: Secret Service (GNOME Keyring, `KWallet`)
//! - Windows: Credential Manager
//!
//! The record is stored as one JSON object under a service-specific key.

use keyring::Entry;
use serde_json::{Map, Value};

use crate::error::{DevauthError, Result};
use crate::storage::KeyValueStore;

const SERVICE_NAME: &str = "dev.devauth.cli";
const RECORD_KEY: &str = "credential_record";

/// Credential record storage backed by the OS keyring.
pub struct KeyringStore {
    entry: Entry,
}

impl KeyringStore {
    /// Creates a store under the default service and account names.
    ///
    /// # Errors
    ///
    /// Returns [`DevauthError::CredentialStorage`] if the keyring entry cannot be created,
    /// which may occur if the keyring service is unavailable or locked.
    pub fn new() -> Result<Self> {
        Self::with_account(RECORD_KEY)
    }

    /// Creates a store under a custom account name.
    ///
    /// # Errors
    ///
    /// Returns [`DevauthError::CredentialStorage`] if the keyring entry cannot be created.
    pub fn with_account(account: &str) -> Result<Self> {
        let entry = Entry::new(SERVICE_NAME, account)?;
        Ok(Self { entry })
    }

    fn read(&self) -> Result<Map<String, Value>> {
        match self.entry.get_password() {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(Value::Object(map)) => Ok(map),
                _ => Err(DevauthError::InvalidCredentials(RECORD_KEY.to_string())),
            },
            Err(keyring::Error::NoEntry) => Ok(Map::new()),
            Err(e) => Err(DevauthError::CredentialStorage(e.to_string())),
        }
    }

    fn write(&self, map: &Map<String, Value>) -> Result<()> {
        if map.is_empty() {
            return match self.entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(DevauthError::CredentialStorage(e.to_string())),
            };
        }
        let json = serde_json::to_string(map)?;
        self.entry.set_password(&json)?;
        Ok(())
    }
}

impl KeyValueStore for KeyringStore {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read()?.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let mut map = self.read()?;
        map.insert(key.to_string(), value);
        self.write(&map)
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let mut map = self.read()?;
        if map.remove(key).is_some() {
            self.write(&map)?;
        }
        Ok(())
    }
}
