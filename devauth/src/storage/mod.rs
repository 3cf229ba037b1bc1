//! Durable key-value backends for credential records.
//!
//! This module provides the storage seam under [`CredentialStore`](crate::auth::CredentialStore):
//! - [`KeyValueStore`] - Trait with membership, get, set and delete over string keys
//! - [`MemoryStore`] - Shared in-process map
//! - [`FileStore`] - JSON file re-read on every operation
//! - [`KeyringStore`] - JSON record inside one OS keyring entry

pub mod file;
pub mod keychain;
pub mod memory;

use serde_json::Value;

use crate::error::Result;

pub use file::FileStore;
pub use keychain::KeyringStore;
pub use memory::MemoryStore;

/// Minimal dictionary semantics over string keys and opaque values (enables mocking).
///
/// Implementations must not cache: every call observes the current contents
/// of the underlying medium, so the medium stays the single source of truth
/// even when another process mutates it.
#[cfg_attr(test, mockall::automock)]
pub trait KeyValueStore: Send {
    /// Checks whether `key` is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be read.
    fn contains(&self, key: &str) -> Result<bool>;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be read.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Writes `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be written.
    fn set(&mut self, key: &str, value: Value) -> Result<()>;

    /// Removes `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the medium cannot be written.
    fn delete(&mut self, key: &str) -> Result<()>;
}
