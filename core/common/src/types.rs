//! Common types used throughout FieldSync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between a key namespace and the record name.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Maximum key length accepted by every store backend.
pub const MAX_KEY_LEN: usize = 256;

/// Key of a record in a durable key/value store.
///
/// Keys are opaque to the stores but are always non-empty, bounded in length
/// and free of control characters so every backend can persist them verbatim
/// or in an escaped form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey(String);

impl StoreKey {
    /// Create a new StoreKey from a string.
    ///
    /// # Preconditions
    /// - `key` must be non-empty and at most `MAX_KEY_LEN` bytes
    /// - `key` must not contain control characters
    ///
    /// # Errors
    /// - Returns `InvalidInput` if any precondition is violated
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Store key cannot be empty".to_string(),
            ));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(crate::Error::InvalidInput(format!(
                "Store key exceeds {} bytes",
                MAX_KEY_LEN
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(crate::Error::InvalidInput(
                "Store key cannot contain control characters".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Build a key inside a namespace, e.g. `cache:customers`.
    ///
    /// # Errors
    /// - Namespace is empty or contains the separator
    /// - The combined key is invalid
    pub fn namespaced(namespace: &str, name: &str) -> crate::Result<Self> {
        if namespace.is_empty() || namespace.contains(NAMESPACE_SEPARATOR) {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid key namespace: {:?}",
                namespace
            )));
        }
        if name.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Key name cannot be empty".to_string(),
            ));
        }
        Self::new(format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, name))
    }

    /// Namespace part of the key, if it has one.
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once(NAMESPACE_SEPARATOR).map(|(ns, _)| ns)
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for StoreKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
