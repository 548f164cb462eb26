//! Object store capability interface

use commentline_core::{CancelToken, ServiceError};

/// Result of a conditional put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// `false` when an object already existed under the key
    pub written: bool,
}

/// Blob storage used for artifacts and run summaries.
///
/// Keys are `/`-separated relative paths. Failures use the shared
/// [`ServiceError`] taxonomy (`Auth`, `Transient`, ...).
pub trait ObjectStore: Send + Sync {
    /// Human-readable location for logs (`fs:/data`, `azure:container`)
    fn describe(&self) -> String;

    /// Store `payload` under `key` unless an object already exists there.
    fn put_if_absent(
        &self,
        key: &str,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> Result<PutOutcome, ServiceError>;

    fn exists(&self, key: &str, cancel: &CancelToken) -> Result<bool, ServiceError>;

    /// Object bytes, or `None` if absent
    fn get(&self, key: &str, cancel: &CancelToken) -> Result<Option<Vec<u8>>, ServiceError>;

    /// All keys starting with `prefix`, sorted
    fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<String>, ServiceError>;
}

/// Reject keys that could escape the store root or confuse path handling.
pub fn validate_key(key: &str) -> Result<(), ServiceError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.contains('\\')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(ServiceError::InvalidResponse(format!("invalid object key: {key:?}")));
    }
    Ok(())
}
