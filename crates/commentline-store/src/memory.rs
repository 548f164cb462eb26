//! In-memory object store for tests and dry runs

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use commentline_core::{CancelToken, ServiceError};

use crate::object_store::{ObjectStore, PutOutcome, validate_key};

/// Objects kept in a sorted map.
///
/// `fail_next_puts` injects transient failures for retry tests.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    failures: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` puts fail with a transient error
    pub fn fail_next_puts(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Puts that actually stored an object
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryObjectStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn put_if_absent(
        &self,
        key: &str,
        payload: &[u8],
        _cancel: &CancelToken,
    ) -> Result<PutOutcome, ServiceError> {
        validate_key(key)?;
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ServiceError::Transient("injected put failure".into()));
        }

        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(key) {
            return Ok(PutOutcome { written: false });
        }
        objects.insert(key.to_string(), payload.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(PutOutcome { written: true })
    }

    fn exists(&self, key: &str, _cancel: &CancelToken) -> Result<bool, ServiceError> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn get(&self, key: &str, _cancel: &CancelToken) -> Result<Option<Vec<u8>>, ServiceError> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    fn list(&self, prefix: &str, _cancel: &CancelToken) -> Result<Vec<String>, ServiceError> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_if_absent_once() {
        let store = MemoryObjectStore::new();
        let cancel = CancelToken::new();
        assert!(store.put_if_absent("a", b"1", &cancel).unwrap().written);
        assert!(!store.put_if_absent("a", b"2", &cancel).unwrap().written);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.get("a", &cancel).unwrap().unwrap(), b"1");
    }

    #[test]
    fn injected_failures_are_transient_and_counted_down() {
        let store = MemoryObjectStore::new();
        let cancel = CancelToken::new();
        store.fail_next_puts(2);
        assert!(store.put_if_absent("a", b"1", &cancel).unwrap_err().is_retryable());
        assert!(store.put_if_absent("a", b"1", &cancel).is_err());
        assert!(store.put_if_absent("a", b"1", &cancel).unwrap().written);
    }

    #[test]
    fn list_by_prefix_sorted() {
        let store = MemoryObjectStore::new();
        let cancel = CancelToken::new();
        for key in ["b/2", "a/1", "b/1", "c/1"] {
            store.put_if_absent(key, b"", &cancel).unwrap();
        }
        assert_eq!(store.list("b/", &cancel).unwrap(), vec!["b/1", "b/2"]);
        assert_eq!(store.list("", &cancel).unwrap().len(), 4);
    }
}
