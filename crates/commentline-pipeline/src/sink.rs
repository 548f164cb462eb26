//! Sink writer: content-addressed, write-once page artifacts

use chrono::{DateTime, Utc};
use commentline_core::{
    AnnotatedComment, CancelToken, Outcome, RetryError, RetryPolicy, ServiceError,
    retry_with_backoff,
};
use commentline_store::{ObjectStore, content_hash, page_key};
use rustc_hash::FxHashMap;

/// Where one page's annotated comments ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    /// The artifact holding this write's comments; for a replayed page whose
    /// comments were all stored earlier, the earlier artifact
    pub key: String,
    /// `false` when nothing new was uploaded
    pub written: bool,
    /// Some comments were already stored in an earlier artifact for the page
    pub adopted: bool,
    pub comment_count: usize,
    /// What the store now holds for the batch, in batch order. Earlier
    /// annotations win over the ones passed to [`SinkWriter::write`].
    pub comments: Vec<AnnotatedComment>,
    pub written_at: DateTime<Utc>,
}

impl StoredArtifact {
    fn new(key: String, written: bool, adopted: bool, comments: Vec<AnnotatedComment>) -> Self {
        Self {
            key,
            written,
            adopted,
            comment_count: comments.len(),
            comments,
            written_at: Utc::now(),
        }
    }
}

/// Serialized artifact body: a JSON array of annotated comments.
pub fn encode_payload(comments: &[AnnotatedComment]) -> Result<Vec<u8>, ServiceError> {
    serde_json::to_vec(comments)
        .map_err(|e| ServiceError::InvalidResponse(format!("serialize artifact: {e}")))
}

/// `comments/{source_id}/`
pub fn artifact_prefix(source_id: &str) -> String {
    format!("comments/{source_id}/")
}

/// `comments/{source_id}/{page_key}/`
pub fn page_prefix(source_id: &str, page_token: Option<&str>) -> String {
    format!("{}{}/", artifact_prefix(source_id), page_key(page_token))
}

/// `comments/{source_id}/{page_key}/{content_hash}.json`
pub fn artifact_key(source_id: &str, page_token: Option<&str>, payload: &[u8]) -> String {
    format!(
        "{}{}.json",
        page_prefix(source_id, page_token),
        content_hash(payload)
    )
}

/// Split an artifact key into `(page_key, content_hash)`.
pub fn parse_artifact_key<'k>(source_id: &str, key: &'k str) -> Option<(&'k str, &'k str)> {
    let rest = key.strip_prefix("comments/")?.strip_prefix(source_id)?.strip_prefix('/')?;
    let (page, file) = rest.split_once('/')?;
    let hash = file.strip_suffix(".json")?;
    if page.is_empty() || hash.is_empty() || hash.contains('/') {
        return None;
    }
    Some((page, hash))
}

/// Writes page artifacts with bounded retries.
pub struct SinkWriter<'a> {
    store: &'a dyn ObjectStore,
    policy: &'a RetryPolicy,
    cancel: &'a CancelToken,
}

impl<'a> SinkWriter<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        policy: &'a RetryPolicy,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            store,
            policy,
            cancel,
        }
    }

    fn with_retry<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, ServiceError>,
    ) -> Result<T, RetryError<ServiceError>> {
        retry_with_backoff(label, self.policy, self.cancel, |_| Outcome::from(op()))
    }

    /// Store one page's annotated comments.
    ///
    /// Only returns after every comment of the batch is confirmed present,
    /// so the caller may advance the checkpoint on `Ok`.
    pub fn write(
        &self,
        source_id: &str,
        page_token: Option<&str>,
        comments: &[AnnotatedComment],
    ) -> Result<StoredArtifact, RetryError<ServiceError>> {
        let payload = encode_payload(comments).map_err(RetryError::Fatal)?;
        let key = artifact_key(source_id, page_token, &payload);
        let label = format!("store {key}");

        if self.with_retry(&label, || self.store.exists(&key, self.cancel))? {
            log::debug!("{key}: already stored");
            return Ok(StoredArtifact::new(key, false, false, comments.to_vec()));
        }

        // A replayed page may have been classified differently, or may have
        // shifted since the earlier artifacts were written
        let prefix = page_prefix(source_id, page_token);
        let existing = self.with_retry(&label, || self.store.list(&prefix, self.cancel))?;
        let mut earlier: FxHashMap<String, AnnotatedComment> = FxHashMap::default();
        let mut first_earlier = None;
        for previous in existing.into_iter().filter(|k| *k != key) {
            for c in self.load(&label, &previous)? {
                earlier.entry(c.id().to_string()).or_insert(c);
            }
            first_earlier.get_or_insert(previous);
        }

        let missing: Vec<AnnotatedComment> = comments
            .iter()
            .filter(|c| !earlier.contains_key(c.id()))
            .cloned()
            .collect();
        let adopted = missing.len() < comments.len();
        let kept: Vec<AnnotatedComment> = comments
            .iter()
            .map(|c| earlier.get(c.id()).cloned().unwrap_or_else(|| c.clone()))
            .collect();

        if missing.is_empty() {
            let previous = first_earlier.unwrap_or(key);
            log::warn!(
                "{source_id}/{}: all {} comments already in {previous}",
                page_key(page_token),
                comments.len()
            );
            return Ok(StoredArtifact::new(previous, false, true, kept));
        }

        let (key, payload) = if adopted {
            let payload = encode_payload(&missing).map_err(RetryError::Fatal)?;
            let key = artifact_key(source_id, page_token, &payload);
            log::warn!(
                "{source_id}/{}: {} of {} comments missing from earlier artifacts, storing {key}",
                page_key(page_token),
                missing.len(),
                comments.len()
            );
            (key, payload)
        } else {
            (key, payload)
        };

        let written = self.put_verified(&label, &key, &payload)?;
        log::debug!(
            "{key}: {} comments, {} bytes{}",
            missing.len(),
            payload.len(),
            if written { "" } else { " (already present)" }
        );
        Ok(StoredArtifact::new(key, written, adopted, kept))
    }

    /// Decoded comments of an existing artifact.
    fn load(
        &self,
        label: &str,
        key: &str,
    ) -> Result<Vec<AnnotatedComment>, RetryError<ServiceError>> {
        let Some(bytes) = self.with_retry(label, || self.store.get(key, self.cancel))? else {
            return Ok(Vec::new());
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            RetryError::Fatal(ServiceError::InvalidResponse(format!(
                "{key}: undecodable artifact: {e}"
            )))
        })
    }

    /// Conditional put followed by an existence check; returns whether the
    /// object was newly written.
    fn put_verified(
        &self,
        label: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<bool, RetryError<ServiceError>> {
        let outcome =
            self.with_retry(label, || self.store.put_if_absent(key, payload, self.cancel))?;
        self.with_retry(label, || match self.store.exists(key, self.cancel) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ServiceError::Transient("object not visible after write".into())),
            Err(e) => Err(e),
        })?;
        Ok(outcome.written)
    }
}
