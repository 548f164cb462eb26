//! Capability interfaces of the three external collaborators
//!
//! The pipeline only ever talks to the comment source and the classifier
//! through these traits; the object store trait lives in `commentline-store`.
//! Calls are blocking and receive the run's [`CancelToken`] so an in-flight
//! request can be abandoned.

use crate::cancel::CancelToken;
use crate::error::ServiceError;
use crate::model::RawComment;

/// One page as returned by a [`CommentSource`]
#[derive(Debug, Clone, PartialEq)]
pub struct PageResponse {
    pub items: Vec<RawComment>,
    pub next_page_token: Option<String>,
    /// Quota units the call was charged
    pub quota_cost: u64,
}

/// Paginated comment source (e.g. the YouTube Data API).
pub trait CommentSource: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Quota units a single page request is expected to cost
    fn page_cost(&self) -> u64 {
        1
    }

    /// Fetch one page of comments for `video_id`; `None` requests the first page.
    fn get_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<PageResponse, ServiceError>;
}

/// Unvalidated classifier answer for one text
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f64,
}

impl Classification {
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Classifier answer for a whole batch
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifyResponse {
    /// Model that produced the labels
    pub model_version: String,
    /// Intended to be positional with the request texts; callers validate
    pub results: Vec<Classification>,
}

/// Sentiment classification service.
pub trait Classifier: Send + Sync {
    /// Configured model name, used when the response does not report one
    fn model(&self) -> &str;

    /// Classify `texts`, returning one result per text in the same order.
    fn classify(&self, texts: &[&str], cancel: &CancelToken)
    -> Result<ClassifyResponse, ServiceError>;
}
