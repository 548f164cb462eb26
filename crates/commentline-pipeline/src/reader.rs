//! Source reader: quota-aware page fetching and the lazy page stream

use commentline_core::{
    CancelToken, CommentSource, Outcome, PageResponse, QuotaBudget, RetryError, RetryPolicy,
    ServiceError, SourcePage, retry_with_backoff,
};
use commentline_store::page_key;

/// Why a page could not be produced
#[derive(Debug)]
pub enum FetchError {
    /// Local budget spent or the server rejected the call for quota
    QuotaExhausted(String),
    /// Retries exhausted, a fatal source error, or cancellation
    Failed(RetryError<ServiceError>),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuotaExhausted(m) => write!(f, "quota exhausted: {m}"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Fetches pages for one source while charging the daily budget.
pub struct SourceReader<'a> {
    source: &'a dyn CommentSource,
    budget: &'a QuotaBudget,
    policy: &'a RetryPolicy,
    cancel: &'a CancelToken,
}

impl<'a> SourceReader<'a> {
    pub fn new(
        source: &'a dyn CommentSource,
        budget: &'a QuotaBudget,
        policy: &'a RetryPolicy,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            source,
            budget,
            policy,
            cancel,
        }
    }

    /// Fetch one page, retrying transient failures.
    ///
    /// Every attempt reserves the source's per-call cost first; a call the
    /// budget cannot cover is never sent.
    pub fn fetch_page(
        &self,
        source_id: &str,
        page_token: Option<&str>,
    ) -> Result<SourcePage, FetchError> {
        let label = format!("{} {source_id}/{}", self.source.name(), page_key(page_token));
        let cost = self.source.page_cost();

        let result = retry_with_backoff(&label, self.policy, self.cancel, |_| {
            if let Err(e) = self.budget.try_reserve(cost) {
                return Outcome::Fatal(ServiceError::QuotaExhausted(format!(
                    "local daily budget: {e}"
                )));
            }
            let response = self.source.get_page(source_id, page_token, self.cancel);
            match &response {
                Ok(PageResponse { quota_cost, .. }) => self.budget.settle(cost, *quota_cost),
                Err(ServiceError::QuotaExhausted(_)) => self.budget.exhaust(),
                Err(_) => {}
            }
            Outcome::from(response)
        });

        match result {
            Ok(resp) => {
                log::debug!(
                    "{label}: {} comments, next={}",
                    resp.items.len(),
                    resp.next_page_token.is_some()
                );
                Ok(SourcePage {
                    page_token: page_token.map(str::to_string),
                    items: resp.items,
                    next_page_token: resp.next_page_token,
                })
            }
            Err(RetryError::Fatal(ServiceError::QuotaExhausted(m))) => {
                log::warn!("{label}: quota exhausted ({m})");
                Err(FetchError::QuotaExhausted(m))
            }
            Err(e) => Err(FetchError::Failed(e)),
        }
    }

    /// Lazy sequence of pages starting at `resume_token` (`None` = first page).
    pub fn stream(&'a self, source_id: &str, resume_token: Option<&str>) -> PageStream<'a> {
        PageStream {
            reader: self,
            source_id: source_id.to_string(),
            cursor: Some(resume_token.map(str::to_string)),
            failed: false,
        }
    }
}

/// Iterator over pages, one request per `next()`.
///
/// Ends after the page without a next token, or after the first error. The
/// cursor of the page that would come next stays available, so a new stream
/// can be opened where this one stopped.
pub struct PageStream<'a> {
    reader: &'a SourceReader<'a>,
    source_id: String,
    /// Token of the next page to fetch; `None` once the last page was read
    cursor: Option<Option<String>>,
    failed: bool,
}

impl PageStream<'_> {
    /// Where a new stream should start; `None` when the source is exhausted.
    ///
    /// After an error this is the page that failed.
    pub fn resume_token(&self) -> Option<Option<&str>> {
        self.cursor.as_ref().map(|t| t.as_deref())
    }
}

impl Iterator for PageStream<'_> {
    type Item = Result<SourcePage, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let token = self.cursor.clone()?;
        match self.reader.fetch_page(&self.source_id, token.as_deref()) {
            Ok(page) => {
                // An empty page with a next token still continues
                self.cursor = page.next_page_token.clone().map(Some);
                Some(Ok(page))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
