//! Blocking HTTP plumbing for the collaborator clients.
//!
//! Uses async reqwest on a shared tokio runtime but presents a sync
//! interface for the pipeline's worker threads. Every call races the run's
//! cancellation token so an abandoned request stops immediately.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::ServiceError;

/// Connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest error body kept for messages
const MAX_ERROR_BODY: usize = 512;

/// Shared tokio runtime for HTTP operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("commentline-http")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// HTTP client with a per-call timeout (connect + response)
pub fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .pool_max_idle_per_host(8)
        .user_agent(concat!("commentline/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Drive `fut` to completion on the shared runtime, aborting on cancellation.
pub fn block_on_cancellable<T, F>(cancel: &CancelToken, fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    if cancel.is_cancelled() {
        return Err(ServiceError::Cancelled);
    }
    SHARED_RUNTIME.handle().block_on(async {
        tokio::select! {
            result = fut => result,
            _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        }
    })
}

/// Parse a `Retry-After` header: delay-seconds or an HTTP date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

/// `Retry-After` from response headers
pub fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Cut an error body down to something fit for a log line
pub fn truncate_body(body: &str) -> String {
    let body = body.trim();
    if body.len() <= MAX_ERROR_BODY {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// Turn a non-success response into a [`ServiceError`], consuming the body.
pub async fn error_from_response(resp: reqwest::Response) -> ServiceError {
    let status = resp.status().as_u16();
    let hint = retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    ServiceError::from_status(status, hint, truncate_body(&body))
        .unwrap_or_else(|| ServiceError::InvalidResponse(format!("unexpected status {status}")))
}
