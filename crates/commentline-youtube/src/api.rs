//! `commentThreads.list` client

use std::time::Duration;

use reqwest::Url;

use commentline_core::http::{http_client, retry_after, truncate_body};
use commentline_core::{
    CancelToken, CommentSource, PageResponse, ServiceError, block_on_cancellable,
};

use crate::schema::{ApiErrorBody, CommentThreadList};

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// API maximum for `maxResults`
pub const PAGE_SIZE: u32 = 100;

/// Quota units charged for one `commentThreads.list` call
pub const COMMENT_THREADS_COST: u64 = 1;

/// Comment source backed by the YouTube Data API.
///
/// The API key travels in the query string, so request URLs are never
/// logged and reqwest errors are stripped of their URL.
pub struct YouTubeSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    include_replies: bool,
}

impl YouTubeSource {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            anyhow::bail!("YouTube API key is empty (set YOUTUBE_API_KEY)");
        }
        Ok(Self {
            client: http_client(timeout)?,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            include_replies: false,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Also fetch the inline replies of each thread
    pub fn with_replies(mut self, include: bool) -> Self {
        self.include_replies = include;
        self
    }

    fn page_url(&self, video_id: &str, page_token: Option<&str>) -> Result<Url, ServiceError> {
        let mut url = Url::parse(&format!("{}/commentThreads", self.base_url))
            .map_err(|e| ServiceError::InvalidResponse(format!("bad base url: {e}")))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair(
                "part",
                if self.include_replies { "snippet,replies" } else { "snippet" },
            );
            q.append_pair("videoId", video_id);
            q.append_pair("maxResults", &PAGE_SIZE.to_string());
            q.append_pair("textFormat", "plainText");
            q.append_pair("order", "time");
            if let Some(token) = page_token {
                q.append_pair("pageToken", token);
            }
            q.append_pair("key", &self.api_key);
        }
        Ok(url)
    }
}

/// Map a failed API response using the `reason` of Google's error envelope,
/// falling back to the HTTP status.
pub fn map_api_error(status: u16, retry_after: Option<Duration>, body: &str) -> ServiceError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let message = parsed
        .as_ref()
        .map(|b| b.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| truncate_body(body));

    match parsed.as_ref().and_then(|b| b.error.reason()) {
        Some("quotaExceeded" | "dailyLimitExceeded") => ServiceError::QuotaExhausted(message),
        Some("commentsDisabled") => {
            ServiceError::NotFound(format!("comments are disabled for this video: {message}"))
        }
        Some("videoNotFound") => ServiceError::NotFound(format!("video not found: {message}")),
        Some("rateLimitExceeded" | "userRateLimitExceeded") => ServiceError::RateLimited {
            retry_after,
            message,
        },
        Some("keyInvalid") => ServiceError::Auth(message),
        _ => ServiceError::from_status(status, retry_after, message)
            .unwrap_or_else(|| {
                ServiceError::InvalidResponse(format!("unexpected status {status}"))
            }),
    }
}

impl CommentSource for YouTubeSource {
    fn name(&self) -> &str {
        "youtube"
    }

    fn page_cost(&self) -> u64 {
        COMMENT_THREADS_COST
    }

    fn get_page(
        &self,
        video_id: &str,
        page_token: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<PageResponse, ServiceError> {
        let url = self.page_url(video_id, page_token)?;
        let req = self.client.get(url);
        let include_replies = self.include_replies;
        log::debug!("{video_id}: fetching commentThreads page {page_token:?}");

        let page = block_on_cancellable(cancel, async move {
            let resp = req.send().await.map_err(ServiceError::from_reqwest)?;
            let status = resp.status();
            if !status.is_success() {
                let hint = retry_after(resp.headers());
                let body = resp.text().await.unwrap_or_default();
                log::debug!("commentThreads returned {status}");
                return Err(map_api_error(status.as_u16(), hint, &body));
            }
            let body = resp.text().await.map_err(ServiceError::from_reqwest)?;
            let list: CommentThreadList = serde_json::from_str(&body)
                .map_err(|e| ServiceError::InvalidResponse(format!("commentThreads: {e}")))?;

            let items = list
                .items
                .into_iter()
                .flat_map(|t| t.into_comments(include_replies))
                .collect();
            Ok(PageResponse {
                items,
                next_page_token: list.next_page_token.filter(|t| !t.is_empty()),
                quota_cost: COMMENT_THREADS_COST,
            })
        })?;
        log::debug!(
            "{video_id}: {} comments, next page {:?}",
            page.items.len(),
            page.next_page_token
        );
        Ok(page)
    }
}
