//! Response types for `commentThreads.list`
//!
//! Only the fields the pipeline reads are modelled; everything else in the
//! API response is ignored by serde.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use commentline_core::RawComment;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThreadList {
    #[serde(default)]
    pub items: Vec<CommentThread>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentThread {
    pub id: String,
    pub snippet: ThreadSnippet,
    /// Present only when `part` includes `replies`
    #[serde(default)]
    pub replies: Option<Replies>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSnippet {
    pub top_level_comment: Comment,
    #[serde(default)]
    pub total_reply_count: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct Replies {
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub id: String,
    pub snippet: CommentSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentSnippet {
    #[serde(default)]
    pub author_display_name: String,
    #[serde(default)]
    pub text_display: String,
    #[serde(default)]
    pub text_original: Option<String>,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl Comment {
    fn into_raw(self, parent_id: Option<String>) -> RawComment {
        let s = self.snippet;
        RawComment {
            id: self.id,
            author: s.author_display_name,
            text: s.text_original.unwrap_or(s.text_display),
            published_at: s.published_at,
            parent_id: parent_id.or(s.parent_id),
            like_count: s.like_count,
        }
    }
}

impl CommentThread {
    /// The top-level comment followed by its inline replies (if requested).
    pub fn into_comments(self, include_replies: bool) -> Vec<RawComment> {
        let thread_id = self.id;
        let mut out = vec![self.snippet.top_level_comment.into_raw(None)];
        if include_replies {
            if let Some(replies) = self.replies {
                out.extend(
                    replies
                        .comments
                        .into_iter()
                        .map(|c| c.into_raw(Some(thread_id.clone()))),
                );
            }
        }
        out
    }
}

/// Google API error envelope
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub reason: String,
}

impl ApiError {
    pub fn reason(&self) -> Option<&str> {
        self.errors.first().map(|e| e.reason.as_str())
    }
}
