//! Comment records as they move through the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A comment exactly as fetched from the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawComment {
    /// Opaque ID, unique within the source
    pub id: String,
    pub author: String,
    pub text: String,
    pub published_at: DateTime<Utc>,
    /// Set for replies; the thread's top-level comment ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub like_count: u64,
}

/// One page of source results.
///
/// `page_token == None` is the first page, `next_page_token == None` the last.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub page_token: Option<String>,
    pub items: Vec<RawComment>,
    pub next_page_token: Option<String>,
}

impl SourcePage {
    pub fn is_last(&self) -> bool {
        self.next_page_token.is_none()
    }
}

/// Sentiment classes accepted from the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Mixed,
}

impl Sentiment {
    /// Parse a classifier label (case-insensitive, surrounding whitespace ignored)
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_uppercase().as_str() {
            "POSITIVE" => Some(Self::Positive),
            "NEUTRAL" => Some(Self::Neutral),
            "NEGATIVE" => Some(Self::Negative),
            "MIXED" => Some(Self::Mixed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Positive => "POSITIVE",
            Self::Neutral => "NEUTRAL",
            Self::Negative => "NEGATIVE",
            Self::Mixed => "MIXED",
        }
    }

    pub fn all() -> &'static [Sentiment] {
        &[Self::Positive, Self::Neutral, Self::Negative, Self::Mixed]
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw comment plus its sentiment annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedComment {
    #[serde(flatten)]
    pub comment: RawComment,
    pub sentiment: Sentiment,
    /// Always within `[0, 1]`
    pub confidence: f64,
    pub model_version: String,
    /// Why the classifier's answer for this comment was replaced by a default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl AnnotatedComment {
    pub fn id(&self) -> &str {
        &self.comment.id
    }

    pub fn is_degraded(&self) -> bool {
        self.diagnostic.is_some()
    }
}
