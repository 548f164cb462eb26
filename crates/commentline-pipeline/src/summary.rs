//! Per-run processing summary

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use commentline_core::{AnnotatedComment, CancelToken, Sentiment, ServiceError};
use commentline_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::error::ExitStatus;

/// Counters for one run, stored as JSON next to the artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub source_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub pages_committed: u64,
    pub comments_stored: u64,
    pub artifacts_written: u64,
    pub artifacts_reused: u64,
    /// Comments whose classifier answer was replaced by a default
    pub degraded: u64,
    pub sentiments: BTreeMap<String, u64>,
    pub quota_used: u64,
    /// Where the next run starts; `None` once the source is exhausted
    pub next_page_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: "RUNNING".to_string(),
            started_at: Utc::now(),
            finished_at: None,
            pages_committed: 0,
            comments_stored: 0,
            artifacts_written: 0,
            artifacts_reused: 0,
            degraded: 0,
            sentiments: Sentiment::all()
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect(),
            quota_used: 0,
            next_page_token: None,
            error: None,
        }
    }

    /// Count one committed page
    pub fn record_page(&mut self, comments: &[AnnotatedComment], written: bool) {
        self.pages_committed += 1;
        self.comments_stored += comments.len() as u64;
        if written {
            self.artifacts_written += 1;
        } else {
            self.artifacts_reused += 1;
        }
        for c in comments {
            *self.sentiments.entry(c.sentiment.as_str().to_string()).or_default() += 1;
            if c.is_degraded() {
                self.degraded += 1;
            }
        }
    }

    pub fn finish(&mut self, status: ExitStatus, error: Option<String>) {
        self.status = status.as_str().to_string();
        self.finished_at = Some(Utc::now());
        self.error = error;
    }

    /// `summaries/{source_id}/{started_at}.json`, with sub-second precision
    /// so back-to-back runs keep separate summaries
    pub fn key(&self) -> String {
        format!(
            "summaries/{}/{}.json",
            self.source_id,
            self.started_at.format("%Y%m%dT%H%M%S%.6fZ")
        )
    }

    /// Store the summary; an existing object under the same key is kept.
    pub fn store(
        &self,
        store: &dyn ObjectStore,
        cancel: &CancelToken,
    ) -> Result<String, ServiceError> {
        let payload = serde_json::to_vec_pretty(self)
            .map_err(|e| ServiceError::InvalidResponse(format!("serialize summary: {e}")))?;
        let key = self.key();
        store.put_if_absent(&key, &payload, cancel)?;
        Ok(key)
    }
}
