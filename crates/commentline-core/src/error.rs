//! Error taxonomy shared by the comment source, classifier and object store

use std::time::Duration;

/// Failure reported by an external collaborator.
///
/// The variant decides how callers react: `Transient` and `RateLimited`
/// are retried, `QuotaExhausted` pauses the run, everything else is fatal
/// for the call.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// Credentials rejected (401/403). Never retried.
    Auth(String),
    /// Resource missing or not accessible (404, comments disabled)
    NotFound(String),
    /// 429 or equivalent; `retry_after` comes from the server when present
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// Network error, timeout, 5xx
    Transient(String),
    /// Payload could not be understood
    InvalidResponse(String),
    /// Daily quota used up, locally or as reported by the server
    QuotaExhausted(String),
    /// The run was cancelled while the call was in flight
    Cancelled,
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auth(m) => write!(f, "authentication failed: {m}"),
            Self::NotFound(m) => write!(f, "not found: {m}"),
            Self::RateLimited {
                retry_after: Some(d),
                message,
            } => write!(f, "rate limited (retry after {}s): {message}", d.as_secs()),
            Self::RateLimited {
                retry_after: None,
                message,
            } => write!(f, "rate limited: {message}"),
            Self::Transient(m) => write!(f, "transient error: {m}"),
            Self::InvalidResponse(m) => write!(f, "invalid response: {m}"),
            Self::QuotaExhausted(m) => write!(f, "quota exhausted: {m}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Server-provided delay hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status to an error class. `None` for success codes.
    pub fn from_status(
        status: u16,
        retry_after: Option<Duration>,
        message: String,
    ) -> Option<Self> {
        match status {
            200..=399 => None,
            401 | 403 => Some(Self::Auth(message)),
            404 | 410 => Some(Self::NotFound(message)),
            408 => Some(Self::Transient(message)),
            429 => Some(Self::RateLimited {
                retry_after,
                message,
            }),
            500..=599 => Some(Self::Transient(message)),
            _ => Some(Self::InvalidResponse(format!("HTTP {status}: {message}"))),
        }
    }

    /// Classify a reqwest failure that carries no usable response.
    ///
    /// The URL is stripped so query-string API keys never reach the logs.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        let is_decode = e.is_decode();
        let message = e.without_url().to_string();
        if let Some(status) = status {
            if let Some(err) = Self::from_status(status, None, message.clone()) {
                return err;
            }
        }
        if is_decode {
            Self::InvalidResponse(message)
        } else {
            // timeouts, connect and body errors
            Self::Transient(message)
        }
    }
}
