//! Commentline Core - shared infrastructure for the comment annotation pipeline
//!
//! Data model, error taxonomy, retry/backoff, admission gate, rate limiter,
//! quota accounting, cancellation, HTTP plumbing and the capability traits
//! for the comment source and the classifier.

pub mod cancel;
pub mod error;
pub mod http;
pub mod logging;
pub mod model;
pub mod progress;
pub mod quota;
pub mod rate_limit;
pub mod retry;
pub mod semaphore;
pub mod service;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use error::ServiceError;
pub use http::{SHARED_RUNTIME, block_on_cancellable, http_client};
pub use logging::{IndicatifLogger, init_logging};
pub use model::{AnnotatedComment, RawComment, Sentiment, SourcePage};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use quota::{QuotaBudget, QuotaExceeded, QuotaLedger};
pub use rate_limit::RateLimiter;
pub use retry::{Outcome, RetryError, RetryHint, RetryPolicy, retry_with_backoff};
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use service::{Classification, Classifier, ClassifyResponse, CommentSource, PageResponse};
