//! Annotation batcher: bounded batches, admission gate, rate limit, validation

use commentline_core::{
    AnnotatedComment, CancelToken, Classifier, ClassifyResponse, Outcome, RateLimiter, RawComment,
    RetryError, RetryPolicy, Semaphore, Sentiment, ServiceError, retry_with_backoff,
};

/// Split a page's comments into batches of at most `batch_size`, in order.
pub fn split_batches(items: Vec<RawComment>, batch_size: usize) -> Vec<Vec<RawComment>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

/// Classifies batches under the shared concurrency gate and rate limiter.
pub struct Annotator<'a> {
    classifier: &'a dyn Classifier,
    gate: &'a Semaphore,
    limiter: &'a RateLimiter,
    policy: &'a RetryPolicy,
    cancel: &'a CancelToken,
}

impl<'a> Annotator<'a> {
    pub fn new(
        classifier: &'a dyn Classifier,
        gate: &'a Semaphore,
        limiter: &'a RateLimiter,
        policy: &'a RetryPolicy,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            classifier,
            gate,
            limiter,
            policy,
            cancel,
        }
    }

    /// One classifier call, holding a gate permit for its duration
    fn call(&self, texts: &[&str]) -> Result<ClassifyResponse, ServiceError> {
        let Some(_permit) = self.gate.acquire() else {
            return Err(ServiceError::Cancelled);
        };
        if !self.limiter.acquire(self.cancel) {
            return Err(ServiceError::Cancelled);
        }
        self.classifier.classify(texts, self.cancel)
    }

    /// Annotate `batch`, returning one result per input in the same order.
    ///
    /// Transient failures are retried with backoff. A response that cannot be
    /// understood at all degrades the whole batch to `NEUTRAL` instead of
    /// failing it.
    pub fn annotate(
        &self,
        label: &str,
        batch: &[RawComment],
    ) -> Result<Vec<AnnotatedComment>, RetryError<ServiceError>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
        let result = retry_with_backoff(label, self.policy, self.cancel, |_| {
            Outcome::from(self.call(&texts))
        });

        match result {
            Ok(response) => Ok(validate(batch, response)),
            Err(RetryError::Fatal(ServiceError::InvalidResponse(m))) => {
                log::warn!("{label}: unusable classifier response, degrading batch: {m}");
                Ok(degrade_all(batch, self.classifier.model(), &m))
            }
            Err(e) => Err(e),
        }
    }

    /// [`annotate`](Self::annotate), submitting a failed batch again up to
    /// `resubmissions` more times. Fatal errors and cancellation end at once.
    pub fn annotate_resubmitting(
        &self,
        label: &str,
        batch: &[RawComment],
        resubmissions: u32,
    ) -> Result<Vec<AnnotatedComment>, RetryError<ServiceError>> {
        let mut round = 0;
        loop {
            match self.annotate(label, batch) {
                Err(RetryError::Exhausted { attempts, last }) if round < resubmissions => {
                    round += 1;
                    let delay = self.policy.backoff(round);
                    log::warn!(
                        "{label}: annotation failed after {attempts} attempts ({last}), \
                         resubmitting batch ({round}/{resubmissions})"
                    );
                    if !self.cancel.sleep(delay) {
                        return Err(RetryError::Cancelled);
                    }
                }
                other => return other,
            }
        }
    }
}

fn degraded(comment: &RawComment, model_version: &str, diagnostic: String) -> AnnotatedComment {
    AnnotatedComment {
        comment: comment.clone(),
        sentiment: Sentiment::Neutral,
        confidence: 0.0,
        model_version: model_version.to_string(),
        diagnostic: Some(diagnostic),
    }
}

fn degrade_all(batch: &[RawComment], model_version: &str, reason: &str) -> Vec<AnnotatedComment> {
    batch
        .iter()
        .map(|c| degraded(c, model_version, format!("invalid response: {reason}")))
        .collect()
}

/// Pair each comment with its positional result, replacing anything
/// unusable with a flagged `NEUTRAL`.
pub fn validate(batch: &[RawComment], response: ClassifyResponse) -> Vec<AnnotatedComment> {
    let ClassifyResponse {
        model_version,
        results,
    } = response;
    if results.len() > batch.len() {
        log::debug!(
            "classifier returned {} results for {} comments, ignoring extras",
            results.len(),
            batch.len()
        );
    }

    let mut out = Vec::with_capacity(batch.len());
    let mut flagged = 0usize;
    for (i, comment) in batch.iter().enumerate() {
        let annotated = match results.get(i) {
            None => degraded(comment, &model_version, format!("no result at position {i}")),
            Some(result) if result.label.trim().is_empty() => {
                degraded(comment, &model_version, "missing label".to_string())
            }
            Some(result) => match Sentiment::from_label(&result.label) {
                None => degraded(
                    comment,
                    &model_version,
                    format!("unknown label {:?}", result.label),
                ),
                Some(sentiment) => {
                    let (confidence, diagnostic) = if !result.confidence.is_finite() {
                        (0.0, Some("confidence is not a number".to_string()))
                    } else if !(0.0..=1.0).contains(&result.confidence) {
                        let clamped = result.confidence.clamp(0.0, 1.0);
                        (
                            clamped,
                            Some(format!("confidence {} clamped to {clamped}", result.confidence)),
                        )
                    } else {
                        (result.confidence, None)
                    };
                    AnnotatedComment {
                        comment: comment.clone(),
                        sentiment,
                        confidence,
                        model_version: model_version.clone(),
                        diagnostic,
                    }
                }
            },
        };
        if annotated.is_degraded() {
            flagged += 1;
        }
        out.push(annotated);
    }
    if flagged > 0 {
        log::warn!("{flagged}/{} classifier results flagged", batch.len());
    }
    out
}
