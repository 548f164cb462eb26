//! Pipeline tuning knobs

use commentline_core::RetryPolicy;

/// Runtime configuration for one ingestion run.
///
/// Every value is a starting point; the CLI fills these from the config
/// file and flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Comments per classification request
    pub batch_size: usize,
    /// Concurrent classification calls
    pub max_in_flight: usize,
    /// Classification requests per second (0 = unlimited)
    pub requests_per_second: f64,
    /// Requests allowed back to back before the rate applies
    pub burst: u32,
    pub annotate_workers: usize,
    pub write_workers: usize,
    /// Capacity of the batch queue between fetch and annotate
    pub fetch_queue: usize,
    /// Pages fetched but not yet committed
    pub max_pages_in_flight: usize,
    /// Extra submissions of a batch whose classification failed
    pub max_batch_retries: u32,
    /// Backoff for every external call
    pub retry: RetryPolicy,
    /// Stop after the page on which this many comments have been fetched
    pub max_comments: Option<usize>,
    /// Store a JSON run summary next to the artifacts
    pub write_summary: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_in_flight: 4,
            requests_per_second: 5.0,
            burst: 4,
            annotate_workers: 4,
            write_workers: 2,
            fetch_queue: 16,
            max_pages_in_flight: 4,
            max_batch_retries: 2,
            retry: RetryPolicy::default(),
            max_comments: None,
            write_summary: true,
        }
    }
}

impl PipelineConfig {
    /// Settings for tests: no waiting, no rate limit
    pub fn fast() -> Self {
        Self {
            requests_per_second: 0.0,
            retry: RetryPolicy::no_delay(5),
            ..Self::default()
        }
    }

    /// Clamp zero values that would stall the pipeline
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.max_in_flight = self.max_in_flight.max(1);
        self.annotate_workers = self.annotate_workers.max(1);
        self.write_workers = self.write_workers.max(1);
        self.fetch_queue = self.fetch_queue.max(1);
        self.max_pages_in_flight = self.max_pages_in_flight.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.max_batch_retries, 2);
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.max_comments.is_none());
    }

    #[test]
    fn normalized_clamps_zeros() {
        let config = PipelineConfig {
            batch_size: 0,
            annotate_workers: 0,
            max_pages_in_flight: 0,
            ..PipelineConfig::default()
        }
        .normalized();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.annotate_workers, 1);
        assert_eq!(config.max_pages_in_flight, 1);
    }

    #[test]
    fn fast_has_no_delays() {
        let config = PipelineConfig::fast();
        assert_eq!(config.retry.backoff(1), std::time::Duration::ZERO);
        assert_eq!(config.requests_per_second, 0.0);
    }
}
