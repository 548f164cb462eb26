//! End-to-end runs against in-memory fakes of the source, classifier and store

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use commentline_core::{
    AnnotatedComment, CancelToken, Classification, Classifier, ClassifyResponse, CommentSource,
    PageResponse, QuotaBudget, RawComment, RetryPolicy, Sentiment, ServiceError,
};
use commentline_pipeline::{
    ExitStatus, Pipeline, PipelineConfig, PipelineError, RunReport, RunState, RunSummary,
    SinkWriter, page_prefix,
};
use commentline_store::{
    Checkpoint, CheckpointStore, MemoryCheckpointStore, MemoryObjectStore, ObjectStore,
};

const VIDEO: &str = "vid";

fn token(index: usize) -> Option<String> {
    (index > 0).then(|| format!("t{index}"))
}

/// Pages `c{page}_{n}`; page `i > 0` is requested with token `t{i}`
struct FakeSource {
    pages: Vec<Vec<String>>,
    calls: AtomicUsize,
    requested: Mutex<Vec<Option<String>>>,
    /// Server rejects every call after this many
    quota_after: Option<usize>,
    /// This page always fails transiently
    fail_page: Option<usize>,
    advances: Arc<AtomicUsize>,
    max_ahead: AtomicUsize,
}

impl FakeSource {
    fn new(sizes: &[usize], advances: Arc<AtomicUsize>) -> Self {
        let pages = sizes
            .iter()
            .enumerate()
            .map(|(p, &n)| (0..n).map(|j| format!("c{p}_{j}")).collect())
            .collect();
        Self::with_pages(pages, advances)
    }

    fn with_pages(pages: Vec<Vec<String>>, advances: Arc<AtomicUsize>) -> Self {
        Self {
            pages,
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
            quota_after: None,
            fail_page: None,
            advances,
            max_ahead: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn raw(id: &str) -> RawComment {
    RawComment {
        id: id.to_string(),
        author: "viewer".into(),
        text: format!("comment {id}"),
        published_at: "2024-05-01T10:00:00Z".parse().unwrap(),
        parent_id: None,
        like_count: 0,
    }
}

impl CommentSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn get_page(
        &self,
        _video_id: &str,
        page_token: Option<&str>,
        _cancel: &CancelToken,
    ) -> Result<PageResponse, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requested.lock().unwrap().push(page_token.map(str::to_string));
        let ahead = n.saturating_sub(self.advances.load(Ordering::SeqCst));
        self.max_ahead.fetch_max(ahead, Ordering::SeqCst);

        if self.quota_after.is_some_and(|q| n > q) {
            return Err(ServiceError::QuotaExhausted("quotaExceeded".into()));
        }
        let index = match page_token {
            None => 0,
            Some(t) => t
                .strip_prefix('t')
                .and_then(|i| i.parse().ok())
                .ok_or_else(|| ServiceError::InvalidResponse(format!("bad token {t}")))?,
        };
        if self.fail_page == Some(index) {
            return Err(ServiceError::Transient("503 backend error".into()));
        }
        let ids = self
            .pages
            .get(index)
            .ok_or_else(|| ServiceError::NotFound(format!("page {index}")))?;
        Ok(PageResponse {
            items: ids.iter().map(|id| raw(id)).collect(),
            next_page_token: (index + 1 < self.pages.len()).then(|| format!("t{}", index + 1)),
            quota_cost: 1,
        })
    }
}

/// Labels comments containing "bad" NEGATIVE, everything else POSITIVE
#[derive(Default)]
struct FakeClassifier {
    delay: Duration,
    /// Transient failures left, keyed by the first comment ID of a batch
    fail_first: Mutex<HashMap<String, usize>>,
    calls: Mutex<HashMap<String, usize>>,
    fatal: Option<ServiceError>,
    /// Added to every label's confidence, to vary payloads between runs
    skew: f64,
}

impl FakeClassifier {
    fn calls_for(&self, first_id: &str) -> usize {
        self.calls.lock().unwrap().get(first_id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

impl Classifier for FakeClassifier {
    fn model(&self) -> &str {
        "fake-1"
    }

    fn classify(
        &self,
        texts: &[&str],
        _cancel: &CancelToken,
    ) -> Result<ClassifyResponse, ServiceError> {
        let key = texts
            .first()
            .map(|t| t.trim_start_matches("comment ").to_string())
            .unwrap_or_default();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;

        if let Some(e) = &self.fatal {
            return Err(e.clone());
        }
        if let Some(left) = self.fail_first.lock().unwrap().get_mut(&key) {
            if *left > 0 {
                *left -= 1;
                return Err(ServiceError::Transient("502 bad gateway".into()));
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(ClassifyResponse {
            model_version: "fake-1".into(),
            results: texts
                .iter()
                .map(|t| {
                    let label = if t.contains("bad") { "NEGATIVE" } else { "POSITIVE" };
                    Classification::new(label, 0.5 + self.skew)
                })
                .collect(),
        })
    }
}

/// Counts saves so the source can see how far fetching runs ahead
struct CountingCheckpoints {
    inner: MemoryCheckpointStore,
    advances: Arc<AtomicUsize>,
}

impl CountingCheckpoints {
    fn new(advances: Arc<AtomicUsize>) -> Self {
        Self {
            inner: MemoryCheckpointStore::new(),
            advances,
        }
    }
}

impl CheckpointStore for CountingCheckpoints {
    fn load(&self, source_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        self.inner.load(source_id)
    }

    fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        self.inner.save(checkpoint)?;
        self.advances.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reset(&self, source_id: &str) -> anyhow::Result<bool> {
        self.inner.reset(source_id)
    }
}

fn fast(batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        batch_size,
        ..PipelineConfig::fast()
    }
}

fn run(
    source: &FakeSource,
    classifier: &FakeClassifier,
    store: &MemoryObjectStore,
    checkpoints: &CountingCheckpoints,
    budget: &QuotaBudget,
    config: PipelineConfig,
    resume: bool,
) -> RunReport {
    Pipeline::new(source, classifier, store, checkpoints, budget, config)
        .run_with_report(VIDEO, resume)
}

fn artifacts(store: &MemoryObjectStore) -> Vec<Vec<AnnotatedComment>> {
    let cancel = CancelToken::new();
    store
        .list("comments/vid/", &cancel)
        .unwrap()
        .iter()
        .map(|key| {
            let bytes = store.get(key, &cancel).unwrap().unwrap();
            serde_json::from_slice(&bytes).unwrap()
        })
        .collect()
}

fn stored_ids(store: &MemoryObjectStore) -> Vec<String> {
    let mut ids: Vec<String> = artifacts(store)
        .into_iter()
        .flatten()
        .map(|a| a.comment.id)
        .collect();
    ids.sort();
    ids
}

fn expected_ids(sizes: &[usize]) -> Vec<String> {
    let mut ids: Vec<String> = sizes
        .iter()
        .enumerate()
        .flat_map(|(p, &n)| (0..n).map(move |j| format!("c{p}_{j}")))
        .collect();
    ids.sort();
    ids
}

#[test]
fn every_comment_stored_exactly_once() {
    let sizes = [7, 7, 7, 7, 7];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(3), true);

    assert_eq!(report.status, ExitStatus::Success);
    assert!(report.error.is_none());
    assert_eq!(stored_ids(&store), expected_ids(&sizes));
    assert_eq!(artifacts(&store).len(), 5);
    assert_eq!(report.summary.comments_stored, 35);
    assert_eq!(report.summary.sentiments["POSITIVE"], 35);
    assert_eq!(report.summary.quota_used, 5);
    assert_eq!(
        report.transitions,
        vec![RunState::Init, RunState::Streaming, RunState::Draining, RunState::Done]
    );
    let checkpoint = report.checkpoint.unwrap();
    assert!(checkpoint.completed);
    assert_eq!(checkpoint.next_page_token, None);
    assert_eq!(checkpoint.comments_committed, 35);
}

#[test]
fn pages_commit_in_fetch_order_and_keep_comment_order() {
    let sizes = [5, 4, 6, 3];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier {
        delay: Duration::from_millis(2),
        ..FakeClassifier::default()
    };
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(2), true);
    assert_eq!(report.status, ExitStatus::Success);

    let committed: Vec<Option<String>> = checkpoints
        .inner
        .history()
        .into_iter()
        .map(|c| c.last_committed_page_token)
        .collect();
    assert_eq!(committed, (0..4).map(token).collect::<Vec<_>>());

    for artifact in artifacts(&store) {
        let page = artifact[0].comment.id.split('_').next().unwrap().to_string();
        let expected: Vec<String> =
            (0..artifact.len()).map(|j| format!("{page}_{j}")).collect();
        let ids: Vec<String> = artifact.iter().map(|a| a.comment.id.clone()).collect();
        assert_eq!(ids, expected);
    }
}

#[test]
fn flaky_classification_is_retried_until_success() {
    let sizes = [2, 2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    classifier
        .fail_first
        .lock()
        .unwrap()
        .insert("c1_0".to_string(), 2);
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(stored_ids(&store), expected_ids(&sizes));
    assert_eq!(classifier.calls_for("c1_0"), 3);
    assert_eq!(classifier.calls_for("c0_0"), 1);
    let checkpoint = checkpoints.load(VIDEO).unwrap().unwrap();
    assert_eq!(checkpoint.next_page_token, None);
    assert!(checkpoint.completed);
}

#[test]
fn local_quota_pauses_and_rerun_resumes() {
    let sizes = [2, 2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);

    let budget = QuotaBudget::new(1);
    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::QuotaPaused);
    assert_eq!(report.status.code(), 75);
    assert!(report.transitions.contains(&RunState::QuotaPaused));
    assert_eq!(report.transitions.last(), Some(&RunState::Done));
    assert_eq!(stored_ids(&store), expected_ids(&[2]));
    assert_eq!(report.summary.next_page_token.as_deref(), Some("t1"));
    let checkpoint = checkpoints.load(VIDEO).unwrap().unwrap();
    assert_eq!(checkpoint.last_committed_page_token, None);
    assert_eq!(checkpoint.next_page_token.as_deref(), Some("t1"));
    assert!(!checkpoint.completed);
    assert_eq!(source.calls(), 1);

    let budget = QuotaBudget::new(100);
    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.transitions[1], RunState::Resuming);
    assert_eq!(source.requested.lock().unwrap()[1].as_deref(), Some("t1"));
    assert_eq!(stored_ids(&store), expected_ids(&sizes));
}

#[test]
fn server_quota_rejection_pauses() {
    let sizes = [2, 2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let mut source = FakeSource::new(&sizes, advances.clone());
    source.quota_after = Some(1);
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::QuotaPaused);
    assert_eq!(budget.remaining(), 0);
    assert_eq!(stored_ids(&store), expected_ids(&[2]));
    // Not retried
    assert_eq!(source.calls(), 2);
}

#[test]
fn completed_source_is_not_fetched_again() {
    let sizes = [3, 3];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);
    let config = PipelineConfig {
        write_summary: false,
        ..fast(20)
    };

    run(&source, &classifier, &store, &checkpoints, &budget, config.clone(), true);
    let calls = source.calls();
    let writes = store.write_count();

    let report = run(&source, &classifier, &store, &checkpoints, &budget, config, true);
    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(
        report.transitions,
        vec![RunState::Init, RunState::Resuming, RunState::Done]
    );
    assert_eq!(source.calls(), calls);
    assert_eq!(store.write_count(), writes);
    assert_eq!(report.summary.pages_committed, 0);
}

#[test]
fn fresh_rerun_reuses_identical_artifacts() {
    let sizes = [3, 3, 3];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);
    let config = PipelineConfig {
        write_summary: false,
        ..fast(20)
    };

    let first = run(&source, &classifier, &store, &checkpoints, &budget, config.clone(), true);
    let second = run(&source, &classifier, &store, &checkpoints, &budget, config, false);

    assert_eq!(first.summary.artifacts_written, 3);
    assert_eq!(second.status, ExitStatus::Success);
    assert_eq!(second.summary.artifacts_written, 0);
    assert_eq!(second.summary.artifacts_reused, 3);
    assert_eq!(store.write_count(), 3);
    assert_eq!(stored_ids(&store), expected_ids(&sizes));
}

#[test]
fn replayed_page_adopts_earlier_artifact() {
    let sizes = [2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    // An earlier run stored page 1 with different labels, then died before
    // the checkpoint moved
    let earlier: Vec<AnnotatedComment> = ["c0_0", "c0_1"]
        .iter()
        .map(|id| AnnotatedComment {
            comment: raw(id),
            sentiment: Sentiment::Mixed,
            confidence: 0.4,
            model_version: "fake-0".into(),
            diagnostic: None,
        })
        .collect();
    let policy = RetryPolicy::no_delay(0);
    let cancel = CancelToken::new();
    let previous = SinkWriter::new(&store, &policy, &cancel)
        .write(VIDEO, None, &earlier)
        .unwrap();

    let classifier = FakeClassifier {
        skew: 0.3,
        ..FakeClassifier::default()
    };
    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::Success);
    let first_page = store.list(&page_prefix(VIDEO, None), &cancel).unwrap();
    assert_eq!(first_page, vec![previous.key]);
    assert_eq!(stored_ids(&store), expected_ids(&sizes));
    assert_eq!(report.summary.artifacts_reused, 1);
    assert_eq!(report.summary.artifacts_written, 1);
}

#[test]
fn shifted_page_on_rerun_keeps_new_comment() {
    let advances = Arc::new(AtomicUsize::new(0));
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances.clone());
    let budget = QuotaBudget::new(10_000);
    let classifier = FakeClassifier::default();

    let source = FakeSource::new(&[2, 1], advances.clone());
    let first = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);
    assert_eq!(first.status, ExitStatus::Success);

    // A new comment arrived at the head of the second page
    let pages = vec![
        vec!["c0_0".to_string(), "c0_1".to_string()],
        vec!["new_0".to_string(), "c1_0".to_string()],
    ];
    let source = FakeSource::with_pages(pages, advances);
    let second = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), false);

    assert_eq!(second.status, ExitStatus::Success);
    assert_eq!(stored_ids(&store), vec!["c0_0", "c0_1", "c1_0", "new_0"]);
    assert_eq!(second.summary.comments_stored, 4);
    assert_eq!(second.summary.artifacts_reused, 1);
    assert_eq!(second.summary.artifacts_written, 1);
    let second_page = store.list(&page_prefix(VIDEO, Some("t1")), &CancelToken::new()).unwrap();
    assert_eq!(second_page.len(), 2);
    assert_eq!(second.checkpoint.unwrap().comments_committed, 4);
}

#[test]
fn resumed_page_skips_already_processed_ids() {
    let advances = Arc::new(AtomicUsize::new(0));
    // Page 2 re-delivers the last comment of page 1 at its head
    let pages = vec![
        vec!["c0_0".to_string(), "c0_1".to_string()],
        vec!["c0_1".to_string(), "c1_0".to_string(), "c1_1".to_string()],
    ];
    let source = FakeSource::with_pages(pages, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    checkpoints
        .inner
        .save(&Checkpoint::advanced(
            None,
            VIDEO,
            None,
            Some("t1"),
            &["c0_0".to_string(), "c0_1".to_string()],
        ))
        .unwrap();
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(*source.requested.lock().unwrap(), vec![Some("t1".to_string())]);
    assert_eq!(stored_ids(&store), vec!["c1_0".to_string(), "c1_1".to_string()]);
    let checkpoint = report.checkpoint.unwrap();
    assert!(checkpoint.completed);
    assert_eq!(checkpoint.pages_committed, 2);
    assert_eq!(checkpoint.processed_comment_ids.len(), 3);
}

#[test]
fn fetch_window_bounds_pages_ahead_of_commit() {
    let sizes = [1; 8];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier {
        delay: Duration::from_millis(15),
        ..FakeClassifier::default()
    };
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);
    let config = PipelineConfig {
        max_pages_in_flight: 2,
        ..fast(20)
    };

    let report = run(&source, &classifier, &store, &checkpoints, &budget, config, true);

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(stored_ids(&store).len(), 8);
    let max_ahead = source.max_ahead.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max_ahead), "fetched {max_ahead} pages ahead");
}

#[test]
fn exhausted_fetch_retries_fail_the_run() {
    let sizes = [2, 2, 2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let mut source = FakeSource::new(&sizes, advances.clone());
    source.fail_page = Some(2);
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);
    let config = PipelineConfig {
        retry: RetryPolicy::no_delay(2),
        ..fast(20)
    };

    let report = run(&source, &classifier, &store, &checkpoints, &budget, config, true);

    assert_eq!(report.status, ExitStatus::Failed);
    assert!(matches!(
        report.error,
        Some(PipelineError::FetchFailed { .. })
    ));
    assert_eq!(report.transitions.last(), Some(&RunState::Done));
    assert!(report.transitions.contains(&RunState::Failed));

    // Whatever was committed has its artifact; nothing past the failure is stored
    let cancel = CancelToken::new();
    for checkpoint in checkpoints.inner.history() {
        let prefix = page_prefix(VIDEO, checkpoint.last_committed_page_token.as_deref());
        assert_eq!(store.list(&prefix, &cancel).unwrap().len(), 1);
    }
    assert!(checkpoints.inner.history().len() <= 2);
    assert!(stored_ids(&store).iter().all(|id| id.starts_with("c0") || id.starts_with("c1")));
}

#[test]
fn classifier_auth_failure_fails_without_advancing() {
    let sizes = [2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier {
        fatal: Some(ServiceError::Auth("invalid api key".into())),
        ..FakeClassifier::default()
    };
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::Failed);
    assert!(matches!(
        report.error,
        Some(PipelineError::AnnotationFailed { .. })
    ));
    assert!(checkpoints.load(VIDEO).unwrap().is_none());
    assert!(stored_ids(&store).is_empty());
    let summary: Vec<String> = store
        .keys()
        .into_iter()
        .filter(|k| k.starts_with("summaries/"))
        .collect();
    assert_eq!(summary.len(), 1);
    let bytes = store.get(&summary[0], &CancelToken::new()).unwrap().unwrap();
    let summary: RunSummary = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(summary.status, "FAILED");
    assert!(summary.error.unwrap().contains("authentication failed"));
}

#[test]
fn comment_limit_stops_after_current_page() {
    let sizes = [2, 2, 2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);
    let config = PipelineConfig {
        max_comments: Some(3),
        ..fast(20)
    };

    let report = run(&source, &classifier, &store, &checkpoints, &budget, config, true);

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(stored_ids(&store), expected_ids(&[2, 2]));
    assert_eq!(source.calls(), 2);
    let checkpoint = report.checkpoint.unwrap();
    assert!(!checkpoint.completed);
    assert_eq!(checkpoint.next_page_token.as_deref(), Some("t2"));
}

#[test]
fn empty_pages_advance_without_artifacts() {
    let sizes = [2, 0, 0, 1];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances.clone());
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(advances.load(Ordering::SeqCst), 4);
    assert_eq!(artifacts(&store).len(), 2);
    assert_eq!(report.summary.pages_committed, 4);
    assert_eq!(classifier.total_calls(), 2);
}

#[test]
fn transient_store_failures_are_retried() {
    let sizes = [2, 2];
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&sizes, advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    store.fail_next_puts(3);
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    let report = run(&source, &classifier, &store, &checkpoints, &budget, fast(20), true);

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(stored_ids(&store), expected_ids(&sizes));
}

#[test]
fn cancelled_run_fails_without_fetching() {
    let advances = Arc::new(AtomicUsize::new(0));
    let source = FakeSource::new(&[2, 2], advances.clone());
    let classifier = FakeClassifier::default();
    let store = MemoryObjectStore::new();
    let checkpoints = CountingCheckpoints::new(advances);
    let budget = QuotaBudget::new(10_000);

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = Pipeline::new(&source, &classifier, &store, &checkpoints, &budget, fast(20))
        .with_cancel(cancel)
        .run_with_report(VIDEO, true);

    assert_eq!(report.status, ExitStatus::Failed);
    assert!(report.error.as_ref().is_some_and(PipelineError::is_cancelled));
    assert_eq!(source.calls(), 0);
    assert!(checkpoints.load(VIDEO).unwrap().is_none());
}
