//! Pipeline orchestrator
//!
//! One fetch thread, a pool of annotation threads and a pool of write threads,
//! joined by bounded channels. The calling thread is the committer: it
//! reassembles pages, hands them to the writers and advances the checkpoint
//! strictly in fetch order. A page window bounds how many pages may be
//! fetched ahead of the last commit.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use commentline_core::{
    AnnotatedComment, CancelToken, Classifier, CommentSource, ProgressContext, QuotaBudget,
    RateLimiter, RawComment, Semaphore, fmt_num,
};
use commentline_store::{Checkpoint, CheckpointStore, ObjectStore, page_key};
use indicatif::ProgressBar;
use rustc_hash::FxHashSet;

use crate::batcher::{Annotator, split_batches};
use crate::config::PipelineConfig;
use crate::error::{ExitStatus, PipelineError};
use crate::reader::{FetchError, SourceReader};
use crate::sink::{SinkWriter, StoredArtifact};
use crate::summary::RunSummary;

/// How often the committer re-checks cancellation while idle
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Orchestrator states, in the order a run can visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Resuming,
    Streaming,
    QuotaPaused,
    Failed,
    Draining,
    Done,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Resuming => "RESUMING",
            Self::Streaming => "STREAMING",
            Self::QuotaPaused => "QUOTA_PAUSED",
            Self::Failed => "FAILED",
            Self::Draining => "DRAINING",
            Self::Done => "DONE",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visited states, logged as they happen
struct StateLog<'a> {
    source_id: &'a str,
    states: Vec<RunState>,
}

impl<'a> StateLog<'a> {
    fn new(source_id: &'a str) -> Self {
        Self {
            source_id,
            states: vec![RunState::Init],
        }
    }

    fn current(&self) -> RunState {
        self.states.last().copied().unwrap_or(RunState::Init)
    }

    fn enter(&mut self, next: RunState) {
        let prev = self.current();
        if prev == next {
            return;
        }
        log::info!("{}: {prev} -> {next}", self.source_id);
        self.states.push(next);
    }
}

/// Everything a finished run reports back.
#[derive(Debug)]
pub struct RunReport {
    pub status: ExitStatus,
    pub summary: RunSummary,
    /// Set when `status` is `Failed`
    pub error: Option<PipelineError>,
    /// Every state visited, starting with `Init` and ending with `Done`
    pub transitions: Vec<RunState>,
    /// Checkpoint as of the end of the run
    pub checkpoint: Option<Checkpoint>,
}

struct BatchJob {
    seq: u64,
    index: usize,
    page: String,
    comments: Vec<RawComment>,
}

struct WriteJob {
    seq: u64,
    page: String,
    page_token: Option<String>,
    comments: Vec<AnnotatedComment>,
}

/// Stage threads report to the committer through one unbounded channel
enum Event {
    /// Sent before any of the page's batches
    PageFetched {
        seq: u64,
        page_token: Option<String>,
        next_page_token: Option<String>,
        ids: Vec<String>,
        batches: usize,
    },
    Annotated {
        seq: u64,
        index: usize,
        comments: Vec<AnnotatedComment>,
    },
    Written {
        seq: u64,
        artifact: StoredArtifact,
    },
    /// No more pages; `capped` when the comment limit ended the stream
    SourceDone { capped: bool },
    QuotaExhausted(String),
    Failed(PipelineError),
}

/// A fetched page waiting for its batches, its write, or its turn to commit
struct PendingPage {
    page_token: Option<String>,
    next_page_token: Option<String>,
    ids: Vec<String>,
    batches: Vec<Option<Vec<AnnotatedComment>>>,
    remaining: usize,
    stored: Option<StoredArtifact>,
}

impl PendingPage {
    /// Empty pages commit without an artifact
    fn ready(&self) -> bool {
        self.batches.is_empty() || self.stored.is_some()
    }
}

struct StageLines {
    fetch: ProgressBar,
    annotate: ProgressBar,
    write: ProgressBar,
}

impl StageLines {
    fn new(progress: Option<&ProgressContext>) -> Self {
        let line = |name: &str| {
            progress
                .map(|p| p.stage_line(name))
                .unwrap_or_else(ProgressBar::hidden)
        };
        Self {
            fetch: line("fetch"),
            annotate: line("annotate"),
            write: line("commit"),
        }
    }

    fn finish(&self) {
        self.fetch.finish_and_clear();
        self.annotate.finish_and_clear();
        self.write.finish_and_clear();
    }
}

/// Single checkpoint writer; commits pages in fetch order.
struct Committer<'a, 's> {
    source_id: &'s str,
    checkpoints: &'a dyn CheckpointStore,
    page_window: &'a Semaphore,
    write_tx: SyncSender<WriteJob>,
    pending: BTreeMap<u64, PendingPage>,
    next_seq: u64,
    source_finished: bool,
    paused: bool,
    checkpoint: &'a mut Option<Checkpoint>,
    summary: &'a mut RunSummary,
    states: &'a mut StateLog<'s>,
    line: &'a ProgressBar,
}

impl Committer<'_, '_> {
    fn finished(&self) -> bool {
        self.source_finished && self.pending.is_empty()
    }

    fn handle(&mut self, event: Event) -> Result<(), PipelineError> {
        match event {
            Event::PageFetched {
                seq,
                page_token,
                next_page_token,
                ids,
                batches,
            } => {
                self.pending.insert(
                    seq,
                    PendingPage {
                        page_token,
                        next_page_token,
                        ids,
                        batches: (0..batches).map(|_| None).collect(),
                        remaining: batches,
                        stored: None,
                    },
                );
            }
            Event::Annotated {
                seq,
                index,
                comments,
            } => {
                let page = self.pending.get_mut(&seq).ok_or_else(|| {
                    PipelineError::Worker(format!("batch for unknown page #{seq}"))
                })?;
                let slot = page
                    .batches
                    .get_mut(index)
                    .ok_or_else(|| PipelineError::Worker(format!("unknown batch {index}")))?;
                if slot.replace(comments).is_none() {
                    page.remaining -= 1;
                }
                if page.remaining == 0 {
                    let comments: Vec<AnnotatedComment> = page
                        .batches
                        .iter_mut()
                        .flat_map(|b| b.take().unwrap_or_default())
                        .collect();
                    let job = WriteJob {
                        seq,
                        page: page_key(page.page_token.as_deref()),
                        page_token: page.page_token.clone(),
                        comments,
                    };
                    self.write_tx
                        .send(job)
                        .map_err(|_| PipelineError::Worker("write stage stopped".into()))?;
                }
            }
            Event::Written { seq, artifact } => {
                let page = self.pending.get_mut(&seq).ok_or_else(|| {
                    PipelineError::Worker(format!("write for unknown page #{seq}"))
                })?;
                page.stored = Some(artifact);
            }
            Event::SourceDone { capped } => {
                if capped {
                    log::info!("{}: comment limit reached", self.source_id);
                }
                self.source_finished = true;
                if !self.paused {
                    self.states.enter(RunState::Draining);
                }
            }
            Event::QuotaExhausted(message) => {
                log::warn!(
                    "{}: quota exhausted ({message}), committing fetched pages",
                    self.source_id
                );
                self.source_finished = true;
                self.paused = true;
                self.states.enter(RunState::QuotaPaused);
            }
            Event::Failed(e) => return Err(e),
        }
        self.commit_ready()
    }

    fn commit_ready(&mut self) -> Result<(), PipelineError> {
        loop {
            let ready = self.pending.get(&self.next_seq).is_some_and(PendingPage::ready);
            if !ready {
                return Ok(());
            }
            let Some(page) = self.pending.remove(&self.next_seq) else {
                return Ok(());
            };
            self.commit(page)?;
            self.next_seq += 1;
        }
    }

    fn commit(&mut self, page: PendingPage) -> Result<(), PipelineError> {
        let checkpoint = self
            .checkpoints
            .advance(
                self.source_id,
                page.page_token.as_deref(),
                page.next_page_token.as_deref(),
                &page.ids,
            )
            .map_err(PipelineError::Checkpoint)?;
        self.page_window.release();

        let key = page_key(page.page_token.as_deref());
        match &page.stored {
            Some(artifact) => {
                self.summary.record_page(&artifact.comments, artifact.written);
                log::debug!(
                    "{}/{key}: committed {} comments ({})",
                    self.source_id,
                    artifact.comment_count,
                    artifact.key
                );
            }
            None => {
                self.summary.pages_committed += 1;
                log::debug!("{}/{key}: committed empty page", self.source_id);
            }
        }
        self.line.set_message(format!(
            "{} pages, {} comments stored",
            fmt_num(self.summary.pages_committed as usize),
            fmt_num(self.summary.comments_stored as usize)
        ));
        *self.checkpoint = Some(checkpoint);
        Ok(())
    }
}

/// Drops comments already handed out on the previous page.
///
/// A resumed page, or one shifted by newly posted comments, re-delivers the
/// tail of the page before it, so only that page's IDs are remembered.
struct PageDedup {
    previous: FxHashSet<String>,
}

impl PageDedup {
    fn new(seed: Vec<String>) -> Self {
        Self {
            previous: seed.into_iter().collect(),
        }
    }

    /// Comments of `items` not seen on the previous page or earlier in
    /// `items`; the page's IDs replace the remembered set.
    fn filter(&mut self, items: Vec<RawComment>) -> Vec<RawComment> {
        let mut current = FxHashSet::default();
        current.reserve(items.len());
        let fresh = items
            .into_iter()
            .filter(|c| current.insert(c.id.clone()) && !self.previous.contains(&c.id))
            .collect();
        self.previous = current;
        fresh
    }

    #[cfg(test)]
    fn remembered(&self) -> usize {
        self.previous.len()
    }
}

/// Spawn a named stage thread; cancels the run if the OS refuses.
fn spawn_stage<'scope, F>(
    scope: &'scope Scope<'scope, '_>,
    name: String,
    cancel: &CancelToken,
    handles: &mut Vec<(String, ScopedJoinHandle<'scope, ()>)>,
    f: F,
) -> Result<(), PipelineError>
where
    F: FnOnce() + Send + 'scope,
{
    match thread::Builder::new().name(name.clone()).spawn_scoped(scope, f) {
        Ok(handle) => {
            handles.push((name, handle));
            Ok(())
        }
        Err(e) => {
            cancel.cancel();
            Err(PipelineError::Worker(format!("failed to spawn {name}: {e}")))
        }
    }
}

fn annotate_stage(
    annotator: &Annotator<'_>,
    jobs: &Mutex<Receiver<BatchJob>>,
    events: Sender<Event>,
    resubmissions: u32,
    cancel: &CancelToken,
    counter: &AtomicUsize,
    line: &ProgressBar,
) {
    loop {
        let job = jobs.lock().unwrap().recv();
        let Ok(job) = job else { return };
        if cancel.is_cancelled() {
            continue;
        }
        let label = format!("classify {} batch {}", job.page, job.index);
        let event = match annotator.annotate_resubmitting(&label, &job.comments, resubmissions) {
            Ok(comments) => {
                let n = counter.fetch_add(comments.len(), Ordering::Relaxed) + comments.len();
                line.set_message(format!("{} comments", fmt_num(n)));
                Event::Annotated {
                    seq: job.seq,
                    index: job.index,
                    comments,
                }
            }
            Err(error) => Event::Failed(PipelineError::AnnotationFailed {
                page: job.page,
                batch: job.index,
                error,
            }),
        };
        let _ = events.send(event);
    }
}

fn write_stage(
    source_id: &str,
    sink: &SinkWriter<'_>,
    jobs: &Mutex<Receiver<WriteJob>>,
    events: Sender<Event>,
    cancel: &CancelToken,
) {
    loop {
        let job = jobs.lock().unwrap().recv();
        let Ok(job) = job else { return };
        if cancel.is_cancelled() {
            continue;
        }
        let event = match sink.write(source_id, job.page_token.as_deref(), &job.comments) {
            Ok(artifact) => Event::Written {
                seq: job.seq,
                artifact,
            },
            Err(error) => Event::Failed(PipelineError::WriteFailed {
                page: job.page,
                error,
            }),
        };
        let _ = events.send(event);
    }
}

/// Ingests one source: fetch, classify, store, checkpoint.
pub struct Pipeline<'a> {
    source: &'a dyn CommentSource,
    classifier: &'a dyn Classifier,
    store: &'a dyn ObjectStore,
    checkpoints: &'a dyn CheckpointStore,
    budget: &'a QuotaBudget,
    config: PipelineConfig,
    cancel: CancelToken,
    progress: Option<&'a ProgressContext>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        source: &'a dyn CommentSource,
        classifier: &'a dyn Classifier,
        store: &'a dyn ObjectStore,
        checkpoints: &'a dyn CheckpointStore,
        budget: &'a QuotaBudget,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            classifier,
            store,
            checkpoints,
            budget,
            config: config.normalized(),
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    /// Use an externally controlled token (signal handling)
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: &'a ProgressContext) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run to completion, pause or failure.
    pub fn run(&self, source_id: &str, resume: bool) -> ExitStatus {
        self.run_with_report(source_id, resume).status
    }

    /// [`run`](Self::run) with the full report.
    ///
    /// With `resume = false` any stored checkpoint is discarded first.
    pub fn run_with_report(&self, source_id: &str, resume: bool) -> RunReport {
        let started = Instant::now();
        let quota_start = self.budget.used();
        let mut states = StateLog::new(source_id);
        let mut summary = RunSummary::new(source_id);

        let loaded = if resume {
            self.checkpoints.load(source_id)
        } else {
            self.checkpoints.reset(source_id).map(|removed| {
                if removed {
                    log::info!("{source_id}: discarded existing checkpoint");
                }
                None
            })
        };
        let mut checkpoint = match loaded {
            Ok(c) => c,
            Err(e) => {
                let outcome = Err(PipelineError::Checkpoint(e));
                return self.finish(states, summary, None, outcome, started, quota_start);
            }
        };

        if let Some(cp) = &checkpoint {
            states.enter(RunState::Resuming);
            if cp.completed {
                log::info!(
                    "{source_id}: already complete ({} pages, {} comments)",
                    cp.pages_committed,
                    cp.comments_committed
                );
                return self.finish(states, summary, checkpoint, Ok(false), started, quota_start);
            }
            log::info!(
                "{source_id}: resuming after {} committed pages",
                cp.pages_committed
            );
        }

        states.enter(RunState::Streaming);
        let outcome = self.stream(source_id, &mut checkpoint, &mut summary, &mut states);
        self.finish(states, summary, checkpoint, outcome, started, quota_start)
    }

    /// Returns whether the run paused on quota.
    fn stream<'s>(
        &self,
        source_id: &'s str,
        checkpoint: &mut Option<Checkpoint>,
        summary: &mut RunSummary,
        states: &mut StateLog<'s>,
    ) -> Result<bool, PipelineError> {
        let config = &self.config;
        let cancel = &self.cancel;
        let resume_token = checkpoint
            .as_ref()
            .and_then(|c| c.resume_token().map(str::to_string));
        let seen = PageDedup::new(
            checkpoint
                .as_ref()
                .map(|c| c.processed_comment_ids.clone())
                .unwrap_or_default(),
        );

        let page_window = Semaphore::new(config.max_pages_in_flight);
        let gate = Semaphore::new(config.max_in_flight);
        let limiter = RateLimiter::new(config.requests_per_second, config.burst);
        let annotator = Annotator::new(self.classifier, &gate, &limiter, &config.retry, cancel);
        let sink = SinkWriter::new(self.store, &config.retry, cancel);

        let (events_tx, events_rx) = mpsc::channel::<Event>();
        let (batch_tx, batch_rx) = mpsc::sync_channel::<BatchJob>(config.fetch_queue);
        let (write_tx, write_rx) = mpsc::sync_channel::<WriteJob>(config.max_pages_in_flight);
        let batch_rx = Mutex::new(batch_rx);
        let write_rx = Mutex::new(write_rx);

        let lines = StageLines::new(self.progress);
        let annotated = AtomicUsize::new(0);

        log::info!(
            "{source_id}: streaming from {} ({} annotate / {} write workers, {} pages in flight)",
            page_key(resume_token.as_deref()),
            config.annotate_workers,
            config.write_workers,
            config.max_pages_in_flight
        );

        let result = thread::scope(|scope| {
            let mut handles = Vec::new();

            for i in 0..config.write_workers {
                let events = events_tx.clone();
                let (sink, write_rx) = (&sink, &write_rx);
                spawn_stage(scope, format!("write-{i}"), cancel, &mut handles, move || {
                    write_stage(source_id, sink, write_rx, events, cancel)
                })?;
            }

            for i in 0..config.annotate_workers {
                let events = events_tx.clone();
                let (annotator, batch_rx, annotated) = (&annotator, &batch_rx, &annotated);
                let line = &lines.annotate;
                let resubmissions = config.max_batch_retries;
                spawn_stage(scope, format!("annotate-{i}"), cancel, &mut handles, move || {
                    annotate_stage(
                        annotator,
                        batch_rx,
                        events,
                        resubmissions,
                        cancel,
                        annotated,
                        line,
                    )
                })?;
            }

            {
                let events = events_tx.clone();
                let page_window = &page_window;
                let line = &lines.fetch;
                spawn_stage(scope, "fetch".to_string(), cancel, &mut handles, move || {
                    self.fetch_stage(
                        source_id,
                        resume_token,
                        seen,
                        page_window,
                        batch_tx,
                        events,
                        line,
                    )
                })?;
            }
            // Stages hold the only senders, so a disconnect means they all exited
            drop(events_tx);

            let mut committer = Committer {
                source_id,
                checkpoints: self.checkpoints,
                page_window: &page_window,
                write_tx,
                pending: BTreeMap::new(),
                next_seq: 0,
                source_finished: false,
                paused: false,
                checkpoint,
                summary,
                states,
                line: &lines.write,
            };

            let result = loop {
                if committer.finished() {
                    break Ok(committer.paused);
                }
                if cancel.is_cancelled() {
                    break Err(PipelineError::Cancelled);
                }
                match events_rx.recv_timeout(EVENT_POLL) {
                    Ok(event) => {
                        if let Err(e) = committer.handle(event) {
                            break Err(e);
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        break Err(PipelineError::Worker(
                            "all stages exited before the run finished".into(),
                        ));
                    }
                }
            };

            if result.is_err() {
                cancel.cancel();
            }
            // Wake anything still waiting on a permit; closing the write
            // queue lets the writers exit
            page_window.close();
            gate.close();
            drop(committer);

            let mut panicked = None;
            for (name, handle) in handles {
                if handle.join().is_err() {
                    log::error!("{name} panicked");
                    panicked.get_or_insert(name);
                }
            }
            match (result, panicked) {
                (Ok(_), Some(name)) => Err(PipelineError::Worker(format!("{name} panicked"))),
                (result, _) => result,
            }
        });

        lines.finish();
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn fetch_stage(
        &self,
        source_id: &str,
        resume_token: Option<String>,
        mut seen: PageDedup,
        page_window: &Semaphore,
        batches: SyncSender<BatchJob>,
        events: Sender<Event>,
        line: &ProgressBar,
    ) {
        let config = &self.config;
        let reader = SourceReader::new(self.source, self.budget, &config.retry, &self.cancel);
        let mut stream = reader.stream(source_id, resume_token.as_deref());
        let mut seq = 0u64;
        let mut fetched = 0usize;

        loop {
            if self.cancel.is_cancelled() || !page_window.acquire_permit() {
                return;
            }
            let Some(result) = stream.next() else {
                page_window.release();
                let _ = events.send(Event::SourceDone { capped: false });
                return;
            };

            let page = match result {
                Ok(page) => page,
                Err(FetchError::QuotaExhausted(message)) => {
                    let _ = events.send(Event::QuotaExhausted(message));
                    return;
                }
                Err(FetchError::Failed(error)) => {
                    let page = page_key(stream.resume_token().flatten());
                    let _ = events.send(Event::Failed(PipelineError::FetchFailed { page, error }));
                    return;
                }
            };

            let key = page_key(page.page_token.as_deref());
            let is_last = page.is_last();
            let ids: Vec<String> = page.items.iter().map(|c| c.id.clone()).collect();
            let fresh = seen.filter(page.items);
            if fresh.len() < ids.len() {
                log::debug!(
                    "{source_id}/{key}: skipped {} already processed comments",
                    ids.len() - fresh.len()
                );
            }
            fetched += fresh.len();

            let page_batches = split_batches(fresh, config.batch_size);
            let _ = events.send(Event::PageFetched {
                seq,
                page_token: page.page_token,
                next_page_token: page.next_page_token,
                ids,
                batches: page_batches.len(),
            });
            for (index, comments) in page_batches.into_iter().enumerate() {
                let job = BatchJob {
                    seq,
                    index,
                    page: key.clone(),
                    comments,
                };
                // Blocks while the annotators are behind
                if batches.send(job).is_err() {
                    return;
                }
            }
            seq += 1;
            line.set_message(format!(
                "{} pages, {} comments",
                fmt_num(seq as usize),
                fmt_num(fetched)
            ));

            if is_last {
                let _ = events.send(Event::SourceDone { capped: false });
                return;
            }
            if config.max_comments.is_some_and(|max| fetched >= max) {
                let _ = events.send(Event::SourceDone { capped: true });
                return;
            }
        }
    }

    fn finish(
        &self,
        mut states: StateLog<'_>,
        mut summary: RunSummary,
        checkpoint: Option<Checkpoint>,
        outcome: Result<bool, PipelineError>,
        started: Instant,
        quota_start: u64,
    ) -> RunReport {
        let source_id = states.source_id;
        let (status, error) = match outcome {
            Ok(false) => (ExitStatus::Success, None),
            Ok(true) => (ExitStatus::QuotaPaused, None),
            Err(e) => {
                if e.is_cancelled() {
                    log::warn!("{source_id}: run cancelled");
                } else {
                    log::error!("{source_id}: {e}");
                }
                states.enter(RunState::Failed);
                (ExitStatus::Failed, Some(e))
            }
        };
        states.enter(RunState::Done);

        summary.quota_used = self.budget.used().saturating_sub(quota_start);
        summary.next_page_token = checkpoint
            .as_ref()
            .and_then(|c| c.resume_token().map(str::to_string));
        summary.finish(status, error.as_ref().map(ToString::to_string));

        if self.config.write_summary {
            // Fresh token: a cancelled run still records what it committed
            match summary.store(self.store, &CancelToken::new()) {
                Ok(key) => log::debug!("summary stored at {key}"),
                Err(e) => log::warn!("{source_id}: could not store run summary: {e}"),
            }
        }

        log::info!("=== {source_id}: {status} ===");
        log::info!(
            "Pages: {} committed, comments: {} stored ({} degraded)",
            summary.pages_committed,
            summary.comments_stored,
            summary.degraded
        );
        log::info!(
            "Artifacts: {} written, {} reused",
            summary.artifacts_written,
            summary.artifacts_reused
        );
        log::info!(
            "Quota: {} units, time: {:.1}s",
            summary.quota_used,
            started.elapsed().as_secs_f64()
        );

        RunReport {
            status,
            summary,
            error,
            transitions: states.states,
            checkpoint,
        }
    }
}
