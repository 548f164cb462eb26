//! Run subcommand: fetch, classify and store one video's comments

use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use commentline_core::{CancelToken, ProgressContext, QuotaBudget, QuotaLedger, fmt_num};
use commentline_openai::OpenAiClassifier;
use commentline_pipeline::{Pipeline, PipelineConfig, RunReport};
use commentline_youtube::YouTubeSource;

use crate::config::Config;
use crate::shutdown;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Video ID or watch URL
    pub video: String,

    /// Ignore the checkpoint and start from the first page
    #[arg(long)]
    pub no_resume: bool,

    /// Comments per classifier request
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Concurrent classifier requests
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Classifier requests per second
    #[arg(long)]
    pub rps: Option<f64>,

    /// Stop after the page that reaches this many comments
    #[arg(long)]
    pub max_comments: Option<usize>,

    /// Quota units available today (overrides [youtube].daily_quota)
    #[arg(long)]
    pub quota: Option<u64>,

    /// Also fetch replies to top-level comments
    #[arg(long)]
    pub replies: bool,

    /// Do not store a run summary
    #[arg(long)]
    pub no_summary: bool,
}

impl RunArgs {
    fn apply(&self, mut pc: PipelineConfig) -> PipelineConfig {
        if let Some(n) = self.batch_size {
            pc.batch_size = n;
        }
        if let Some(n) = self.concurrency {
            pc.max_in_flight = n;
            pc.annotate_workers = pc.annotate_workers.max(n);
        }
        if let Some(rps) = self.rps {
            pc.requests_per_second = rps;
        }
        if self.max_comments.is_some() {
            pc.max_comments = self.max_comments;
        }
        if self.no_summary {
            pc.write_summary = false;
        }
        pc
    }
}

pub fn run(args: RunArgs, config: &Config, progress: &ProgressContext) -> Result<ExitCode> {
    let video_id = super::resolve_video(&args.video)?;
    let timeout = config.http.timeout();

    let youtube_key = config
        .youtube
        .api_key
        .as_deref()
        .context("YouTube API key not set (YOUTUBE_API_KEY or [youtube].api_key)")?;
    let openai_key = config
        .classifier
        .api_key
        .as_deref()
        .context("OpenAI API key not set (OPENAI_API_KEY or [classifier].api_key)")?;

    let source = YouTubeSource::new(youtube_key, timeout)?
        .with_base_url(&config.youtube.base_url)
        .with_replies(args.replies || config.youtube.include_replies);
    let classifier = OpenAiClassifier::new(openai_key, &config.classifier.model, timeout)?
        .with_base_url(&config.classifier.base_url);
    let store = super::open_store(config)?;
    let checkpoints = super::open_checkpoints(config)?;

    let state_dir = config.state_dir();
    let today = Utc::now().date_naive();
    let used = QuotaLedger::load(&state_dir, today)?;
    let limit = args.quota.unwrap_or(config.youtube.daily_quota);
    let budget = QuotaBudget::with_used(limit, used);

    let cancel = CancelToken::new();
    shutdown::install(cancel.clone())?;

    log::info!(
        "{video_id}: store {}, model {}, quota {}/{} used today",
        store.describe(),
        config.classifier.model,
        used,
        limit
    );

    let pipeline = Pipeline::new(
        &source,
        &classifier,
        store.as_ref(),
        &checkpoints,
        &budget,
        args.apply(config.pipeline_config()),
    )
    .with_cancel(cancel)
    .with_progress(progress);

    let report = pipeline.run_with_report(&video_id, !args.no_resume);

    // Spent units count even when the run failed
    if let Err(e) = QuotaLedger::save(&state_dir, today, budget.used()) {
        log::warn!("Failed to record quota usage: {e:#}");
    }

    print_report(&report, &budget);

    if shutdown::requested() {
        return Ok(ExitCode::from(shutdown::INTERRUPTED));
    }
    Ok(ExitCode::from(report.status.code()))
}

fn print_report(report: &RunReport, budget: &QuotaBudget) {
    let s = &report.summary;
    let mut table = super::new_table(&["Run", "Value"]);

    table.add_row(vec!["Video", &s.source_id]);
    table.add_row(vec!["Status", report.status.as_str()]);
    table.add_row(vec!["Pages committed", &fmt_num(s.pages_committed as usize)]);
    table.add_row(vec!["Comments stored", &fmt_num(s.comments_stored as usize)]);
    table.add_row(vec![
        "Artifacts",
        &format!("{} written, {} reused", s.artifacts_written, s.artifacts_reused),
    ]);
    let sentiments: Vec<String> = s
        .sentiments
        .iter()
        .filter(|(_, n)| **n > 0)
        .map(|(label, n)| format!("{label} {n}"))
        .collect();
    if !sentiments.is_empty() {
        table.add_row(vec!["Sentiments", &sentiments.join(", ")]);
    }
    if s.degraded > 0 {
        table.add_row(vec!["Degraded", &s.degraded.to_string()]);
    }
    table.add_row(vec![
        "Quota",
        &format!("{} this run, {}/{} today", s.quota_used, budget.used(), budget.limit()),
    ]);
    if let Some(token) = &s.next_page_token {
        table.add_row(vec!["Resumes at", token]);
    }
    if let Some(error) = &s.error {
        table.add_row(vec!["Error", error]);
    }

    eprintln!("\n{table}");
}
