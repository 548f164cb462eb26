//! Status subcommand: checkpoint and quota for one video

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use commentline_core::{QuotaLedger, fmt_num};
use commentline_store::{CheckpointStore, page_key};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Video ID or watch URL
    pub video: String,
}

pub fn run(args: StatusArgs, config: &Config) -> Result<()> {
    let video_id = super::resolve_video(&args.video)?;
    let checkpoints = super::open_checkpoints(config)?;
    let used = QuotaLedger::load(&config.state_dir(), Utc::now().date_naive())?;

    let mut table = super::new_table(&["Status", "Value"]);
    table.add_row(vec!["Video", video_id.as_str()]);

    match checkpoints.load(&video_id)? {
        None => {
            table.add_row(vec!["Checkpoint", "none (next run starts at the first page)"]);
        }
        Some(cp) => {
            let state = if cp.completed { "completed" } else { "in progress" };
            table.add_row(vec!["Checkpoint", state]);
            table.add_row(vec!["Pages committed", &fmt_num(cp.pages_committed as usize)]);
            table.add_row(vec![
                "Comments committed",
                &fmt_num(cp.comments_committed as usize),
            ]);
            table.add_row(vec![
                "Last page",
                &page_key(cp.last_committed_page_token.as_deref()),
            ]);
            table.add_row(vec![
                "Next page token",
                cp.resume_token().unwrap_or("-"),
            ]);
            table.add_row(vec![
                "Updated",
                &cp.updated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            ]);
        }
    }
    table.add_row(vec![
        "Quota today",
        &format!("{} / {}", used, config.youtube.daily_quota),
    ]);

    eprintln!("\n{table}");
    Ok(())
}
