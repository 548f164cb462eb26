//! Reset subcommand: forget a video's checkpoint
//!
//! Artifacts stay in the store; a fresh run re-fetches every page and
//! finds identical artifacts already present.

use anyhow::Result;
use clap::Args;
use commentline_store::CheckpointStore;

use crate::config::Config;

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Video ID or watch URL
    pub video: String,

    /// Actually remove the checkpoint (default: dry-run)
    #[arg(long)]
    pub confirm: bool,
}

pub fn run(args: ResetArgs, config: &Config) -> Result<()> {
    let video_id = super::resolve_video(&args.video)?;
    let checkpoints = super::open_checkpoints(config)?;

    let Some(cp) = checkpoints.load(&video_id)? else {
        eprintln!("No checkpoint for {video_id}");
        return Ok(());
    };

    if !args.confirm {
        eprintln!(
            "Would remove checkpoint for {video_id} ({} pages, {} comments committed)",
            cp.pages_committed, cp.comments_committed
        );
        eprintln!("Run with --confirm to remove");
        return Ok(());
    }

    if checkpoints.reset(&video_id)? {
        log::info!("{video_id}: checkpoint removed");
        eprintln!("Removed checkpoint for {video_id}");
    }
    Ok(())
}
