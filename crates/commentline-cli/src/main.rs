//! commentline - annotate video comments with sentiment and store them durably
//!
//! Pages through a video's comments, classifies them in batches and writes
//! each page as a content-addressed artifact. Runs are resumable.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

mod cmd;
mod config;
mod shutdown;

use config::Config;

#[derive(Parser)]
#[command(name = "commentline")]
#[command(about = "Annotate video comments with sentiment and store them durably")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    /// Config file path (default: ./commentline.toml or ~/.config/commentline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Maximum retry attempts for transient failures
    #[arg(long, global = true)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch, classify and store the comments of one video
    Run(cmd::run::RunArgs),
    /// Show the checkpoint of a video and today's quota usage
    Status(cmd::status::StatusArgs),
    /// Discard the checkpoint of a video
    Reset(cmd::reset::ResetArgs),
    /// Re-hash stored artifacts and look for duplicate comments
    Verify(cmd::verify::VerifyArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(commentline_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug; stage lines show activity
    //   non-TTY: info unless --debug or --quiet
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = cli.quiet || (is_tty && !cli.debug);
    commentline_core::init_logging(quiet, cli.debug, multi);

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    // CLI overrides config file
    if let Some(timeout) = cli.timeout {
        config.http.timeout = timeout;
    }
    if let Some(max_retries) = cli.max_retries {
        config.http.max_retries = max_retries;
    }

    let result = match cli.command {
        Command::Run(args) => cmd::run::run(args, &config, &progress),
        Command::Status(args) => cmd::status::run(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Reset(args) => cmd::reset::run(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Verify(args) => cmd::verify::run(args, &config),
        Command::Config => {
            cmd::show_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
