//! CLI subcommands

pub mod reset;
pub mod run;
pub mod status;
pub mod verify;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use commentline_store::{AzureBlobStore, FsCheckpointStore, FsObjectStore, ObjectStore};

use crate::config::{Backend, Config};

/// Accept a bare video ID or any of the usual watch URLs.
pub fn resolve_video(input: &str) -> Result<String> {
    match commentline_youtube::extract_video_id(input) {
        Some(id) => Ok(id),
        None => bail!("not a video ID or URL: {input}"),
    }
}

/// Open the configured artifact store.
pub fn open_store(config: &Config) -> Result<Box<dyn ObjectStore>> {
    match config.store.backend {
        Backend::Fs => {
            let store = FsObjectStore::new(&config.store.dir)?;
            let removed = store.cleanup_tmp_files()?;
            if removed > 0 {
                log::info!("Removed {removed} leftover temp files");
            }
            Ok(Box::new(store))
        }
        Backend::Azure => {
            let conn = config.store.connection_string.as_deref().context(
                "Azure backend needs AZURE_STORAGE_CONNECTION_STRING or [store].connection_string",
            )?;
            let store = AzureBlobStore::new(conn, &config.store.container, config.http.timeout())?;
            Ok(Box::new(store))
        }
    }
}

pub fn open_checkpoints(config: &Config) -> Result<FsCheckpointStore> {
    let dir = config.state_dir().join("checkpoints");
    FsCheckpointStore::new(&dir)
}

/// Two-column table with the shared look
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(headers.iter().map(|h| Cell::new(h).fg(Color::Cyan)));
    table
}

fn secret(value: &Option<String>) -> &'static str {
    if value.is_some() { "configured" } else { "not set" }
}

/// `commentline config`
pub fn show_config(config: &Config) {
    let mut table = new_table(&["Setting", "Value"]);
    let p = &config.pipeline;

    table.add_row(vec!["YouTube API key", secret(&config.youtube.api_key)]);
    table.add_row(vec!["YouTube base URL", &config.youtube.base_url]);
    table.add_row(vec![
        "Include replies",
        &config.youtube.include_replies.to_string(),
    ]);
    table.add_row(vec!["Daily quota", &config.youtube.daily_quota.to_string()]);
    table.add_row(vec!["OpenAI API key", secret(&config.classifier.api_key)]);
    table.add_row(vec!["OpenAI base URL", &config.classifier.base_url]);
    table.add_row(vec!["Model", &config.classifier.model]);
    match config.store.backend {
        Backend::Fs => {
            table.add_row(vec!["Store", &format!("fs:{}", config.store.dir.display())]);
        }
        Backend::Azure => {
            table.add_row(vec!["Store", &format!("azure:{}", config.store.container)]);
            table.add_row(vec![
                "Connection string",
                secret(&config.store.connection_string),
            ]);
        }
    }
    table.add_row(vec!["State directory", &config.state_dir().display().to_string()]);
    table.add_row(vec!["Batch size", &p.batch_size.to_string()]);
    table.add_row(vec![
        "Classifier calls",
        &format!("{} in flight, {}/s", p.max_in_flight, p.requests_per_second),
    ]);
    table.add_row(vec!["Pages in flight", &p.max_pages_in_flight.to_string()]);
    table.add_row(vec![
        "Max comments",
        &p.max_comments.map_or("unlimited".to_string(), |n| n.to_string()),
    ]);
    table.add_row(vec!["Timeout", &format!("{}s", config.http.timeout)]);
    table.add_row(vec!["Max retries", &config.http.max_retries.to_string()]);

    eprintln!("\n{table}");
}
