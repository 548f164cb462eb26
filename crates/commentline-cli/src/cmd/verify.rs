//! Verify subcommand: re-hash stored artifacts of one video
//!
//! Checks that every artifact's content matches the hash in its key, that
//! it decodes, and that no comment ID is stored in more than one artifact.

use std::process::ExitCode;

use anyhow::Result;
use clap::Args;
use commentline_core::{AnnotatedComment, CancelToken, fmt_num};
use commentline_pipeline::{artifact_prefix, parse_artifact_key};
use commentline_store::{ObjectStore, content_hash};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Video ID or watch URL
    pub video: String,
}

#[derive(Debug, Default)]
struct Report {
    artifacts: usize,
    comments: usize,
    bad: Vec<(String, String)>,
    /// Pages with more than one artifact
    replayed_pages: Vec<String>,
    duplicate_ids: Vec<String>,
}

impl Report {
    fn is_clean(&self) -> bool {
        self.bad.is_empty() && self.duplicate_ids.is_empty()
    }
}

enum Checked {
    Ok {
        page: String,
        ids: Vec<String>,
    },
    Bad(String),
}

fn check_artifact(
    store: &dyn ObjectStore,
    source_id: &str,
    key: &str,
    cancel: &CancelToken,
) -> Checked {
    let Some((page, expected)) = parse_artifact_key(source_id, key) else {
        return Checked::Bad("unexpected key layout".into());
    };
    let bytes = match store.get(key, cancel) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return Checked::Bad("listed but missing".into()),
        Err(e) => return Checked::Bad(e.to_string()),
    };
    let actual = content_hash(&bytes);
    if actual != expected {
        return Checked::Bad(format!("hash mismatch ({actual})"));
    }
    match serde_json::from_slice::<Vec<AnnotatedComment>>(&bytes) {
        Ok(comments) => Checked::Ok {
            page: page.to_string(),
            ids: comments.iter().map(|c| c.id().to_string()).collect(),
        },
        Err(e) => Checked::Bad(format!("decode: {e}")),
    }
}

fn verify(store: &dyn ObjectStore, source_id: &str, cancel: &CancelToken) -> Result<Report> {
    let keys = store.list(&artifact_prefix(source_id), cancel)?;

    let checked: Vec<(String, Checked)> = keys
        .par_iter()
        .map(|key| (key.clone(), check_artifact(store, source_id, key, cancel)))
        .collect();

    let mut report = Report {
        artifacts: keys.len(),
        ..Default::default()
    };
    let mut per_page: FxHashMap<String, usize> = FxHashMap::default();
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut dups: FxHashSet<String> = FxHashSet::default();

    for (key, result) in checked {
        match result {
            Checked::Ok { page, ids } => {
                *per_page.entry(page).or_default() += 1;
                report.comments += ids.len();
                for id in ids {
                    if !seen.insert(id.clone()) {
                        dups.insert(id);
                    }
                }
            }
            Checked::Bad(reason) => report.bad.push((key, reason)),
        }
    }

    report.replayed_pages = per_page
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(page, _)| page)
        .collect();
    report.replayed_pages.sort();
    report.duplicate_ids = dups.into_iter().collect();
    report.duplicate_ids.sort();
    Ok(report)
}

pub fn run(args: VerifyArgs, config: &Config) -> Result<ExitCode> {
    let video_id = super::resolve_video(&args.video)?;
    let store = super::open_store(config)?;
    let report = verify(store.as_ref(), &video_id, &CancelToken::new())?;

    let mut table = super::new_table(&["Verify", "Value"]);
    table.add_row(vec!["Video", video_id.as_str()]);
    table.add_row(vec!["Store", &store.describe()]);
    table.add_row(vec!["Artifacts", &fmt_num(report.artifacts)]);
    table.add_row(vec!["Comments", &fmt_num(report.comments)]);
    table.add_row(vec!["Invalid artifacts", &report.bad.len().to_string()]);
    table.add_row(vec!["Duplicate comment IDs", &report.duplicate_ids.len().to_string()]);
    if !report.replayed_pages.is_empty() {
        table.add_row(vec!["Pages with several artifacts", &report.replayed_pages.join(", ")]);
    }
    eprintln!("\n{table}");

    for (key, reason) in &report.bad {
        log::error!("{key}: {reason}");
    }
    for id in report.duplicate_ids.iter().take(20) {
        log::warn!("{video_id}: comment {id} stored more than once");
    }

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use commentline_core::{RawComment, Sentiment};
    use commentline_pipeline::{artifact_key, encode_payload};
    use commentline_store::MemoryObjectStore;

    fn comment(id: &str) -> AnnotatedComment {
        AnnotatedComment {
            comment: RawComment {
                id: id.into(),
                author: "a".into(),
                text: "t".into(),
                published_at: "2024-05-01T10:00:00Z".parse().unwrap(),
                parent_id: None,
                like_count: 0,
            },
            sentiment: Sentiment::Neutral,
            confidence: 0.5,
            model_version: "m".into(),
            diagnostic: None,
        }
    }

    fn put(store: &MemoryObjectStore, page: Option<&str>, ids: &[&str]) {
        let comments: Vec<_> = ids.iter().map(|id| comment(id)).collect();
        let payload = encode_payload(&comments).unwrap();
        let key = artifact_key("vid", page, &payload);
        store.put_if_absent(&key, &payload, &CancelToken::new()).unwrap();
    }

    #[test]
    fn clean_store_passes() {
        let store = MemoryObjectStore::new();
        put(&store, None, &["a", "b"]);
        put(&store, Some("t1"), &["c"]);

        let report = verify(&store, "vid", &CancelToken::new()).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.artifacts, 2);
        assert_eq!(report.comments, 3);
        assert!(report.replayed_pages.is_empty());
    }

    #[test]
    fn duplicates_and_replays_are_reported() {
        let store = MemoryObjectStore::new();
        put(&store, None, &["a", "b"]);
        put(&store, None, &["a"]);

        let report = verify(&store, "vid", &CancelToken::new()).unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.duplicate_ids, vec!["a".to_string()]);
        assert_eq!(report.replayed_pages.len(), 1);
    }

    #[test]
    fn tampered_artifact_fails_hash_check() {
        let store = MemoryObjectStore::new();
        let key = format!("comments/vid/first/{}.json", content_hash(b"[]"));
        store.put_if_absent(&key, b"[ ]", &CancelToken::new()).unwrap();

        let report = verify(&store, "vid", &CancelToken::new()).unwrap();
        assert_eq!(report.bad.len(), 1);
        assert!(report.bad[0].1.contains("hash mismatch"));
    }
}
