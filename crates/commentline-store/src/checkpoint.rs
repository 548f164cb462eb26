//! Durable per-source cursor over committed pages

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last page whose artifact was confirmed stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    /// Token of the committed page (`None` = first page)
    pub last_committed_page_token: Option<String>,
    /// Where a resumed run starts
    pub next_page_token: Option<String>,
    /// The committed page was the last one
    pub completed: bool,
    /// Comment IDs of the committed page only
    pub processed_comment_ids: Vec<String>,
    pub pages_committed: u64,
    pub comments_committed: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn first(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            last_committed_page_token: None,
            next_page_token: None,
            completed: false,
            processed_comment_ids: Vec::new(),
            pages_committed: 0,
            comments_committed: 0,
            updated_at: Utc::now(),
        }
    }

    /// Checkpoint after committing one more page on top of `prev`
    pub fn advanced(
        prev: Option<&Checkpoint>,
        source_id: &str,
        page_token: Option<&str>,
        next_page_token: Option<&str>,
        committed_ids: &[String],
    ) -> Self {
        let base = prev.cloned().unwrap_or_else(|| Self::first(source_id));
        Self {
            source_id: source_id.to_string(),
            last_committed_page_token: page_token.map(str::to_string),
            next_page_token: next_page_token.map(str::to_string),
            completed: next_page_token.is_none(),
            processed_comment_ids: committed_ids.to_vec(),
            pages_committed: base.pages_committed + 1,
            comments_committed: base.comments_committed + committed_ids.len() as u64,
            updated_at: Utc::now(),
        }
    }

    /// Page a resumed run should fetch first, `None` when there is nothing left
    pub fn resume_token(&self) -> Option<&str> {
        if self.completed {
            None
        } else {
            self.next_page_token.as_deref()
        }
    }
}

/// Persistence for checkpoints.
///
/// Only the orchestrator writes, so `advance` is a plain load-modify-save.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, source_id: &str) -> Result<Option<Checkpoint>>;

    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Forget all progress for `source_id`; returns whether anything was removed
    fn reset(&self, source_id: &str) -> Result<bool>;

    /// Record `page_token` as committed. Call only after the page's artifact
    /// is confirmed durable.
    fn advance(
        &self,
        source_id: &str,
        page_token: Option<&str>,
        next_page_token: Option<&str>,
        committed_ids: &[String],
    ) -> Result<Checkpoint> {
        let prev = self.load(source_id)?;
        let next = Checkpoint::advanced(
            prev.as_ref(),
            source_id,
            page_token,
            next_page_token,
            committed_ids,
        );
        self.save(&next)?;
        Ok(next)
    }
}

/// Source IDs become file names, so only a conservative charset is allowed
pub fn validate_source_id(source_id: &str) -> Result<()> {
    if source_id.is_empty()
        || source_id.len() > 128
        || !source_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid source id: {source_id:?}");
    }
    Ok(())
}

/// One JSON file per source under the state directory.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    dir: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state dir: {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, source_id: &str) -> Result<PathBuf> {
        validate_source_id(source_id)?;
        Ok(self.dir.join(format!("{source_id}.json")))
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(source_id)?;
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;
        if checkpoint.source_id != source_id {
            bail!(
                "checkpoint {} belongs to {:?}",
                path.display(),
                checkpoint.source_id
            );
        }
        Ok(Some(checkpoint))
    }

    /// tmp → fsync → rename, so a crash leaves either the old or the new file
    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path_for(&checkpoint.source_id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint).context("failed to serialize checkpoint")?;

        let mut file =
            File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(&json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp.display()))?;
        drop(file);

        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {} → {}", tmp.display(), path.display()))?;
        // Persist the rename itself
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        log::debug!(
            "checkpoint {}: {} pages, next={:?}",
            checkpoint.source_id,
            checkpoint.pages_committed,
            checkpoint.next_page_token
        );
        Ok(())
    }

    fn reset(&self, source_id: &str) -> Result<bool> {
        let path = self.path_for(source_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

/// Checkpoints held in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: Mutex<HashMap<String, Checkpoint>>,
    saves: Mutex<Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every checkpoint saved so far, oldest first
    pub fn history(&self) -> Vec<Checkpoint> {
        self.saves.lock().unwrap().clone()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, source_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.entries.lock().unwrap().get(source_id).cloned())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(checkpoint.source_id.clone(), checkpoint.clone());
        self.saves.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }

    fn reset(&self, source_id: &str) -> Result<bool> {
        Ok(self.entries.lock().unwrap().remove(source_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fs_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        assert!(store.load("abc").unwrap().is_none());
    }

    #[test]
    fn fs_advance_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();

        let cp = store.advance("vid", None, Some("t2"), &ids(&["a", "b"])).unwrap();
        assert_eq!(cp.pages_committed, 1);
        assert_eq!(cp.resume_token(), Some("t2"));

        let cp = store.advance("vid", Some("t2"), None, &ids(&["c"])).unwrap();
        assert!(cp.completed);
        assert_eq!(cp.resume_token(), None);
        assert_eq!(cp.comments_committed, 3);
        assert_eq!(cp.processed_comment_ids, ids(&["c"]));

        let loaded = store.load("vid").unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(loaded.last_committed_page_token.as_deref(), Some("t2"));
    }

    #[test]
    fn fs_save_leaves_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        store.advance("vid", None, Some("t2"), &[]).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["vid.json"]);
    }

    #[test]
    fn fs_reset() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        store.advance("vid", None, Some("t2"), &[]).unwrap();
        assert!(store.reset("vid").unwrap());
        assert!(!store.reset("vid").unwrap());
        assert!(store.load("vid").unwrap().is_none());
    }

    #[test]
    fn fs_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        assert!(store.load("../x").is_err());
        assert!(store.load("").is_err());
        assert!(store.load("dQw4w9WgXcQ").is_ok());
    }

    #[test]
    fn fs_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("vid.json"), b"{not json").unwrap();
        assert!(store.load("vid").is_err());
    }

    #[test]
    fn memory_history_tracks_saves() {
        let store = MemoryCheckpointStore::new();
        store.advance("v", None, Some("t2"), &ids(&["a"])).unwrap();
        store.advance("v", Some("t2"), None, &ids(&["b"])).unwrap();
        let history = store.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].next_page_token.as_deref(), Some("t2"));
        assert!(history[1].completed);
    }
}
