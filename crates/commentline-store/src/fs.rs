//! Local filesystem object store with atomic write-once puts

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use commentline_core::{CancelToken, ServiceError};

use crate::object_store::{ObjectStore, PutOutcome, validate_key};

/// Objects as plain files under `root`.
///
/// A put writes `{key}.{unique}.tmp`, fsyncs it, hard-links it to the final
/// path and fsyncs the parent directory. The link fails if the key already
/// exists, which makes the put-if-absent atomic even between processes.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    tmp_seq: AtomicU64,
}

impl FsObjectStore {
    pub fn new(root: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create store dir: {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ServiceError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn tmp_path(&self, path: &Path) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{}-{seq}.tmp", std::process::id()));
        path.with_file_name(name)
    }

    /// Remove stale .tmp files left by interrupted puts
    pub fn cleanup_tmp_files(&self) -> anyhow::Result<usize> {
        let pattern = format!("{}/**/*.tmp", glob::Pattern::escape(&self.root.to_string_lossy()));
        let mut removed = 0;
        for path in glob::glob(&pattern)?.filter_map(Result::ok) {
            if path.is_file() {
                log::warn!("Removing stale tmp file: {}", path.display());
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn io_error(context: &str, e: io::Error) -> ServiceError {
    let message = format!("{context}: {e}");
    match e.kind() {
        io::ErrorKind::PermissionDenied => ServiceError::Auth(message),
        _ => ServiceError::Transient(message),
    }
}

fn write_synced(path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(payload)?;
    file.sync_all()
}

/// Persist a new directory entry
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

impl ObjectStore for FsObjectStore {
    fn describe(&self) -> String {
        format!("fs:{}", self.root.display())
    }

    fn put_if_absent(
        &self,
        key: &str,
        payload: &[u8],
        _cancel: &CancelToken,
    ) -> Result<PutOutcome, ServiceError> {
        let path = self.path_for(key)?;
        if path.exists() {
            return Ok(PutOutcome { written: false });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_error("create dir", e))?;
        }

        let tmp = self.tmp_path(&path);
        if let Err(e) = write_synced(&tmp, payload) {
            let _ = fs::remove_file(&tmp);
            return Err(io_error("write tmp", e));
        }
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    sync_dir(parent).map_err(|e| io_error("fsync dir", e))?;
                }
                Ok(PutOutcome { written: true })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(PutOutcome { written: false }),
            Err(e) => Err(io_error("link", e)),
        }
    }

    fn exists(&self, key: &str, _cancel: &CancelToken) -> Result<bool, ServiceError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn get(&self, key: &str, _cancel: &CancelToken) -> Result<Option<Vec<u8>>, ServiceError> {
        match fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", e)),
        }
    }

    fn list(&self, prefix: &str, _cancel: &CancelToken) -> Result<Vec<String>, ServiceError> {
        // Only walk the deepest directory named by the prefix
        let dir = match prefix.rfind('/') {
            Some(i) => self.root.join(&prefix[..i]),
            None => self.root.clone(),
        };
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
        let paths = glob::glob(&pattern)
            .map_err(|e| ServiceError::InvalidResponse(format!("invalid glob pattern: {e}")))?;

        let mut keys: Vec<String> = paths
            .filter_map(Result::ok)
            .filter(|p| p.is_file() && p.extension().is_none_or(|ext| ext != "tmp"))
            .filter_map(|p| {
                let rel = p.strip_prefix(&self.root).ok()?;
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                key.starts_with(prefix).then_some(key)
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}
