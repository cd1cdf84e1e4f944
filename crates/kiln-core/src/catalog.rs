//! The file catalog: every source or produced file the engine knows about.

use crate::job::JobId;
use crate::pattern::generic_string;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// State flags shared by files and jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityFlags {
    pub exists: bool,
    pub modified: bool,
    pub used: bool,
    pub failed: bool,
}

/// A file known to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub path: PathBuf,
    /// `/`-separated form of `path`; rule patterns are searched in it.
    pub key: String,
    /// Modification time in nanoseconds since the Unix epoch.
    pub write_time: u64,
    /// Pass that produced the file (0 = source file).
    pub pass: u32,
    pub flags: EntityFlags,
    /// A newer file that supersedes this one.
    pub alias: Option<PathBuf>,
    /// The job that produced this file.
    pub source: Option<JobId>,
}

impl File {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            key: generic_string(path),
            write_time: 0,
            pass: 0,
            flags: EntityFlags::default(),
            alias: None,
            source: None,
        }
    }
}

/// Read a file's modification time in nanoseconds since the Unix epoch.
pub fn write_time(path: &Path) -> std::io::Result<u64> {
    let modified = std::fs::metadata(path)?.modified()?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(std::io::Error::other)?;
    Ok(u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX))
}

/// Thread-safe catalog of files keyed by path.
///
/// Actions register outputs from worker threads, so all access goes through
/// an internal reader/writer lock. Lookups hand out clones.
#[derive(Debug, Default)]
pub struct FileCatalog {
    files: RwLock<IndexMap<PathBuf, File>>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) a file found on disk.
    ///
    /// Returns `None` unless `path` exists and is a regular file. The stored
    /// pass only ever grows.
    pub fn add_file(&self, path: &Path, pass: u32) -> Option<File> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => {}
            _ => return None,
        }
        let time = match write_time(path) {
            Ok(time) => time,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "cannot read modification time");
                return None;
            }
        };

        let mut files = self.files.write();
        let file = files
            .entry(path.to_path_buf())
            .or_insert_with(|| File::new(path));
        file.write_time = time;
        file.pass = file.pass.max(pass);
        file.flags.exists = true;
        file.flags.modified = true;
        Some(file.clone())
    }

    /// Look up a file without side effects.
    pub fn get_file(&self, path: &Path) -> Option<File> {
        self.files.read().get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    /// Apply `f` to a file record. Returns false if the file is unknown.
    pub fn update(&self, path: &Path, f: impl FnOnce(&mut File)) -> bool {
        match self.files.write().get_mut(path) {
            Some(file) => {
                f(file);
                true
            }
            None => false,
        }
    }

    pub fn mark_used(&self, path: &Path) {
        self.update(path, |file| file.flags.used = true);
    }

    /// Record that `from` is superseded by `to`.
    ///
    /// Refused (returns false) when either file is unknown or when the link
    /// would close an alias cycle.
    pub fn set_alias(&self, from: &Path, to: &Path) -> bool {
        let mut files = self.files.write();
        if !files.contains_key(from) || !files.contains_key(to) || from == to {
            return false;
        }

        let mut seen = HashSet::new();
        let mut cursor = Some(to.to_path_buf());
        while let Some(current) = cursor {
            if current == from {
                tracing::warn!(
                    from = %from.display(),
                    to = %to.display(),
                    "refusing alias that would form a cycle"
                );
                return false;
            }
            if !seen.insert(current.clone()) {
                break;
            }
            cursor = files.get(&current).and_then(|f| f.alias.clone());
        }

        if let Some(file) = files.get_mut(from) {
            file.alias = Some(to.to_path_buf());
        }
        true
    }

    /// Follow the alias chain of `path` while the next file was produced
    /// before `current_pass`.
    ///
    /// Returns `None` for unknown files. Terminates on cycles.
    pub fn resolve_alias(&self, path: &Path, current_pass: u32) -> Option<PathBuf> {
        let files = self.files.read();
        let mut result = files.get(path)?;
        let mut seen = HashSet::new();
        seen.insert(result.path.as_path());
        while let Some(next) = result.alias.as_deref().and_then(|alias| files.get(alias)) {
            if next.pass >= current_pass || !seen.insert(next.path.as_path()) {
                break;
            }
            result = next;
        }
        Some(result.path.clone())
    }

    /// Forget per-run state before a new update.
    pub(crate) fn reset_run_flags(&self) {
        for file in self.files.write().values_mut() {
            file.flags.used = false;
            file.flags.modified = false;
        }
    }

    /// Remove every file that was not used in the last run.
    pub fn collect_garbage(&self) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        self.files.write().retain(|path, file| {
            if file.flags.used {
                true
            } else {
                removed.push(path.clone());
                false
            }
        });
        removed
    }

    /// Clone every record, in insertion order.
    pub fn snapshot(&self) -> Vec<File> {
        self.files.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }
}
