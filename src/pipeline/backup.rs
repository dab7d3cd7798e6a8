//! BackupManager: moves stale working folders and output archives aside.
//!
//! Nothing is deleted: every item is renamed into
//! `<archive_root>/<name>-<YYYYMMDD-HHMMSS>` (with a numeric suffix on
//! collision). Renames across devices fall back to copy-then-remove.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::config::RetrySettings;
use crate::pipeline::roster::persist::is_lock_error;

/// `EXDEV` on Unix, `ERROR_NOT_SAME_DEVICE` on Windows.
const CROSS_DEVICE: [i32; 2] = [18, 17];

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{} is in use ({reason}); close it and retry", path.display())]
    Locked { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedItem {
    pub original: PathBuf,
    pub archived_to: PathBuf,
    pub files: u32,
    pub bytes: u64,
}

/// Count files and total bytes under `path` (a file counts as one).
pub fn count_contents(path: &Path) -> (u32, u64) {
    if path.is_file() {
        return (1, path.metadata().map(|m| m.len()).unwrap_or(0));
    }
    let mut count = 0u32;
    let mut bytes = 0u64;
    count_recursive(path, &mut count, &mut bytes);
    (count, bytes)
}

fn count_recursive(path: &Path, count: &mut u32, bytes: &mut u64) {
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let p = entry.path();
            if p.is_dir() {
                count_recursive(&p, count, bytes);
            } else if let Ok(meta) = entry.metadata() {
                *count += 1;
                *bytes += meta.len();
            }
        }
    }
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_file() {
        std::fs::copy(from, to)?;
        return Ok(());
    }
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
    }
    Ok(())
}

pub struct BackupManager {
    archive_root: PathBuf,
    retry: RetrySettings,
}

impl BackupManager {
    pub fn new(archive_root: impl Into<PathBuf>, retry: RetrySettings) -> Self {
        Self {
            archive_root: archive_root.into(),
            retry,
        }
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    fn destination_for(&self, path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "item".to_string());
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let base = self.archive_root.join(format!("{name}-{stamp}"));
        if !base.exists() {
            return base;
        }
        (2..)
            .map(|n| self.archive_root.join(format!("{name}-{stamp}-{n}")))
            .find(|p| !p.exists())
            .unwrap_or(base)
    }

    /// Move `path` into the archive. `Ok(None)` when there is nothing to move.
    pub fn archive(&self, path: &Path) -> Result<Option<ArchivedItem>, BackupError> {
        if !path.exists() {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.archive_root)?;
        let (files, bytes) = count_contents(path);
        let dest = self.destination_for(path);

        let attempts = self.retry.attempts.max(1);
        let mut last_reason = String::new();
        for attempt in 0..attempts {
            let wait = self.retry.backoff(attempt);
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            match std::fs::rename(path, &dest) {
                Ok(()) => {
                    tracing::info!(
                        from = %path.display(),
                        to = %dest.display(),
                        files,
                        bytes,
                        "Archived"
                    );
                    return Ok(Some(ArchivedItem {
                        original: path.to_path_buf(),
                        archived_to: dest,
                        files,
                        bytes,
                    }));
                }
                Err(e) if e.raw_os_error().is_some_and(|c| CROSS_DEVICE.contains(&c)) => {
                    copy_recursive(path, &dest)?;
                    if path.is_dir() {
                        std::fs::remove_dir_all(path)?;
                    } else {
                        std::fs::remove_file(path)?;
                    }
                    return Ok(Some(ArchivedItem {
                        original: path.to_path_buf(),
                        archived_to: dest,
                        files,
                        bytes,
                    }));
                }
                Err(e) if is_lock_error(&e) => {
                    tracing::warn!(
                        path = %path.display(),
                        attempt = attempt + 1,
                        of = attempts,
                        error = %e,
                        "Archive target locked, will retry"
                    );
                    last_reason = e.to_string();
                }
                Err(e) => return Err(BackupError::Io(e)),
            }
        }
        Err(BackupError::Locked {
            path: path.to_path_buf(),
            reason: last_reason,
        })
    }

    /// Archive several items in order; stops at the first failure.
    pub fn archive_all(&self, paths: &[PathBuf]) -> Result<Vec<ArchivedItem>, BackupError> {
        let mut moved = Vec::new();
        for path in paths {
            if let Some(item) = self.archive(path)? {
                moved.push(item);
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> BackupManager {
        BackupManager::new(dir.join("archive"), RetrySettings::immediate(2))
    }

    #[test]
    fn archive_moves_folder_with_contents() {
        let dir = tempfile::tempdir().unwrap();
        let processing = dir.path().join("processing");
        std::fs::create_dir_all(processing.join("sub")).unwrap();
        std::fs::write(processing.join("a.pdf"), b"1234").unwrap();
        std::fs::write(processing.join("sub/b.pdf"), b"12").unwrap();

        let item = manager(dir.path()).archive(&processing).unwrap().unwrap();
        assert!(!processing.exists());
        assert!(item.archived_to.join("sub/b.pdf").is_file());
        assert_eq!(item.files, 2);
        assert_eq!(item.bytes, 6);
        assert!(item
            .archived_to
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("processing-"));
    }

    #[test]
    fn missing_path_is_nothing_to_do() {
        let dir = tempfile::tempdir().unwrap();
        assert!(manager(dir.path())
            .archive(&dir.path().join("absent"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn same_second_collisions_get_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let zip = dir.path().join("Lab 1 Graded.zip");

        std::fs::write(&zip, b"one").unwrap();
        let first = mgr.archive(&zip).unwrap().unwrap();
        std::fs::write(&zip, b"two").unwrap();
        let second = mgr.archive(&zip).unwrap().unwrap();

        assert_ne!(first.archived_to, second.archived_to);
        assert_eq!(std::fs::read(&first.archived_to).unwrap(), b"one");
        assert_eq!(std::fs::read(&second.archived_to).unwrap(), b"two");
    }

    #[test]
    fn archive_all_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.zip");
        std::fs::write(&a, b"x").unwrap();
        let moved = manager(dir.path())
            .archive_all(&[a.clone(), dir.path().join("b.zip")])
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(!a.exists());
    }
}
