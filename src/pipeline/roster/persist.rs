//! Atomic roster writes with bounded retry on external locks.
//!
//! The file is written to a temp file in the same directory and renamed over
//! the target, so the target is either the old content or the new content.
//! A target held open by a spreadsheet application is reported as
//! `RosterError::FileLocked` after the retry budget is spent.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::RosterError;
use crate::config::RetrySettings;

/// Windows ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION.
const WIN_SHARING_VIOLATION: i32 = 32;
const WIN_LOCK_VIOLATION: i32 = 33;

/// Lock files spreadsheet applications place next to an open document.
pub fn lock_file_candidates(path: &Path) -> Vec<PathBuf> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name().and_then(|n| n.to_str()))
    else {
        return Vec::new();
    };
    let mut candidates = vec![
        // Excel
        dir.join(format!("~${name}")),
        // LibreOffice / OpenOffice
        dir.join(format!(".~lock.{name}#")),
    ];
    // Excel drops the first two characters of long names.
    if name.chars().count() > 2 {
        let short: String = name.chars().skip(2).collect();
        candidates.push(dir.join(format!("~${short}")));
    }
    candidates
}

/// Returns the lock file holding `path`, if any.
pub fn detect_external_lock(path: &Path) -> Option<PathBuf> {
    lock_file_candidates(path).into_iter().find(|p| p.exists())
}

pub(crate) fn is_lock_error(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(WIN_SHARING_VIOLATION) | Some(WIN_LOCK_VIOLATION)
    ) || err.kind() == std::io::ErrorKind::PermissionDenied
}

enum Attempt {
    Written,
    Locked(String),
}

fn try_write(path: &Path, bytes: &[u8]) -> Result<Attempt, RosterError> {
    if let Some(lock) = detect_external_lock(path) {
        return Ok(Attempt::Locked(format!(
            "lock file present: {}",
            lock.display()
        )));
    }

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    match tmp.persist(path) {
        Ok(_) => Ok(Attempt::Written),
        // Dropping the PersistError removes the temp file.
        Err(e) if is_lock_error(&e.error) => Ok(Attempt::Locked(e.error.to_string())),
        Err(e) => Err(RosterError::Io(e.error)),
    }
}

/// Write `bytes` to `path` atomically, retrying while another application
/// holds the file.
pub fn write_atomic(path: &Path, bytes: &[u8], retry: &RetrySettings) -> Result<(), RosterError> {
    let attempts = retry.attempts.max(1);
    let mut last_reason = String::new();

    for attempt in 0..attempts {
        let wait = retry.backoff(attempt);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        match try_write(path, bytes)? {
            Attempt::Written => {
                tracing::debug!(path = %path.display(), attempt, "Roster written");
                return Ok(());
            }
            Attempt::Locked(reason) => {
                tracing::warn!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    of = attempts,
                    reason = %reason,
                    "Roster file locked, will retry"
                );
                last_reason = reason;
            }
        }
    }

    Err(RosterError::FileLocked {
        path: path.to_path_buf(),
        attempts,
        reason: last_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_new_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        std::fs::write(&path, "old").unwrap();

        write_atomic(&path, b"new", &RetrySettings::immediate(1)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn libreoffice_lock_blocks_write_and_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        std::fs::write(&path, "old").unwrap();
        std::fs::write(dir.path().join(".~lock.roster.csv#"), "user").unwrap();

        let err = write_atomic(&path, b"new", &RetrySettings::immediate(3)).unwrap_err();
        match err {
            RosterError::FileLocked { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn excel_lock_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grades.csv");
        std::fs::write(dir.path().join("~$grades.csv"), "").unwrap();
        assert!(detect_external_lock(&path).is_some());
    }

    #[test]
    fn retry_succeeds_once_lock_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.csv");
        std::fs::write(&path, "old").unwrap();
        let lock = dir.path().join(".~lock.roster.csv#");
        std::fs::write(&lock, "").unwrap();

        assert!(write_atomic(&path, b"new", &RetrySettings::immediate(1)).is_err());
        std::fs::remove_file(&lock).unwrap();
        write_atomic(&path, b"new", &RetrySettings::immediate(1)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn permission_denied_counts_as_lock() {
        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(is_lock_error(&err));
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(!is_lock_error(&err));
    }
}
