//! Exclusive lock on an output target.
//!
//! `<target>.lock` carries an OS advisory lock held for the guard's lifetime.
//! The kernel drops the lock when the process exits, however it exits, so a
//! leftover file from a killed run never blocks the next one. The file holds
//! the owner's pid for the error message and is left in place on release.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{path} is locked by another running fetch (pid {holder})")]
    Held { path: PathBuf, holder: String },

    #[error("cannot lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct OutputLock {
    path: PathBuf,
    // Lock lives as long as this handle.
    _file: File,
}

impl OutputLock {
    /// Lock `target` through `<target>.lock`. Never blocks.
    pub fn acquire(target: &Path) -> Result<Self, LockError> {
        let path = lock_path(target);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                return Err(LockError::Held {
                    path,
                    holder: if holder.is_empty() { "unknown".into() } else { holder.to_string() },
                });
            }
            Err(TryLockError::Error(source)) => return Err(io_err(source)),
        }

        // Replace whatever pid a previous owner left behind.
        file.set_len(0).map_err(io_err)?;
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("btc.csv");

        let first = OutputLock::acquire(&target).unwrap();
        assert!(first.path().exists());
        let pid = std::process::id().to_string();
        match OutputLock::acquire(&target) {
            Err(LockError::Held { holder, .. }) => assert_eq!(holder, pid),
            other => panic!("expected Held, got {other:?}"),
        }

        drop(first);
        assert!(OutputLock::acquire(&target).is_ok());
    }

    #[test]
    fn leftover_file_from_a_dead_run_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("btc.csv");
        // A killed run leaves its file behind with nobody holding the lock.
        fs::write(lock_path(&target), "4943\n").unwrap();

        let lock = OutputLock::acquire(&target).unwrap();
        let recorded = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());
    }

    #[test]
    fn leaked_guard_still_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("btc.json");

        // No destructor runs, so the handle stays open like a live owner.
        std::mem::forget(OutputLock::acquire(&target).unwrap());
        assert!(matches!(OutputLock::acquire(&target), Err(LockError::Held { .. })));
    }
}
