use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Guard for an advisory lock on an entry's lock file. The lock is released
/// when the guard is dropped.
#[derive(Debug)]
pub(super) struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open lock file {}", path.display()))
}

/// Acquire an exclusive lock, retrying until `timeout` elapses. Returns
/// `None` when the lock stayed contended for the whole bound.
pub(super) fn exclusive(path: &Path, timeout: Duration) -> Result<Option<LockGuard>> {
    acquire(path, timeout, |file| fs2::FileExt::try_lock_exclusive(file))
}

/// Shared-lock counterpart of [`exclusive`], used by readers.
pub(super) fn shared(path: &Path, timeout: Duration) -> Result<Option<LockGuard>> {
    acquire(path, timeout, |file| fs2::FileExt::try_lock_shared(file))
}

/// Single non-blocking exclusive attempt, used by the GC sweep. Busy entries
/// are skipped, not waited on.
pub(super) fn try_exclusive(path: &Path) -> Result<Option<LockGuard>> {
    let file = open_lock_file(path)?;
    match fs2::FileExt::try_lock_exclusive(&file) {
        Ok(()) => Ok(Some(LockGuard { file })),
        Err(_) => Ok(None),
    }
}

fn acquire(
    path: &Path,
    timeout: Duration,
    attempt: impl Fn(&File) -> io::Result<()>,
) -> Result<Option<LockGuard>> {
    let file = open_lock_file(path)?;
    let deadline = Instant::now() + timeout;
    loop {
        match attempt(&file) {
            Ok(()) => return Ok(Some(LockGuard { file })),
            Err(_) if Instant::now() < deadline => std::thread::sleep(RETRY_INTERVAL),
            Err(_) => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn exclusive_lock_excludes_second_holder() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("entry.lock");

        let first = exclusive(&path, Duration::from_millis(50))?;
        assert!(first.is_some());

        let second = try_exclusive(&path)?;
        assert!(second.is_none(), "contended lock should not be granted");

        drop(first);
        let third = try_exclusive(&path)?;
        assert!(third.is_some(), "released lock should be grantable");
        Ok(())
    }

    #[test]
    fn shared_locks_coexist_but_block_writers() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("entry.lock");

        let reader_a = shared(&path, Duration::from_millis(50))?;
        let reader_b = shared(&path, Duration::from_millis(50))?;
        assert!(reader_a.is_some());
        assert!(reader_b.is_some());

        let writer = try_exclusive(&path)?;
        assert!(writer.is_none(), "writers must wait for readers");

        drop(reader_a);
        drop(reader_b);
        assert!(try_exclusive(&path)?.is_some());
        Ok(())
    }

    #[test]
    fn bounded_acquire_gives_up() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("entry.lock");

        let held = try_exclusive(&path)?.expect("first lock");
        let started = Instant::now();
        let attempt = exclusive(&path, Duration::from_millis(40))?;
        assert!(attempt.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(held);
        Ok(())
    }
}
