use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::lock;

/// Sharded metadata/body storage rooted at the cache base directory.
///
/// Layout: `<base>/<shard>/<digest>.meta` plus `<base>/<shard>/<digest>.data`,
/// where `<shard>` is the last two hex characters of the digest. A sibling
/// `<digest>.lock` file carries the advisory lock for the pair; it is never
/// removed while entries churn, since deleting a lock file another process
/// may hold would let two writers run unserialized.
#[derive(Debug, Clone)]
pub struct EntryStore {
    base: PathBuf,
    lock_timeout: Duration,
}

impl EntryStore {
    pub fn new(base: PathBuf, lock_timeout: Duration) -> Self {
        Self { base, lock_timeout }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn shard_dir(&self, digest: &str) -> PathBuf {
        let shard = &digest[digest.len().saturating_sub(2)..];
        self.base.join(shard)
    }

    pub fn meta_path(&self, digest: &str) -> PathBuf {
        self.shard_dir(digest).join(format!("{digest}.meta"))
    }

    pub fn data_path(&self, digest: &str) -> PathBuf {
        self.shard_dir(digest).join(format!("{digest}.data"))
    }

    pub fn lock_path(&self, digest: &str) -> PathBuf {
        self.shard_dir(digest).join(format!("{digest}.lock"))
    }

    /// Read the metadata/body pair for a digest. Absent, corrupt, and
    /// lock-contended entries all read as a miss; corruption is never a
    /// fatal error here.
    pub fn get(&self, digest: &str) -> Option<(CacheEntry, Bytes)> {
        let meta_path = self.meta_path(digest);
        if !meta_path.exists() {
            return None;
        }
        let guard = match lock::shared(&self.lock_path(digest), self.lock_timeout) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(digest, "entry lock contended; treating as miss");
                return None;
            }
            Err(err) => {
                warn!(error = %err, digest, "failed to open entry lock");
                return None;
            }
        };
        let raw = fs::read(&meta_path).ok()?;
        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %meta_path.display(),
                    "unreadable cache metadata; treating as miss"
                );
                return None;
            }
        };
        let body = fs::read(self.data_path(digest)).ok()?;
        if !entry.matches_body(&body) {
            warn!(digest, "metadata does not match body; treating as miss");
            return None;
        }
        drop(guard);
        Some((entry, Bytes::from(body)))
    }

    /// Write the body (via a temp file and rename), then the metadata, under
    /// an exclusive entry lock, so visible metadata always references a fully
    /// written body. A write that fails partway deletes the pair rather than
    /// leave metadata pointing at a foreign body. Returns false when the lock
    /// stayed contended and the write was skipped.
    pub fn put(&self, digest: &str, entry: &CacheEntry, body: &[u8]) -> Result<bool> {
        let shard = self.shard_dir(digest);
        fs::create_dir_all(&shard)
            .with_context(|| format!("failed to create cache shard {}", shard.display()))?;
        let guard = match lock::exclusive(&self.lock_path(digest), self.lock_timeout)? {
            Some(guard) => guard,
            None => return Ok(false),
        };
        let tmp_path = shard.join(format!("{digest}.data.tmp"));
        let result = self.write_pair(digest, entry, body, &tmp_path);
        if result.is_err() {
            fs::remove_file(&tmp_path).ok();
            self.delete(digest);
        }
        drop(guard);
        result.map(|()| true)
    }

    fn write_pair(
        &self,
        digest: &str,
        entry: &CacheEntry,
        body: &[u8],
        tmp_path: &Path,
    ) -> Result<()> {
        fs::write(tmp_path, body)
            .with_context(|| format!("failed to write cache body {}", tmp_path.display()))?;
        let data_path = self.data_path(digest);
        fs::rename(tmp_path, &data_path)
            .with_context(|| format!("failed to publish cache body {}", data_path.display()))?;
        let meta_path = self.meta_path(digest);
        let meta = serde_json::to_vec(entry)?;
        fs::write(&meta_path, meta)
            .with_context(|| format!("failed to write cache metadata {}", meta_path.display()))?;
        Ok(())
    }

    /// Remove both files of an entry. A digest with no files is a no-op.
    pub fn delete(&self, digest: &str) {
        fs::remove_file(self.data_path(digest)).ok();
        fs::remove_file(self.meta_path(digest)).ok();
    }
}
