use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::{lock, unix_now, PageCache};
use crate::metrics;

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub scanned: usize,
    pub deleted: usize,
}

/// Point-in-time shape of the on-disk tree, for operator tooling.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub shards: usize,
    pub entries: usize,
}

impl PageCache {
    /// Sweep every shard for expired entries in a single pass.
    pub fn sweep(&self) -> Result<SweepStats> {
        self.sweep_at(unix_now(), usize::MAX)
    }

    /// Sweep at most `batch_size` entries, resuming where the previous
    /// batch stopped. Bounding the batch keeps a single pass from
    /// monopolizing disk I/O on large trees; the cursor guarantees repeated
    /// batches eventually reach every shard.
    pub fn sweep_batch(&self, batch_size: usize) -> Result<SweepStats> {
        self.sweep_at(unix_now(), batch_size)
    }

    /// Clock-injected sweep. Shards are visited in rotation starting at the
    /// resume cursor, each at most once per pass. Entries whose lock is held
    /// elsewhere are skipped and picked up by a later pass; stray body and
    /// temp files left by interrupted writes are reclaimed alongside expired
    /// entries.
    pub fn sweep_at(&self, now: u64, batch_size: usize) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let dirs = self.shard_dirs()?;
        let start = self.resume_index(&dirs);
        for shard_dir in dirs.iter().cycle().skip(start).take(dirs.len()) {
            for digest in meta_digests(shard_dir) {
                if stats.scanned >= batch_size {
                    return self.pause_sweep(shard_dir, stats);
                }
                stats.scanned += 1;
                if self.sweep_entry(&digest, now) {
                    stats.deleted += 1;
                }
            }
            for (digest, path) in stray_files(shard_dir) {
                if stats.scanned >= batch_size {
                    return self.pause_sweep(shard_dir, stats);
                }
                stats.scanned += 1;
                if self.remove_stray(&digest, &path) {
                    stats.deleted += 1;
                }
            }
            prune_if_empty(shard_dir);
        }
        *self.sweep_cursor.lock() = None;
        metrics::record_sweep(stats.deleted);
        debug!(scanned = stats.scanned, deleted = stats.deleted, "sweep pass finished");
        Ok(stats)
    }

    /// Batch exhausted; remember the shard so the next pass starts there.
    fn pause_sweep(&self, shard_dir: &Path, stats: SweepStats) -> Result<SweepStats> {
        *self.sweep_cursor.lock() = shard_dir.file_name().map(|name| name.to_os_string());
        metrics::record_sweep(stats.deleted);
        debug!(scanned = stats.scanned, deleted = stats.deleted, "sweep batch exhausted");
        Ok(stats)
    }

    fn resume_index(&self, dirs: &[PathBuf]) -> usize {
        let cursor = self.sweep_cursor.lock().clone();
        let Some(name) = cursor else { return 0 };
        // The cursor shard may have been pruned; fall forward to the next
        // one in order, wrapping to the front past the end.
        dirs.iter()
            .position(|dir| dir.file_name().is_some_and(|n| n >= name.as_os_str()))
            .unwrap_or(0)
    }

    fn sweep_entry(&self, digest: &str, now: u64) -> bool {
        let guard = match lock::try_exclusive(&self.store.lock_path(digest)) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(digest, "entry busy; skipping this pass");
                return false;
            }
            Err(err) => {
                warn!(error = %err, digest, "failed to open entry lock during sweep");
                return false;
            }
        };
        // Re-read under the lock; a writer may have refreshed the entry
        // between the scan and the acquisition.
        let raw = match fs::read(self.store.meta_path(digest)) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let expired = match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) => entry.is_expired(now),
            Err(err) => {
                warn!(error = %err, digest, "unreadable metadata; leaving for the serve path");
                false
            }
        };
        if expired {
            self.store.delete(digest);
        }
        drop(guard);
        expired
    }

    /// Remove a body or temp file with no live metadata. The entry lock
    /// serializes against writers; a `.data` whose metadata reappeared under
    /// the lock belongs to a completed write and is kept.
    fn remove_stray(&self, digest: &str, path: &Path) -> bool {
        let guard = match lock::try_exclusive(&self.store.lock_path(digest)) {
            Ok(Some(guard)) => guard,
            _ => return false,
        };
        let is_temp = path.extension().is_some_and(|ext| ext == "tmp");
        if !is_temp && self.store.meta_path(digest).exists() {
            drop(guard);
            return false;
        }
        let removed = fs::remove_file(path).is_ok();
        drop(guard);
        removed
    }

    fn shard_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let entries = match fs::read_dir(self.store.base()) {
            Ok(entries) => entries,
            Err(_) => return Ok(dirs),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Count shards and live metadata files without locking anything.
    pub fn tree_stats(&self) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        for shard_dir in self.shard_dirs()? {
            stats.shards += 1;
            stats.entries += meta_digests(&shard_dir).len();
        }
        Ok(stats)
    }
}

fn meta_digests(shard_dir: &Path) -> Vec<String> {
    let mut digests = Vec::new();
    let entries = match fs::read_dir(shard_dir) {
        Ok(entries) => entries,
        Err(_) => return digests,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "meta") {
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                digests.push(stem.to_string());
            }
        }
    }
    digests.sort();
    digests
}

/// Files a crashed or failed write can leave behind: a `.data.tmp` that was
/// never renamed, or a `.data` whose metadata was deleted or never written.
fn stray_files(shard_dir: &Path) -> Vec<(String, PathBuf)> {
    let mut strays = Vec::new();
    let Ok(entries) = fs::read_dir(shard_dir) else {
        return strays;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if let Some(digest) = name.strip_suffix(".data.tmp") {
            strays.push((digest.to_string(), path));
        } else if let Some(digest) = name.strip_suffix(".data") {
            if !path.with_extension("meta").exists() {
                strays.push((digest.to_string(), path));
            }
        }
    }
    strays.sort();
    strays
}

/// Remove a shard directory only when it holds nothing at all. Shards that
/// still carry lock files stay; unlinking a lock file a writer has already
/// opened would let two writers hold "exclusive" locks on different inodes.
fn prune_if_empty(shard_dir: &Path) {
    fs::remove_dir(shard_dir).ok();
}

/// Run periodic sweeps on a background task. A zero interval or batch size
/// disables the sweeper.
pub fn spawn_sweeper(cache: Arc<PageCache>, interval: Duration, batch_size: usize) {
    if interval.is_zero() || batch_size == 0 {
        info!("background sweeper disabled");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cache = Arc::clone(&cache);
            let outcome =
                tokio::task::spawn_blocking(move || cache.sweep_batch(batch_size)).await;
            match outcome {
                Ok(Ok(stats)) if stats.deleted > 0 => {
                    info!(scanned = stats.scanned, deleted = stats.deleted, "sweep reclaimed entries");
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => warn!(error = %err, "sweep pass failed"),
                Err(err) => warn!(error = %err, "sweep task panicked"),
            }
        }
    });
}
