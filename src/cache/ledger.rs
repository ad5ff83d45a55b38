use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use super::entry::CacheEntry;
use super::lock;

pub const LEDGER_FILE: &str = "flags.json";
const LEDGER_LOCK_FILE: &str = "flags.lock";
const LEDGER_TMP_FILE: &str = "flags.json.tmp";

/// Shared tag-invalidation ledger: a single JSON document mapping tag name to
/// the unix timestamp of its most recent invalidation. Read in full on the
/// serve path, rewritten in full on each flush.
#[derive(Debug, Clone)]
pub struct FlagLedger {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
    lock_timeout: Duration,
}

impl FlagLedger {
    pub fn new(base: &Path, lock_timeout: Duration) -> Self {
        Self {
            path: base.join(LEDGER_FILE),
            lock_path: base.join(LEDGER_LOCK_FILE),
            tmp_path: base.join(LEDGER_TMP_FILE),
            lock_timeout,
        }
    }

    /// Upsert every tag's timestamp to `at`, last write wins per tag. The
    /// read-modify-write runs under the ledger's exclusive lock so concurrent
    /// flushes cannot lose disjoint tags, and the document is replaced
    /// atomically so readers never parse a half-written ledger. Returns false
    /// when the lock stayed contended and the flush was skipped.
    pub fn record(&self, tags: &BTreeSet<String>, at: u64) -> Result<bool> {
        if tags.is_empty() {
            return Ok(true);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache root {}", parent.display()))?;
        }
        let guard = match lock::exclusive(&self.lock_path, self.lock_timeout)? {
            Some(guard) => guard,
            None => return Ok(false),
        };
        let mut flags = self.load();
        for tag in tags {
            flags.insert(tag.clone(), at);
        }
        let encoded = serde_json::to_vec(&flags)?;
        fs::write(&self.tmp_path, &encoded)
            .with_context(|| format!("failed to write ledger {}", self.tmp_path.display()))?;
        fs::rename(&self.tmp_path, &self.path)
            .with_context(|| format!("failed to replace ledger {}", self.path.display()))?;
        drop(guard);
        Ok(true)
    }

    /// Full-document read. An absent or unparseable ledger reads as empty.
    pub fn load(&self) -> BTreeMap<String, u64> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_slice(&raw) {
            Ok(flags) => flags,
            Err(err) => {
                warn!(error = %err, "unparseable invalidation ledger; treating as empty");
                BTreeMap::new()
            }
        }
    }

    /// True when any of the entry's tags was invalidated strictly after the
    /// entry was created. Untagged entries never consult the ledger.
    pub fn is_stale(&self, entry: &CacheEntry) -> bool {
        if entry.tags.is_empty() {
            return false;
        }
        let flags = self.load();
        if flags.is_empty() {
            return false;
        }
        entry
            .tags
            .iter()
            .any(|tag| flags.get(tag).is_some_and(|&ts| ts > entry.created_at))
    }
}
