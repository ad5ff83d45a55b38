//! Filesystem-backed full-page response cache.
//!
//! [`PageCache`] ties the pieces together: fingerprints derived from request
//! descriptors, a sharded metadata/body store, the shared tag-invalidation
//! ledger, response admission, and the expiry sweep. All I/O is synchronous;
//! cross-process coordination runs on advisory file locks.

pub mod classify;
pub mod context;
pub mod entry;
pub mod fingerprint;
mod ledger;
mod lock;
pub mod maintenance;
mod store;

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

pub use classify::{CapturedResponse, SkipReason};
use classify::Classification;
pub use context::RequestCycle;
pub use entry::CacheEntry;
pub use fingerprint::{parse_cookie_header, RequestDescriptor};
use ledger::FlagLedger;
pub use maintenance::{spawn_sweeper, SweepStats, TreeStats};
use store::EntryStore;

use crate::metrics;

/// Response header reporting the cache's involvement: `hit`, `miss`,
/// `expired`, or `skip`.
pub const X_CACHE: &str = "x-cache";

/// Tuning knobs for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub base_dir: PathBuf,
    pub ttl: Duration,
    pub ignored_query_vars: HashSet<String>,
    pub ignored_cookies: HashSet<String>,
    pub allowed_status_codes: HashSet<u16>,
    pub cacheable_methods: HashSet<String>,
    pub lock_timeout: Duration,
}

impl CacheOptions {
    /// Defaults: ten-minute TTL, the common tracking parameters and the
    /// browser-probe cookie ignored, idempotent methods only, and the handful
    /// of response codes worth keeping.
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            ttl: Duration::from_secs(600),
            ignored_query_vars: [
                "utm_source",
                "utm_medium",
                "utm_campaign",
                "utm_term",
                "utm_content",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            ignored_cookies: ["test_cookie".to_string()].into(),
            allowed_status_codes: [200, 301, 302, 304, 404].into(),
            cacheable_methods: ["GET".to_string(), "HEAD".to_string()].into(),
            lock_timeout: Duration::from_millis(250),
        }
    }
}

/// A cached response ready to hand to the client.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// What the serve path found for a fingerprint.
#[derive(Debug)]
pub enum ServeOutcome {
    Hit(ServedResponse),
    Miss,
    Expired,
}

impl ServeOutcome {
    /// Value for the [`X_CACHE`] response header.
    pub fn cache_header(&self) -> &'static str {
        match self {
            ServeOutcome::Hit(_) => "hit",
            ServeOutcome::Miss => "miss",
            ServeOutcome::Expired => "expired",
        }
    }
}

/// What became of a captured response.
#[derive(Debug)]
pub enum StoreOutcome {
    Stored,
    Skipped(SkipReason),
    Failed,
}

impl StoreOutcome {
    /// Header value to report alongside a freshly rendered response, if any.
    /// Stored and failed writes keep the serve path's `miss`.
    pub fn cache_header(&self) -> Option<&'static str> {
        match self {
            StoreOutcome::Skipped(_) => Some("skip"),
            StoreOutcome::Stored | StoreOutcome::Failed => None,
        }
    }
}

/// The cache facade. Safe to share behind an `Arc`; every method takes
/// `&self`.
#[derive(Debug)]
pub struct PageCache {
    options: CacheOptions,
    store: EntryStore,
    ledger: FlagLedger,
    // Shard name where the next batched sweep resumes.
    sweep_cursor: Mutex<Option<OsString>>,
}

impl PageCache {
    pub fn new(options: CacheOptions) -> Result<Self> {
        fs::create_dir_all(&options.base_dir).with_context(|| {
            format!("failed to create cache directory {}", options.base_dir.display())
        })?;
        let store = EntryStore::new(options.base_dir.clone(), options.lock_timeout);
        let ledger = FlagLedger::new(&options.base_dir, options.lock_timeout);
        Ok(Self {
            options,
            store,
            ledger,
            sweep_cursor: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Fingerprint a request under this cache's deny-lists.
    pub fn fingerprint(&self, descriptor: &RequestDescriptor) -> String {
        descriptor.derive(&self.options.ignored_query_vars, &self.options.ignored_cookies)
    }

    /// Look up a request. Storage trouble of any kind degrades to a miss so
    /// the origin can render.
    pub fn serve(&self, descriptor: &RequestDescriptor) -> ServeOutcome {
        self.serve_at(descriptor, unix_now())
    }

    /// Clock-injected variant of [`serve`](Self::serve).
    pub fn serve_at(&self, descriptor: &RequestDescriptor, now: u64) -> ServeOutcome {
        let digest = self.fingerprint(descriptor);
        let outcome = match self.store.get(&digest) {
            None => ServeOutcome::Miss,
            Some((entry, _)) if entry.is_expired(now) => {
                trace!(digest, host = descriptor.host(), path = descriptor.path(), "entry past its ttl");
                ServeOutcome::Expired
            }
            Some((entry, _)) if self.ledger.is_stale(&entry) => {
                trace!(digest, host = descriptor.host(), path = descriptor.path(), "entry invalidated by tag");
                ServeOutcome::Expired
            }
            Some((entry, body)) => ServeOutcome::Hit(ServedResponse {
                status: entry.status(),
                headers: entry.header_map(),
                body,
            }),
        };
        metrics::record_serve(outcome.cache_header());
        outcome
    }

    /// Run admission on a captured response and persist it if it qualifies.
    /// Tags accumulated on the request cycle are stamped onto the entry.
    pub fn classify_and_store(
        &self,
        descriptor: &RequestDescriptor,
        response: &CapturedResponse,
        cycle: &RequestCycle,
    ) -> StoreOutcome {
        self.classify_and_store_at(descriptor, response, cycle, unix_now())
    }

    /// Clock-injected variant of [`classify_and_store`](Self::classify_and_store).
    pub fn classify_and_store_at(
        &self,
        descriptor: &RequestDescriptor,
        response: &CapturedResponse,
        cycle: &RequestCycle,
        now: u64,
    ) -> StoreOutcome {
        let pending = cycle.rendered();
        match classify::classify(descriptor, response, &pending, &self.options, now) {
            Classification::Skip(reason) => {
                metrics::record_skip(reason.as_str());
                debug!(
                    reason = reason.as_str(),
                    host = descriptor.host(),
                    path = descriptor.path(),
                    "response not admitted"
                );
                StoreOutcome::Skipped(reason)
            }
            Classification::Store(entry) => {
                let digest = self.fingerprint(descriptor);
                match self.store.put(&digest, &entry, &response.body) {
                    Ok(true) => {
                        metrics::record_store();
                        trace!(digest, host = descriptor.host(), path = descriptor.path(), "response stored");
                        StoreOutcome::Stored
                    }
                    Ok(false) => {
                        debug!(digest, "entry lock contended; response not stored");
                        StoreOutcome::Failed
                    }
                    Err(err) => {
                        warn!(error = %err, digest, "failed to persist response");
                        StoreOutcome::Failed
                    }
                }
            }
        }
    }

    /// Flush the cycle's changed tags into the shared ledger. Returns false
    /// when the flush could not be recorded (ledger busy or unwritable); an
    /// empty changed-set is a successful no-op. The cycle keeps its tags
    /// either way, so a failed flush can be retried.
    pub fn flush_invalidations(&self, cycle: &RequestCycle) -> bool {
        self.flush_invalidations_at(cycle, unix_now())
    }

    /// Clock-injected variant of [`flush_invalidations`](Self::flush_invalidations).
    pub fn flush_invalidations_at(&self, cycle: &RequestCycle, at: u64) -> bool {
        let changed = cycle.changed();
        if changed.is_empty() {
            return true;
        }
        match self.ledger.record(&changed, at) {
            Ok(true) => {
                metrics::record_ledger_flush();
                debug!(tags = changed.len(), "invalidations recorded");
                true
            }
            Ok(false) => {
                warn!("ledger lock contended; invalidations not recorded");
                false
            }
            Err(err) => {
                warn!(error = %err, "failed to record invalidations");
                false
            }
        }
    }

    /// Mark a set of tags invalid as of now, outside any request cycle.
    pub fn invalidate_tags(&self, tags: &BTreeSet<String>) -> Result<bool> {
        self.ledger.record(tags, unix_now())
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
