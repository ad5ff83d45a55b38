use std::collections::BTreeSet;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Pending {
    rendered: BTreeSet<String>,
    changed: BTreeSet<String>,
}

/// Per-request tag accumulator. Handler code tags the page being rendered and
/// marks tags whose content it changed; the cache drains neither set, so a
/// failed ledger flush can be retried.
///
/// Interior mutability lets the handler share one cycle across helpers
/// without threading `&mut` through every call.
#[derive(Debug, Default)]
pub struct RequestCycle {
    inner: Mutex<Pending>,
}

impl RequestCycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a tag with the page currently being rendered.
    pub fn tag(&self, tag: impl Into<String>) {
        self.inner.lock().rendered.insert(tag.into());
    }

    /// Mark a tag's content as changed by this request.
    pub fn invalidate(&self, tag: impl Into<String>) {
        self.inner.lock().changed.insert(tag.into());
    }

    pub fn rendered(&self) -> BTreeSet<String> {
        self.inner.lock().rendered.clone()
    }

    pub fn changed(&self) -> BTreeSet<String> {
        self.inner.lock().changed.clone()
    }
}
