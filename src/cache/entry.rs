use std::collections::BTreeSet;

use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

/// On-disk metadata document for one cached response. The body bytes live in
/// the sibling `.data` file; the pair is always written together under the
/// entry lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub created_at: u64,
    pub expires_at: u64,
    pub body_len: u64,
    pub body_hash: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at < now
    }

    /// True when the body bytes are the ones this metadata was written for.
    /// A failed or interrupted write leaves a pair that fails this check.
    pub fn matches_body(&self, body: &[u8]) -> bool {
        body.len() as u64 == self.body_len && body_digest(body) == self.body_hash
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::OK)
    }

    pub fn header_map(&self) -> HeaderMap {
        pairs_to_header_map(&self.headers)
    }
}

pub fn body_digest(body: &[u8]) -> String {
    blake3::hash(body).to_hex().to_string()
}

pub(super) fn header_map_to_pairs(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

pub(super) fn pairs_to_header_map(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}
