use std::collections::BTreeSet;

use bytes::Bytes;
use http::header::{CACHE_CONTROL, SET_COOKIE};
use http::{HeaderMap, StatusCode};

use super::entry::{self, CacheEntry};
use super::fingerprint::RequestDescriptor;
use super::CacheOptions;

/// A fully rendered upstream response, captured before it is handed back to
/// the client.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Why a response was not admitted to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    SetCookie,
    ResponseNotCacheable,
    Method,
    StatusCode,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::SetCookie => "set_cookie",
            SkipReason::ResponseNotCacheable => "response_not_cacheable",
            SkipReason::Method => "method",
            SkipReason::StatusCode => "status_code",
        }
    }
}

#[derive(Debug)]
pub(super) enum Classification {
    Store(CacheEntry),
    Skip(SkipReason),
}

/// Admission decision for a captured response. Checks run in a fixed order
/// and the first failing one names the skip reason.
pub(super) fn classify(
    descriptor: &RequestDescriptor,
    response: &CapturedResponse,
    pending_tags: &BTreeSet<String>,
    options: &CacheOptions,
    now: u64,
) -> Classification {
    if response.headers.contains_key(SET_COOKIE) {
        return Classification::Skip(SkipReason::SetCookie);
    }
    if declares_non_cacheable(&response.headers) {
        return Classification::Skip(SkipReason::ResponseNotCacheable);
    }
    if !options.cacheable_methods.contains(descriptor.method()) {
        return Classification::Skip(SkipReason::Method);
    }
    if !options.allowed_status_codes.contains(&response.status.as_u16()) {
        return Classification::Skip(SkipReason::StatusCode);
    }
    Classification::Store(CacheEntry {
        status_code: response.status.as_u16(),
        headers: entry::header_map_to_pairs(&response.headers),
        created_at: now,
        expires_at: now + options.ttl.as_secs(),
        body_len: response.body.len() as u64,
        body_hash: entry::body_digest(&response.body),
        tags: pending_tags.clone(),
    })
}

fn declares_non_cacheable(headers: &HeaderMap) -> bool {
    headers.get_all(CACHE_CONTROL).iter().any(|value| {
        value
            .to_str()
            .map(|raw| {
                let raw = raw.to_ascii_lowercase();
                raw.contains("no-cache") || raw.contains("max-age=0")
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use http::Method;

    use super::*;

    fn options() -> CacheOptions {
        CacheOptions::new("/tmp/unused".into())
    }

    fn descriptor(method: &Method) -> RequestDescriptor {
        RequestDescriptor::new(false, method, "example.org", "/", BTreeMap::new())
    }

    fn response(status: StatusCode, headers: HeaderMap) -> CapturedResponse {
        CapturedResponse {
            status,
            headers,
            body: Bytes::from_static(b"<html>"),
        }
    }

    fn classify_plain(method: &Method, response: &CapturedResponse) -> Classification {
        classify(&descriptor(method), response, &BTreeSet::new(), &options(), 1000)
    }

    #[test]
    fn plain_ok_response_is_admitted() {
        let captured = response(StatusCode::OK, HeaderMap::new());
        match classify_plain(&Method::GET, &captured) {
            Classification::Store(entry) => {
                assert_eq!(entry.status_code, 200);
                assert_eq!(entry.created_at, 1000);
                assert_eq!(entry.expires_at, 1600);
                assert!(entry.matches_body(b"<html>"));
                assert!(entry.tags.is_empty());
            }
            Classification::Skip(reason) => panic!("unexpected skip: {reason:?}"),
        }
    }

    #[test]
    fn set_cookie_blocks_admission() {
        let mut headers = HeaderMap::new();
        headers.insert(SET_COOKIE, "session=abc".parse().expect("value"));
        let captured = response(StatusCode::OK, headers);
        match classify_plain(&Method::GET, &captured) {
            Classification::Skip(SkipReason::SetCookie) => {}
            other => panic!("expected set_cookie skip, got {other:?}"),
        }
    }

    #[test]
    fn cache_control_opt_outs_block_admission() {
        for directive in ["no-cache", "No-Cache, private", "public, max-age=0"] {
            let mut headers = HeaderMap::new();
            headers.insert(CACHE_CONTROL, directive.parse().expect("value"));
            let captured = response(StatusCode::OK, headers);
            match classify_plain(&Method::GET, &captured) {
                Classification::Skip(SkipReason::ResponseNotCacheable) => {}
                other => panic!("{directive:?} should skip, got {other:?}"),
            }
        }
    }

    #[test]
    fn max_age_longer_than_zero_still_admits() {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, "public, max-age=300".parse().expect("value"));
        let captured = response(StatusCode::OK, headers);
        assert!(matches!(
            classify_plain(&Method::GET, &captured),
            Classification::Store(_)
        ));
    }

    #[test]
    fn non_cacheable_method_blocks_admission() {
        let captured = response(StatusCode::OK, HeaderMap::new());
        match classify_plain(&Method::POST, &captured) {
            Classification::Skip(SkipReason::Method) => {}
            other => panic!("expected method skip, got {other:?}"),
        }
    }

    #[test]
    fn disallowed_status_blocks_admission() {
        let captured = response(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new());
        match classify_plain(&Method::GET, &captured) {
            Classification::Skip(SkipReason::StatusCode) => {}
            other => panic!("expected status skip, got {other:?}"),
        }
    }

    #[test]
    fn not_found_is_cacheable_by_default() {
        let captured = response(StatusCode::NOT_FOUND, HeaderMap::new());
        assert!(matches!(
            classify_plain(&Method::GET, &captured),
            Classification::Store(_)
        ));
    }

    #[test]
    fn set_cookie_outranks_the_method_check() {
        let mut headers = HeaderMap::new();
        headers.insert(SET_COOKIE, "a=b".parse().expect("value"));
        let captured = response(StatusCode::OK, headers);
        match classify_plain(&Method::POST, &captured) {
            Classification::Skip(SkipReason::SetCookie) => {}
            other => panic!("expected set_cookie skip, got {other:?}"),
        }
    }

    #[test]
    fn pending_tags_land_on_the_entry() {
        let tags: BTreeSet<String> =
            ["post:42".to_string(), "archive:2024".to_string()].into();
        let captured = response(StatusCode::OK, HeaderMap::new());
        match classify(&descriptor(&Method::GET), &captured, &tags, &options(), 1000) {
            Classification::Store(entry) => assert_eq!(entry.tags, tags),
            other => panic!("expected store, got {other:?}"),
        }
    }
}
