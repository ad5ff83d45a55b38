use std::collections::{BTreeMap, HashSet};

use http::Method;
use serde::Serialize;
use url::form_urlencoded;

/// Immutable request descriptor, constructed once per request from transport
/// parts and passed to every cache component.
///
/// The host is lowercased and the query string is decoded at construction
/// time; deny-list filtering happens at [`derive`](Self::derive) so the same
/// descriptor can be hashed under different configurations.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    secure: bool,
    method: String,
    host: String,
    path: String,
    query_vars: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    // Reserved for future key variance; always empty today.
    headers: BTreeMap<String, String>,
}

/// Canonical tuple hashed into a fingerprint. Field order is fixed and the
/// maps are sorted, so equal filtered tuples encode identically no matter how
/// the transport layer ordered them.
#[derive(Serialize)]
struct CanonicalKey<'a> {
    secure: bool,
    method: &'a str,
    host: &'a str,
    path: &'a str,
    query_vars: BTreeMap<&'a str, &'a str>,
    cookies: BTreeMap<&'a str, &'a str>,
    headers: &'a BTreeMap<String, String>,
}

impl RequestDescriptor {
    pub fn new(
        secure: bool,
        method: &Method,
        host: &str,
        path_and_query: &str,
        cookies: BTreeMap<String, String>,
    ) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path_and_query, ""),
        };
        let query_vars = form_urlencoded::parse(query.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        Self {
            secure,
            method: method.as_str().to_string(),
            host: host.to_ascii_lowercase(),
            path: path.to_string(),
            query_vars,
            cookies,
            headers: BTreeMap::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Derive the cache fingerprint: drop deny-listed query variables and
    /// cookies, then hash the canonical encoding of what remains. Pure in
    /// the filtered tuple; no I/O or ambient state.
    pub fn derive(
        &self,
        ignored_query_vars: &HashSet<String>,
        ignored_cookies: &HashSet<String>,
    ) -> String {
        let key = CanonicalKey {
            secure: self.secure,
            method: &self.method,
            host: &self.host,
            path: &self.path,
            query_vars: filtered(&self.query_vars, ignored_query_vars),
            cookies: filtered(&self.cookies, ignored_cookies),
            headers: &self.headers,
        };
        let encoded =
            serde_json::to_vec(&key).expect("canonical key serialization cannot fail");
        blake3::hash(&encoded).to_hex().to_string()
    }
}

fn filtered<'a>(
    map: &'a BTreeMap<String, String>,
    deny: &HashSet<String>,
) -> BTreeMap<&'a str, &'a str> {
    map.iter()
        .filter(|(name, _)| !deny.contains(name.as_str()))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect()
}

/// Parse a raw `Cookie:` header value into the descriptor's cookie map.
pub fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_deny() -> HashSet<String> {
        HashSet::new()
    }

    fn deny(names: &[&str]) -> HashSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn descriptor(path_and_query: &str, cookies: &[(&str, &str)]) -> RequestDescriptor {
        let cookies = cookies
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        RequestDescriptor::new(false, &Method::GET, "example.org", path_and_query, cookies)
    }

    #[test]
    fn digest_ignores_query_parameter_order() {
        let a = descriptor("/blog?a=1&b=2", &[]);
        let b = descriptor("/blog?b=2&a=1", &[]);
        assert_eq!(a.derive(&no_deny(), &no_deny()), b.derive(&no_deny(), &no_deny()));
    }

    #[test]
    fn deny_listed_query_vars_do_not_fragment_the_key() {
        let ignored = deny(&["utm_source", "utm_medium"]);
        let plain = descriptor("/blog/post-1", &[]);
        let tracked = descriptor("/blog/post-1?utm_source=x&utm_medium=email", &[]);
        assert_eq!(
            plain.derive(&ignored, &no_deny()),
            tracked.derive(&ignored, &no_deny())
        );
    }

    #[test]
    fn deny_listed_cookies_do_not_fragment_the_key() {
        let ignored = deny(&["test_cookie"]);
        let bare = descriptor("/", &[("session", "abc")]);
        let extra = descriptor("/", &[("session", "abc"), ("test_cookie", "1")]);
        assert_eq!(
            bare.derive(&no_deny(), &ignored),
            extra.derive(&no_deny(), &ignored)
        );
    }

    #[test]
    fn remaining_cookies_still_vary_the_key() {
        let a = descriptor("/", &[("session", "abc")]);
        let b = descriptor("/", &[("session", "def")]);
        assert_ne!(a.derive(&no_deny(), &no_deny()), b.derive(&no_deny(), &no_deny()));
    }

    #[test]
    fn host_is_case_insensitive_but_scheme_and_method_vary_the_key() {
        let lower = RequestDescriptor::new(false, &Method::GET, "example.org", "/", BTreeMap::new());
        let upper = RequestDescriptor::new(false, &Method::GET, "EXAMPLE.org", "/", BTreeMap::new());
        assert_eq!(
            lower.derive(&no_deny(), &no_deny()),
            upper.derive(&no_deny(), &no_deny())
        );

        let secure = RequestDescriptor::new(true, &Method::GET, "example.org", "/", BTreeMap::new());
        assert_ne!(
            lower.derive(&no_deny(), &no_deny()),
            secure.derive(&no_deny(), &no_deny())
        );

        let head = RequestDescriptor::new(false, &Method::HEAD, "example.org", "/", BTreeMap::new());
        assert_ne!(
            lower.derive(&no_deny(), &no_deny()),
            head.derive(&no_deny(), &no_deny())
        );
    }

    #[test]
    fn digest_is_hex_and_shardable() {
        let digest = descriptor("/", &[]).derive(&no_deny(), &no_deny());
        assert_eq!(digest.len(), 64);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn cookie_header_parsing() {
        let cookies = parse_cookie_header("session=abc; theme=dark; bare; =empty");
        assert_eq!(cookies.len(), 2);
        assert_eq!(cookies.get("session").map(String::as_str), Some("abc"));
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
    }
}
