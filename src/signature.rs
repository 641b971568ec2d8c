//! Request identity.
//!
//! A [`RequestSignature`] is derived from the method, the normalized path (route params
//! substituted, duplicate and trailing slashes removed), the sorted query parameters, the
//! body serialized as JSON and whether the call opts out of credentials. `serde_json`
//! objects are key-sorted, so logically equal bodies produce the same text. Headers are
//! never part of the signature; including trace ids would make every call unique and
//! defeat caching and deduplication.

use crate::request::{Method, RequestConfig};
use std::collections::BTreeMap;
use std::fmt;

/// Deterministic identity of a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestSignature {
    key: String,
    method: Method,
    path: String,
}

impl RequestSignature {
    /// Compute the signature for a call.
    pub fn new(
        method: Method,
        path: &str,
        config: &RequestConfig,
        body: Option<&serde_json::Value>,
    ) -> Self {
        let (path, query) = normalize(path, config);
        let mut key = format!("{} {}", method, path);
        let query_string = encode_query(&query);
        if !query_string.is_empty() {
            key.push('?');
            key.push_str(&query_string);
        }
        if let Some(body) = body {
            key.push('#');
            key.push_str(&body.to_string());
        }
        // Anonymous and authenticated calls may see different responses.
        if config.skip_auth {
            key.push_str(" |anon");
        }
        Self { key, method, path }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Normalized path without query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// True when this signature's path equals `prefix` or is nested below it.
    pub fn path_starts_with(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        self.path == prefix
            || (self.path.starts_with(prefix) && self.path[prefix.len()..].starts_with('/'))
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Normalize a path and merge any inline query string with `config.query`.
/// Explicit config entries win over inline ones.
pub(crate) fn normalize(path: &str, config: &RequestConfig) -> (String, BTreeMap<String, String>) {
    let (raw_path, inline_query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };

    let mut segments = Vec::new();
    for segment in raw_path.split('/').filter(|s| !s.is_empty()) {
        segments.push(substitute(segment, &config.params));
    }
    let normalized = format!("/{}", segments.join("/"));

    let mut query = BTreeMap::new();
    if let Some(inline) = inline_query {
        for pair in inline.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let k = urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.into());
            let v = urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_else(|_| v.into());
            query.insert(k, v);
        }
    }
    query.extend(config.query.iter().map(|(k, v)| (k.clone(), v.clone())));
    (normalized, query)
}

fn substitute(segment: &str, params: &BTreeMap<String, String>) -> String {
    let name = segment
        .strip_prefix(':')
        .or_else(|| segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')));
    match name.and_then(|n| params.get(n)) {
        Some(value) => urlencoding::encode(value).into_owned(),
        None => segment.to_string(),
    }
}

pub(crate) fn encode_query(query: &BTreeMap<String, String>) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
