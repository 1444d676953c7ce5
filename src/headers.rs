//! Header conditioning shared by the internal servers and the forward engine.
//!
//! Messages carry their headers twice: the ordered raw list exactly as it
//! arrived (duplicates kept) and a keyed view where the last occurrence of a
//! name wins. Keys of the keyed view are lowercase.

use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue};

pub const CONNECTION: &str = "Connection";
pub const PROXY_CONNECTION: &str = "Proxy-Connection";
pub const STRICT_TRANSPORT_SECURITY: &str = "Strict-Transport-Security";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const HOST: &str = "Host";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// `content-length` -> `Content-Length`. Only a lowercase ASCII letter at the
/// start of a hyphen-delimited segment is changed.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut segment_start = true;
    for c in name.chars() {
        if segment_start && c.is_ascii_lowercase() {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
        segment_start = c == '-';
    }
    out
}

pub fn canonicalize(raw: &[Header]) -> Vec<Header> {
    raw.iter()
        .map(|h| Header {
            name: canonical_name(&h.name),
            value: h.value.clone(),
        })
        .collect()
}

/// Ordered raw list to keyed map, last write wins. Keys keep their casing.
pub fn map_raw(raw: &[Header]) -> BTreeMap<String, String> {
    let mut keyed = BTreeMap::new();
    for h in raw {
        keyed.insert(h.name.clone(), h.value.clone());
    }
    keyed
}

pub fn to_raw(keyed: &BTreeMap<String, String>) -> Vec<Header> {
    keyed
        .iter()
        .map(|(name, value)| Header::new(name.clone(), value.clone()))
        .collect()
}

/// Folds raw lists left to right; a name in a later list replaces the value
/// of the same name from earlier lists, keeping first-appearance order.
pub fn merge(lists: &[Vec<Header>]) -> Vec<Header> {
    let mut merged: Vec<Header> = Vec::new();
    for list in lists {
        for h in list {
            match merged.iter_mut().find(|m| m.name == h.name) {
                Some(existing) => existing.value = h.value.clone(),
                None => merged.push(h.clone()),
            }
        }
    }
    merged
}

/// Raw header list plus its keyed view.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSet {
    raw: Vec<Header>,
    keyed: BTreeMap<String, String>,
}

impl HeaderSet {
    pub fn from_raw(raw: Vec<Header>) -> Self {
        let mut set = Self {
            raw,
            keyed: BTreeMap::new(),
        };
        set.rebuild_keyed();
        set
    }

    pub fn from_http(map: &HeaderMap) -> Self {
        let raw = map
            .iter()
            .map(|(name, value)| {
                Header::new(
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        Self::from_raw(raw)
    }

    fn rebuild_keyed(&mut self) {
        self.keyed.clear();
        for h in &self.raw {
            self.keyed
                .insert(h.name.to_ascii_lowercase(), h.value.clone());
        }
    }

    pub fn raw(&self) -> &[Header] {
        &self.raw
    }

    pub fn keyed(&self) -> &BTreeMap<String, String> {
        &self.keyed
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Case-insensitive lookup in the keyed view.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.keyed
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replaces every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.raw.retain(|h| !h.name.eq_ignore_ascii_case(name));
        self.raw.push(Header::new(name, value));
        self.rebuild_keyed();
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.raw.push(Header::new(name, value));
        self.rebuild_keyed();
    }

    pub fn remove(&mut self, name: &str) {
        self.raw.retain(|h| !h.name.eq_ignore_ascii_case(name));
        self.rebuild_keyed();
    }

    pub fn content_length(&self) -> Option<u64> {
        self.get(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Keyed representation for transmission: one value per name, last
    /// write wins. Entries hyper cannot represent are skipped.
    pub fn to_http(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.raw.len());
        for h in &self.raw {
            if let (Ok(name), Ok(val)) = (
                h.name.parse::<HeaderName>(),
                HeaderValue::from_str(&h.value),
            ) {
                map.insert(name, val);
            }
        }
        map
    }

    /// Every raw entry in order, duplicates kept. Used for responses so
    /// repeated `Set-Cookie` lines survive.
    pub fn to_http_all(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.raw.len());
        for h in &self.raw {
            if let (Ok(name), Ok(val)) = (
                h.name.parse::<HeaderName>(),
                HeaderValue::from_str(&h.value),
            ) {
                map.append(name, val);
            }
        }
        map
    }
}

/// Canonicalizes names, drops `Proxy-Connection` and
/// `Strict-Transport-Security`, and forces `Connection: close`.
///
/// Keep-alive is never passed through: every upstream exchange carries a
/// single request.
pub fn condition(headers: &mut HeaderSet) {
    let mut conditioned = Vec::with_capacity(headers.raw.len());
    for h in canonicalize(&headers.raw) {
        match h.name.as_str() {
            PROXY_CONNECTION | STRICT_TRANSPORT_SECURITY => {}
            CONNECTION => conditioned.push(Header::new(CONNECTION, "close")),
            _ => conditioned.push(h),
        }
    }
    headers.raw = conditioned;
    headers.rebuild_keyed();
}
