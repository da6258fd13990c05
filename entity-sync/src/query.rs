//! Query normalization
//!
//! Two queries are cache-equivalent iff their normalized string forms are
//! equal, so normalization must be a pure function of (path, params, page
//! size): parameters are kept sorted, array values are sorted and
//! bracket-joined, and defaults are injected deterministically. The result
//! never depends on the order in which the caller inserted parameters.

use std::collections::BTreeMap;

/// Ceiling for a single id-listing request.
pub const MAX_IDS_PER_REQUEST: u32 = 1000;

/// Default entity page size.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// A query parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Rendered sorted, comma-joined and bracket-wrapped: `[a,b,c]`.
    List(Vec<String>),
    /// Escape hatch: suppress a parameter that a default would inject.
    Null,
}

impl ParamValue {
    /// Wire rendering; `None` for [`ParamValue::Null`].
    fn render(&self) -> Option<String> {
        match self {
            ParamValue::Str(s) => Some(urlencoding::encode(s).into_owned()),
            ParamValue::Int(n) => Some(n.to_string()),
            ParamValue::Bool(b) => Some(b.to_string()),
            ParamValue::List(values) => {
                let mut sorted: Vec<String> = values
                    .iter()
                    .map(|v| urlencoding::encode(v).into_owned())
                    .collect();
                sorted.sort();
                Some(format!("[{}]", sorted.join(",")))
            }
            ParamValue::Null => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Int(n)
    }
}

impl From<u32> for ParamValue {
    fn from(n: u32) -> Self {
        ParamValue::Int(n as i64)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Bool(b)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(values: Vec<String>) -> Self {
        ParamValue::List(values)
    }
}

impl From<Vec<&str>> for ParamValue {
    fn from(values: Vec<&str>) -> Self {
        ParamValue::List(values.into_iter().map(str::to_string).collect())
    }
}

/// Extra filter/sort parameters merged into normalization.
///
/// Backed by a sorted map, so two logically equal parameter sets always
/// normalize identically regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryParams(BTreeMap<String, ParamValue>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Suppress a parameter that normalization would otherwise inject.
    pub fn suppress(self, key: impl Into<String>) -> Self {
        self.with(key, ParamValue::Null)
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// The requested `expand` depth, when set to an integer.
    pub fn expand_level(&self) -> Option<i64> {
        match self.0.get("expand") {
            Some(ParamValue::Int(n)) => Some(*n),
            Some(ParamValue::Str(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Equality ignoring the `expand` parameter, used by the id loader to
    /// decide whether a cached fetch still covers a new request.
    pub fn compatible_with(&self, other: &QueryParams) -> bool {
        let strip = |params: &QueryParams| {
            let mut map = params.0.clone();
            map.remove("expand");
            map
        };
        strip(self) == strip(other)
    }

    /// Render as a plain query string (sorted keys, no default injection).
    pub fn to_query_string(&self) -> String {
        let mut pairs = BTreeMap::new();
        for (key, value) in &self.0 {
            if let Some(rendered) = value.render() {
                pairs.insert(key.clone(), rendered);
            }
        }
        render_pairs(&pairs)
    }
}

/// Largest id-listing limit that keeps id pages aligned on entity page
/// boundaries: the biggest multiple of `page_size` not exceeding
/// [`MAX_IDS_PER_REQUEST`]. Falls back to `page_size` itself when one entity
/// page already exceeds the ceiling.
pub fn id_page_limit(page_size: u32) -> u32 {
    if page_size == 0 {
        return MAX_IDS_PER_REQUEST;
    }
    if page_size >= MAX_IDS_PER_REQUEST {
        return page_size;
    }
    MAX_IDS_PER_REQUEST - (MAX_IDS_PER_REQUEST % page_size)
}

/// Last valid 1-based page number for a total `count`; `0` when the
/// collection is empty.
pub fn last_page(count: u64, page_size: u32) -> u32 {
    if page_size == 0 {
        return 0;
    }
    count.div_ceil(page_size as u64) as u32
}

/// Build the canonical cache key for `(url, query, page_size)`.
///
/// Any query string already embedded in `url` is folded in first, then the
/// caller's parameters, then the defaults (`from_last`, `order_by`,
/// `expand`, `limit`) for whatever is still absent. Parameters the caller
/// set to [`ParamValue::Null`] are removed last, which lets a caller strike
/// a default entirely.
pub fn normalize(url: &str, query: &QueryParams, page_size: u32) -> String {
    if url.is_empty() {
        return String::new();
    }
    let (base, embedded) = match url.split_once('?') {
        Some((base, embedded)) => (base, embedded),
        None => (url, ""),
    };

    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for pair in embedded.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key.to_string(), value.to_string());
    }

    let mut suppressed = Vec::new();
    for (key, value) in query.iter() {
        match value.render() {
            Some(rendered) => {
                params.insert(key.clone(), rendered);
            }
            None => suppressed.push(key.clone()),
        }
    }

    for (key, value) in [
        ("from_last", "true"),
        ("order_by", "this_meta.created"),
        ("expand", "0"),
    ] {
        params
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    }
    params
        .entry("limit".to_string())
        .or_insert_with(|| id_page_limit(page_size).to_string());

    for key in suppressed {
        params.remove(&key);
    }

    format!("{base}?{}", render_pairs(&params))
}

/// Whether a normalized query orders newest-first. Dictates the direction
/// items shift when inserted or removed.
pub(crate) fn is_from_last(normalized: &str) -> bool {
    normalized.contains("from_last=true")
}

/// Rewrite a normalized query string: apply raw overrides, drop keys.
/// Values in `set` must already be wire-ready.
pub(crate) fn with_params(normalized: &str, set: &[(&str, String)], remove: &[&str]) -> String {
    let (base, embedded) = match normalized.split_once('?') {
        Some((base, embedded)) => (base, embedded),
        None => (normalized, ""),
    };
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for pair in embedded.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(key.to_string(), value.to_string());
    }
    for (key, value) in set {
        params.insert(key.to_string(), value.clone());
    }
    for key in remove {
        params.remove(*key);
    }
    format!("{base}?{}", render_pairs(&params))
}

fn render_pairs(pairs: &BTreeMap<String, String>) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
