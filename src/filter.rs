//! Subscription filter construction.

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::event::Event;

/// A NIP-01 subscription filter.
///
/// Serializes to the exact JSON filter object relays expect: tag filters are
/// emitted as `#p`/`#e`/`#d`/`#t` arrays, everything unset is omitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Event ids to match.
    pub ids: Option<Vec<String>>,
    /// Author public keys to match.
    pub authors: Option<Vec<String>>,
    /// Kind numbers to match.
    pub kinds: Option<Vec<u32>>,
    /// `#p` tag values to match.
    pub p: Option<Vec<String>>,
    /// `#e` tag values to match.
    pub e: Option<Vec<String>>,
    /// `#d` tag values to match.
    pub d: Option<Vec<String>>,
    /// `#t` tag values to match.
    pub t: Option<Vec<String>>,
    /// Inclusive lower creation-timestamp bound.
    pub since: Option<u64>,
    /// Inclusive upper creation-timestamp bound.
    pub until: Option<u64>,
    /// Maximum stored results the relay should return.
    pub limit: Option<usize>,
    /// Free-text search (NIP-50), honored only by search-capable relays.
    pub search: Option<String>,
}

impl Filter {
    /// Empty filter; chain builder methods to narrow it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match the given event ids.
    pub fn ids<I: Into<String>>(mut self, ids: impl IntoIterator<Item = I>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Match the given authors.
    pub fn authors<I: Into<String>>(mut self, authors: impl IntoIterator<Item = I>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Match the given kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Match events carrying one of the given `p` tags.
    pub fn tag_p<I: Into<String>>(mut self, values: impl IntoIterator<Item = I>) -> Self {
        self.p = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Match events carrying one of the given `e` tags.
    pub fn tag_e<I: Into<String>>(mut self, values: impl IntoIterator<Item = I>) -> Self {
        self.e = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Match events carrying one of the given `d` tags.
    pub fn tag_d<I: Into<String>>(mut self, values: impl IntoIterator<Item = I>) -> Self {
        self.d = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Match events carrying one of the given `t` tags.
    pub fn tag_t<I: Into<String>>(mut self, values: impl IntoIterator<Item = I>) -> Self {
        self.t = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Only events created at or after `ts`.
    pub fn since(mut self, ts: u64) -> Self {
        self.since = Some(ts);
        self
    }

    /// Only events created at or before `ts`.
    pub fn until(mut self, ts: u64) -> Self {
        self.until = Some(ts);
        self
    }

    /// Cap the number of stored results.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Free-text search term.
    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    /// Whether an event conforms to this filter.
    ///
    /// Relays are trusted to apply filters server-side, but a non-conforming
    /// relay can slip unrelated records into a subscription; conformance is
    /// re-checked client-side before a record enters aggregation. `limit` is
    /// a per-relay serving hint and `search` is relay-defined, so neither is
    /// checked here.
    pub fn matches(&self, ev: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| *id == ev.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == ev.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&ev.kind) {
                return false;
            }
        }
        for (wanted, tag) in [(&self.p, "p"), (&self.e, "e"), (&self.d, "d"), (&self.t, "t")] {
            if let Some(wanted) = wanted {
                if !ev.tag_values(tag).any(|v| wanted.iter().any(|w| w == v)) {
                    return false;
                }
            }
        }
        if self.since.map_or(false, |ts| ev.created_at < ts) {
            return false;
        }
        if self.until.map_or(false, |ts| ev.created_at > ts) {
            return false;
        }
        true
    }

    /// Build the wire JSON object.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        let strings = |v: &Vec<String>| {
            Value::Array(v.iter().map(|s| Value::String(s.clone())).collect())
        };
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), strings(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), strings(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert(
                "kinds".into(),
                Value::Array(kinds.iter().map(|k| Value::Number((*k).into())).collect()),
            );
        }
        if let Some(p) = &self.p {
            map.insert("#p".into(), strings(p));
        }
        if let Some(e) = &self.e {
            map.insert("#e".into(), strings(e));
        }
        if let Some(d) = &self.d {
            map.insert("#d".into(), strings(d));
        }
        if let Some(t) = &self.t {
            map.insert("#t".into(), strings(t));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::Number(since.into()));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::Number(until.into()));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::Number((limit as u64).into()));
        }
        if let Some(search) = &self.search {
            map.insert("search".into(), Value::String(search.clone()));
        }
        Value::Object(map)
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
