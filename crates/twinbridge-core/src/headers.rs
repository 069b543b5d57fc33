use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::CorrelationId;

pub const CORRELATION_ID: &str = "correlation-id";
pub const DRY_RUN: &str = "dry-run";
pub const IF_MATCH: &str = "if-match";
pub const IF_NONE_MATCH: &str = "if-none-match";

/// Case-insensitive command headers. Keys are stored lower-case.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.0.insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(&key.to_ascii_lowercase())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get(CORRELATION_ID)
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with(CORRELATION_ID, id)
    }

    /// Assign a fresh correlation id unless one is present.
    pub fn ensure_correlation_id(mut self) -> Self {
        if !self.contains(CORRELATION_ID) {
            self.insert(CORRELATION_ID, CorrelationId::new().to_string());
        }
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.get(DRY_RUN).is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    pub fn with_dry_run(self) -> Self {
        self.with(DRY_RUN, "true")
    }

    /// First optimistic-concurrency header present, if any.
    pub fn precondition(&self) -> Option<&'static str> {
        [IF_MATCH, IF_NONE_MATCH].into_iter().find(|h| self.contains(h))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_case_insensitive() {
        let h = Headers::new().with("Correlation-ID", "abc");
        assert_eq!(h.correlation_id(), Some("abc"));
        assert_eq!(h.get("CORRELATION-ID"), Some("abc"));
    }

    #[test]
    fn ensure_correlation_id_keeps_existing() {
        let h = Headers::new().with_correlation_id("keep").ensure_correlation_id();
        assert_eq!(h.correlation_id(), Some("keep"));

        let fresh = Headers::new().ensure_correlation_id();
        assert!(fresh.correlation_id().unwrap().starts_with("corr_"));
    }

    #[test]
    fn dry_run_flag() {
        assert!(!Headers::new().is_dry_run());
        assert!(Headers::new().with_dry_run().is_dry_run());
        assert!(!Headers::new().with(DRY_RUN, "false").is_dry_run());
    }

    #[test]
    fn precondition_detection() {
        assert_eq!(Headers::new().precondition(), None);
        assert_eq!(Headers::new().with("If-None-Match", "*").precondition(), Some(IF_NONE_MATCH));
        assert_eq!(Headers::new().with(IF_MATCH, "rev:3").precondition(), Some(IF_MATCH));
    }

    #[test]
    fn collects_from_pairs() {
        let h: Headers = [("A", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(h.len(), 2);
        assert_eq!(h.get("a"), Some("1"));
    }
}
