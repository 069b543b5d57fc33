//! Predicate seam for subscription filters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Fields and placeholders a filter is evaluated against.
#[derive(Clone, Debug)]
pub struct EvaluationContext<'a> {
    fields: &'a Value,
    placeholders: BTreeMap<&'static str, String>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(fields: &'a Value) -> Self {
        Self {
            fields,
            placeholders: BTreeMap::new(),
        }
    }

    pub fn with_placeholder(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.placeholders.insert(name, value.into());
        self
    }

    /// Look up a slash-separated field path, e.g. `attributes/test`.
    pub fn field(&self, path: &str) -> Option<&'a Value> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Some(self.fields);
        }
        self.fields.pointer(&format!("/{trimmed}"))
    }

    /// Look up a placeholder such as `topic:action`.
    pub fn placeholder(&self, name: &str) -> Option<&str> {
        self.placeholders.get(name).map(String::as_str)
    }
}

/// Compiled boolean filter.
pub trait Predicate: Send + Sync + fmt::Debug {
    fn evaluate(&self, context: &EvaluationContext<'_>) -> bool;
}

/// Turns a filter expression into a [`Predicate`].
pub trait PredicateCompiler: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Arc<dyn Predicate>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lookup_by_path() {
        let payload = serde_json::json!({"attributes": {"test": 42}, "thingId": "ns:t"});
        let ctx = EvaluationContext::new(&payload);
        assert_eq!(ctx.field("attributes/test"), Some(&serde_json::json!(42)));
        assert_eq!(ctx.field("/thingId"), Some(&serde_json::json!("ns:t")));
        assert_eq!(ctx.field("attributes/missing"), None);
    }

    #[test]
    fn placeholder_lookup() {
        let payload = Value::Null;
        let ctx = EvaluationContext::new(&payload).with_placeholder("topic:action", "modified");
        assert_eq!(ctx.placeholder("topic:action"), Some("modified"));
        assert_eq!(ctx.placeholder("topic:channel"), None);
    }
}
