//! Target header mapping.
//!
//! Each mapping value is a template where `{{ name }}` is replaced by a
//! signal placeholder. A header whose template references an unknown or
//! missing placeholder is left out.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use twinbridge_core::model::Target;
use twinbridge_core::signal::Signal;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z]+:[A-Za-z0-9_\-]+)\s*\}\}").unwrap());

fn resolve(signal: &Signal, name: &str) -> Option<String> {
    if let Some(header) = name.strip_prefix("header:") {
        return signal.headers().get(header).map(str::to_owned);
    }
    let value = match name {
        "entity:id" | "thing:id" => signal.entity_id(),
        "entity:namespace" | "thing:namespace" => signal.namespace(),
        "entity:name" | "thing:name" => signal.entity_name(),
        "topic:action" => signal.action(),
        "topic:channel" => signal.topic().channel(),
        "topic:criterion" => signal.topic().criterion(),
        "resource:path" => signal.resource_path(),
        _ => return None,
    };
    Some(value.to_owned())
}

/// Render one template, `None` if any placeholder cannot be resolved.
pub fn render(template: &str, signal: &Signal) -> Option<String> {
    let mut missing = false;
    let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        match resolve(signal, &caps[1]) {
            Some(value) => value,
            None => {
                missing = true;
                String::new()
            }
        }
    });
    (!missing).then(|| rendered.into_owned())
}

/// Outbound headers for `target`: the mapped headers plus the correlation id.
pub fn map_headers(target: &Target, signal: &Signal) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if let Some(correlation_id) = signal.headers().correlation_id() {
        headers.insert(twinbridge_core::headers::CORRELATION_ID.to_owned(), correlation_id.to_owned());
    }
    for (name, template) in target.header_mapping() {
        if let Some(value) = render(template, signal) {
            headers.insert(name.clone(), value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use twinbridge_core::headers::Headers;
    use twinbridge_core::model::Topic;

    fn signal() -> Signal {
        Signal::new(Topic::TwinEvents, "org.example:sensor-1")
            .with_action("modified")
            .with_headers(Headers::new().with("content-type", "application/json").with_correlation_id("c-1"))
    }

    #[test]
    fn renders_placeholders() {
        let s = signal();
        assert_eq!(render("{{ entity:id }}", &s).as_deref(), Some("org.example:sensor-1"));
        assert_eq!(render("ns={{entity:namespace}}", &s).as_deref(), Some("ns=org.example"));
        assert_eq!(render("{{ topic:action }}/{{ topic:channel }}", &s).as_deref(), Some("modified/twin"));
        assert_eq!(render("{{ header:content-type }}", &s).as_deref(), Some("application/json"));
        assert_eq!(render("static", &s).as_deref(), Some("static"));
    }

    #[test]
    fn unresolved_placeholder_drops_header() {
        let s = signal();
        assert_eq!(render("{{ header:missing }}", &s), None);
        assert_eq!(render("{{ bogus:thing }}", &s), None);
    }

    #[test]
    fn map_headers_keeps_correlation_id() {
        let target = Target::new("out/a")
            .with_header("device", "{{ entity:name }}")
            .with_header("absent", "{{ header:nope }}");
        let headers = map_headers(&target, &signal());
        assert_eq!(headers.get("device").map(String::as_str), Some("sensor-1"));
        assert_eq!(headers.get("correlation-id").map(String::as_str), Some("c-1"));
        assert!(!headers.contains_key("absent"));
    }
}
