use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::headers::Headers;
use crate::model::Topic;
use crate::predicate::EvaluationContext;

/// One outbound domain event considered for routing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    topic: Topic,
    entity_id: String,
    namespace: String,
    #[serde(default)]
    action: String,
    #[serde(default = "root_path")]
    resource_path: String,
    #[serde(default)]
    read_subjects: BTreeSet<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    headers: Headers,
}

fn root_path() -> String {
    "/".to_owned()
}

impl Signal {
    /// The namespace is the part of `entity_id` before the first `:`.
    pub fn new(topic: Topic, entity_id: impl Into<String>) -> Self {
        let entity_id = entity_id.into();
        let namespace = entity_id
            .split_once(':')
            .map(|(ns, _)| ns.to_owned())
            .unwrap_or_default();
        Self {
            topic,
            entity_id,
            namespace,
            action: String::new(),
            resource_path: root_path(),
            read_subjects: BTreeSet::new(),
            payload: Value::Null,
            headers: Headers::new(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_resource_path(mut self, path: impl Into<String>) -> Self {
        self.resource_path = path.into();
        self
    }

    pub fn with_read_subject(mut self, subject: impl Into<String>) -> Self {
        self.read_subjects.insert(subject.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn entity_name(&self) -> &str {
        self.entity_id
            .split_once(':')
            .map_or(self.entity_id.as_str(), |(_, name)| name)
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    pub fn read_subjects(&self) -> &BTreeSet<String> {
        &self.read_subjects
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Payload fields plus `topic:*`, `resource:path` and `entity:*` placeholders.
    pub fn evaluation_context(&self) -> EvaluationContext<'_> {
        EvaluationContext::new(&self.payload)
            .with_placeholder("topic:namespace", self.namespace.clone())
            .with_placeholder("topic:entity-name", self.entity_name().to_owned())
            .with_placeholder("topic:channel", self.topic.channel())
            .with_placeholder("topic:criterion", self.topic.criterion())
            .with_placeholder("topic:action", self.action.clone())
            .with_placeholder("resource:path", self.resource_path.clone())
            .with_placeholder("entity:id", self.entity_id.clone())
    }
}
