use crate::{Change, Document, LogRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata for a function deployed on the cluster, including the worker it is assigned to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FunctionMeta {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
    pub worker_id: String,
    pub input_topics: Vec<String>,
    pub input_topic_regex: String,
    pub sink_topic: String,
    pub log_topic: String,
    pub auto_ack: bool,
    pub parallelism: i32,
}

/// An event on the function metadata topic, published by the function workers' leader whenever
/// a function is (re)assigned or removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FunctionEvent {
    pub request_type: RequestType,
    pub worker_id: String,
    pub function: FunctionDetails,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Initialize,
    #[default]
    Update,
    Delete,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FunctionDetails {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
    pub source: SourceSpec,
    pub sink: SinkSpec,
    pub log_topic: String,
    pub auto_ack: bool,
    pub parallelism: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceSpec {
    /// Input topics, keyed by topic name.
    pub input_specs: BTreeMap<String, serde_json::Value>,
    pub topics_pattern: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SinkSpec {
    pub topic: String,
}

/// Builds the store key for a function.
pub fn function_key(tenant: &str, namespace: &str, name: &str) -> String {
    format!("{tenant}/{namespace}/{name}")
}

// === impl FunctionMeta ===

impl Document for FunctionMeta {
    fn key(&self) -> String {
        function_key(&self.tenant, &self.namespace, &self.name)
    }
}

// === impl FunctionEvent ===

impl LogRecord for FunctionEvent {
    type Document = FunctionMeta;

    fn into_change(self) -> Change<FunctionMeta> {
        let Self {
            request_type,
            worker_id,
            function,
        } = self;

        if request_type == RequestType::Delete {
            return Change::Tombstone(function_key(
                &function.tenant,
                &function.namespace,
                &function.name,
            ));
        }

        let FunctionDetails {
            tenant,
            namespace,
            name,
            source,
            sink,
            log_topic,
            auto_ack,
            parallelism,
        } = function;
        let mut input_topics = source.input_specs.into_keys().collect::<Vec<_>>();
        if !source.topics_pattern.is_empty() {
            input_topics.push(source.topics_pattern.clone());
        }

        Change::Upsert(FunctionMeta {
            tenant,
            namespace,
            name,
            worker_id,
            input_topics,
            input_topic_regex: source.topics_pattern,
            sink_topic: sink.topic,
            log_topic,
            auto_ack,
            parallelism,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn update_events_become_upserts() {
        let event: FunctionEvent = serde_json::from_str(
            r#"{
                "requestType": "update",
                "workerId": "worker-2",
                "function": {
                    "tenant": "acme",
                    "namespace": "ingest",
                    "name": "enrich",
                    "source": {
                        "inputSpecs": {"persistent://acme/ingest/b": {}, "persistent://acme/ingest/a": {}},
                        "topicsPattern": "persistent://acme/ingest/raw-.*"
                    },
                    "sink": {"topic": "persistent://acme/ingest/out"},
                    "logTopic": "persistent://acme/ingest/log",
                    "autoAck": true,
                    "parallelism": 3
                }
            }"#,
        )
        .unwrap();

        assert_eq!(
            event.into_change(),
            Change::Upsert(FunctionMeta {
                tenant: "acme".to_string(),
                namespace: "ingest".to_string(),
                name: "enrich".to_string(),
                worker_id: "worker-2".to_string(),
                input_topics: vec![
                    "persistent://acme/ingest/a".to_string(),
                    "persistent://acme/ingest/b".to_string(),
                    "persistent://acme/ingest/raw-.*".to_string(),
                ],
                input_topic_regex: "persistent://acme/ingest/raw-.*".to_string(),
                sink_topic: "persistent://acme/ingest/out".to_string(),
                log_topic: "persistent://acme/ingest/log".to_string(),
                auto_ack: true,
                parallelism: 3,
            })
        );
    }

    #[test]
    fn delete_events_become_tombstones() {
        let event = FunctionEvent {
            request_type: RequestType::Delete,
            function: FunctionDetails {
                tenant: "acme".to_string(),
                namespace: "ingest".to_string(),
                name: "enrich".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            event.into_change(),
            Change::Tombstone("acme/ingest/enrich".to_string())
        );
    }

    #[test]
    fn keys_do_not_collide_across_segments() {
        assert_ne!(function_key("ab", "c", "d"), function_key("a", "bc", "d"));
    }
}
