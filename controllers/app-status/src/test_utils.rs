//! Test utilities for unit testing the mapper, index and reconciler
//!
//! This module provides helpers for creating pod fixtures. Pods are built
//! from JSON so fixtures read like the manifests the API server returns.

#[cfg(test)]
use crate::pod_event::{EventKind, PodEvent};
#[cfg(test)]
use crate::watcher::{PodSnapshot, PodSource, SourceEvent, WatchError};
#[cfg(test)]
use futures::stream::BoxStream;
#[cfg(test)]
use futures::StreamExt;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use k8s_openapi::api::core::v1::Pod;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
#[cfg(test)]
use serde_json::{json, Value};

/// Helper to create a pod manifest in namespace `default`
///
/// The pod runs a single `ghcr.io/example/shiny-app:1.0` container and, when
/// `release` is given, carries the `release` label.
#[cfg(test)]
pub fn pod_json(name: &str, release: Option<&str>, phase: &str, ready: bool, created: &str) -> Value {
    let mut labels = json!({ "type": "app" });
    if let Some(release) = release {
        labels["release"] = json!(release);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": "default",
            "resourceVersion": "1",
            "creationTimestamp": created,
            "labels": labels
        },
        "spec": {
            "containers": [{ "name": "app", "image": "ghcr.io/example/shiny-app:1.0" }]
        },
        "status": {
            "phase": phase,
            "conditions": [{
                "type": "Ready",
                "status": if ready { "True" } else { "False" }
            }]
        }
    })
}

/// Mark a manifest as terminating
#[cfg(test)]
pub fn with_deletion(mut value: Value, at: &str) -> Value {
    value["metadata"]["deletionTimestamp"] = json!(at);
    value
}

/// Replace the container image
#[cfg(test)]
pub fn with_image(mut value: Value, image: &str) -> Value {
    value["spec"]["containers"][0]["image"] = json!(image);
    value
}

/// Set a label
#[cfg(test)]
pub fn with_label(mut value: Value, key: &str, label: &str) -> Value {
    value["metadata"]["labels"][key] = json!(label);
    value
}

/// Set the resource version
#[cfg(test)]
pub fn with_resource_version(mut value: Value, rv: &str) -> Value {
    value["metadata"]["resourceVersion"] = json!(rv);
    value
}

/// Helper to deserialize a manifest into a `Pod`
#[cfg(test)]
pub fn pod_from_json(value: Value) -> Pod {
    serde_json::from_value(value).expect("valid pod fixture")
}

/// Helper to build a `PodEvent` straight from a manifest
#[cfg(test)]
pub fn event_from_json(kind: EventKind, value: Value) -> PodEvent {
    PodEvent::from_pod(kind, &pod_from_json(value)).expect("complete pod fixture")
}

/// Helper to parse an RFC 3339 timestamp
#[cfg(test)]
pub fn time(rfc3339: &str) -> Time {
    serde_json::from_value(json!(rfc3339)).expect("valid timestamp")
}

/// Scripted watch stream: `Ok(items)` is replayed then closed, `Err` fails the call
#[cfg(test)]
pub type WatchScript = Result<Vec<Result<SourceEvent, WatchError>>, WatchError>;

/// `PodSource` that replays scripted lists and watch streams.
///
/// Once a script is exhausted, `list` blocks forever and `watch` returns a
/// stream that never yields, so tests end by cancelling the watcher.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct ScriptedSource {
    lists: Arc<Mutex<VecDeque<Result<PodSnapshot, WatchError>>>>,
    watches: Arc<Mutex<VecDeque<WatchScript>>>,
    watch_calls: Arc<Mutex<Vec<String>>>,
}

#[cfg(test)]
impl ScriptedSource {
    pub fn push_list(&self, list: Result<PodSnapshot, WatchError>) {
        self.lists.lock().unwrap().push_back(list);
    }

    pub fn push_watch(&self, watch: WatchScript) {
        self.watches.lock().unwrap().push_back(watch);
    }

    /// Resource versions passed to `watch`, in order
    pub fn watch_calls(&self) -> Vec<String> {
        self.watch_calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl PodSource for ScriptedSource {
    async fn list(&self) -> Result<PodSnapshot, WatchError> {
        let next = self.lists.lock().unwrap().pop_front();
        match next {
            Some(list) => list,
            None => futures::future::pending().await,
        }
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<SourceEvent, WatchError>>, WatchError> {
        self.watch_calls.lock().unwrap().push(resource_version.to_string());
        let next = self.watches.lock().unwrap().pop_front();
        match next {
            Some(Ok(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(Err(e)) => Err(e),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}
