//! Pod lifecycle events.
//!
//! A `PodEvent` is the controller's immutable view of one watch notification.
//! It is built from a `Pod` exactly once; a pod missing its name, namespace,
//! resource version or status block is rejected here and never reaches the
//! status mapper.

use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Label holding the application instance id
pub const RELEASE_LABEL: &str = "release";

/// Kind of watch notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => write!(f, "ADDED"),
            EventKind::Modified => write!(f, "MODIFIED"),
            EventKind::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Pod conversion errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PodEventError {
    /// A field required to identify or map the pod is absent
    #[error("pod object is missing {0}")]
    Missing(&'static str),
}

/// A pod condition (`type` / `status` pair)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub kind: String,
    pub status: String,
}

/// Which state a container is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    Waiting,
    Running,
    Terminated,
}

/// Reason and message of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSnapshot {
    pub name: String,
    /// Init container
    pub init: bool,
    pub phase: ContainerPhase,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ContainerSnapshot {
    fn from_status(status: &ContainerStatus, init: bool) -> Option<Self> {
        let state = status.state.as_ref()?;

        let (phase, reason, message) = if let Some(waiting) = &state.waiting {
            (ContainerPhase::Waiting, waiting.reason.clone(), waiting.message.clone())
        } else if let Some(terminated) = &state.terminated {
            (ContainerPhase::Terminated, terminated.reason.clone(), terminated.message.clone())
        } else if state.running.is_some() {
            (ContainerPhase::Running, None, None)
        } else {
            return None;
        };

        Some(Self {
            name: status.name.clone(),
            init,
            phase,
            reason,
            message,
        })
    }

    /// Waiting or terminated, excluding init containers that completed normally
    fn is_noteworthy(&self) -> bool {
        match self.phase {
            ContainerPhase::Running => false,
            ContainerPhase::Waiting => true,
            ContainerPhase::Terminated => {
                !(self.init && self.reason.as_deref() == Some("Completed"))
            }
        }
    }
}

/// The part of a pod the status mapper looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodState {
    pub phase: Option<String>,
    pub conditions: Vec<Condition>,
    pub deletion_timestamp: Option<Time>,
    /// Init containers first, then app containers
    pub containers: Vec<ContainerSnapshot>,
}

impl PodState {
    /// Whether the `Ready` condition is `True`
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }

    /// First waiting/terminated container worth reporting
    pub fn noteworthy_container(&self) -> Option<&ContainerSnapshot> {
        self.containers.iter().find(|c| c.is_noteworthy())
    }
}

/// One pod watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: EventKind,
    pub pod_name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub state: PodState,
    pub resource_version: String,
    pub creation_timestamp: Option<Time>,
    pub images: Vec<String>,
    /// Pod-level `status.message`
    pub pod_message: Option<String>,
}

impl PodEvent {
    /// Convert a pod into an event, rejecting incomplete objects.
    pub fn from_pod(kind: EventKind, pod: &Pod) -> Result<Self, PodEventError> {
        let meta = &pod.metadata;
        let pod_name = meta.name.clone().ok_or(PodEventError::Missing("metadata.name"))?;
        let namespace = meta
            .namespace
            .clone()
            .ok_or(PodEventError::Missing("metadata.namespace"))?;
        let resource_version = meta
            .resource_version
            .clone()
            .ok_or(PodEventError::Missing("metadata.resourceVersion"))?;
        let status = pod.status.as_ref().ok_or(PodEventError::Missing("status"))?;

        let conditions = status
            .conditions
            .iter()
            .flatten()
            .map(|c| Condition {
                kind: c.type_.clone(),
                status: c.status.clone(),
            })
            .collect();

        let init = status
            .init_container_statuses
            .iter()
            .flatten()
            .filter_map(|s| ContainerSnapshot::from_status(s, true));
        let app = status
            .container_statuses
            .iter()
            .flatten()
            .filter_map(|s| ContainerSnapshot::from_status(s, false));
        let containers = init.chain(app).collect();

        let images = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .filter_map(|c| c.image.clone())
            .collect();

        Ok(Self {
            kind,
            pod_name,
            namespace,
            labels: meta.labels.clone().unwrap_or_default(),
            state: PodState {
                phase: status.phase.clone(),
                conditions,
                deletion_timestamp: meta.deletion_timestamp.clone(),
                containers,
            },
            resource_version,
            creation_timestamp: meta.creation_timestamp.clone(),
            images,
            pod_message: status.message.clone(),
        })
    }

    /// `release` label, falling back to the pod name
    pub fn app_instance_id(&self) -> &str {
        self.labels
            .get(RELEASE_LABEL)
            .filter(|release| !release.is_empty())
            .map_or(self.pod_name.as_str(), String::as_str)
    }

    /// `namespace/name` for log lines
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.pod_name)
    }

    /// Pod is terminating or gone
    pub fn is_terminating(&self) -> bool {
        self.kind == EventKind::Deleted || self.state.deletion_timestamp.is_some()
    }

    /// Message of the first noteworthy container
    pub fn container_message(&self) -> Option<&str> {
        self.state
            .noteworthy_container()
            .and_then(|c| c.message.as_deref().or(c.reason.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{pod_json, pod_from_json};
    use serde_json::json;

    #[test]
    fn test_from_pod_extracts_fields() {
        let pod = pod_from_json(pod_json(
            "app-123-7c9f",
            Some("app-123"),
            "Running",
            true,
            "2025-01-01T00:00:00Z",
        ));

        let event = PodEvent::from_pod(EventKind::Modified, &pod).unwrap();

        assert_eq!(event.pod_name, "app-123-7c9f");
        assert_eq!(event.namespace, "default");
        assert_eq!(event.app_instance_id(), "app-123");
        assert_eq!(event.state.phase.as_deref(), Some("Running"));
        assert!(event.state.is_ready());
        assert_eq!(event.images, vec!["ghcr.io/example/shiny-app:1.0".to_string()]);
        assert!(event.creation_timestamp.is_some());
        assert!(!event.is_terminating());
    }

    #[test]
    fn test_app_instance_id_falls_back_to_pod_name() {
        let pod = pod_from_json(pod_json("lonely-pod", None, "Pending", false, "2025-01-01T00:00:00Z"));
        let event = PodEvent::from_pod(EventKind::Added, &pod).unwrap();
        assert_eq!(event.app_instance_id(), "lonely-pod");
    }

    #[test]
    fn test_incomplete_pods_are_rejected() {
        let mut value = pod_json("p", Some("r"), "Running", true, "2025-01-01T00:00:00Z");
        value["metadata"].as_object_mut().unwrap().remove("resourceVersion");
        let result = PodEvent::from_pod(EventKind::Added, &pod_from_json(value));
        assert_eq!(result, Err(PodEventError::Missing("metadata.resourceVersion")));

        let mut value = pod_json("p", Some("r"), "Running", true, "2025-01-01T00:00:00Z");
        value.as_object_mut().unwrap().remove("status");
        let result = PodEvent::from_pod(EventKind::Added, &pod_from_json(value));
        assert_eq!(result, Err(PodEventError::Missing("status")));

        let mut value = pod_json("p", Some("r"), "Running", true, "2025-01-01T00:00:00Z");
        value["metadata"].as_object_mut().unwrap().remove("namespace");
        let result = PodEvent::from_pod(EventKind::Added, &pod_from_json(value));
        assert_eq!(result, Err(PodEventError::Missing("metadata.namespace")));
    }

    #[test]
    fn test_container_message_skips_completed_init_containers() {
        let mut value = pod_json("p", Some("r"), "Pending", false, "2025-01-01T00:00:00Z");
        value["status"]["initContainerStatuses"] = json!([{
            "name": "init-permissions",
            "image": "busybox",
            "imageID": "",
            "ready": true,
            "restartCount": 0,
            "state": { "terminated": { "exitCode": 0, "reason": "Completed" } }
        }]);
        value["status"]["containerStatuses"] = json!([{
            "name": "app",
            "image": "ghcr.io/example/shiny-app:1.0",
            "imageID": "",
            "ready": false,
            "restartCount": 3,
            "state": { "waiting": { "reason": "CrashLoopBackOff", "message": "back-off 40s restarting failed container" } }
        }]);

        let event = PodEvent::from_pod(EventKind::Modified, &pod_from_json(value)).unwrap();

        assert_eq!(event.state.containers.len(), 2);
        assert!(event.state.containers[0].init);
        assert_eq!(
            event.container_message(),
            Some("back-off 40s restarting failed container")
        );
        assert_eq!(
            event.state.noteworthy_container().and_then(|c| c.reason.as_deref()),
            Some("CrashLoopBackOff")
        );
    }

    #[test]
    fn test_deleted_event_is_terminating() {
        let pod = pod_from_json(pod_json("p", Some("r"), "Running", true, "2025-01-01T00:00:00Z"));
        let event = PodEvent::from_pod(EventKind::Deleted, &pod).unwrap();
        assert!(event.is_terminating());
        assert_eq!(event.kind.to_string(), "DELETED");
    }
}
