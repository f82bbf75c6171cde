//! Pod state to `AppStatus` mapping.
//!
//! Default table, evaluated top to bottom:
//!
//! | Pod state                                   | Status    |
//! |---------------------------------------------|-----------|
//! | deletion timestamp set / DELETED event      | `Deleted` |
//! | phase `Failed`                              | `Failed`  |
//! | phase `Running`, `Ready=True`               | `Running` |
//! | phase `Running`, not ready                  | `Pending` |
//! | phase `Pending`                             | `Pending` |
//! | phase `Unknown`                             | `Unknown` |
//! | anything else                               | `Error` (anomaly) |
//!
//! A `StatusPolicy` can add phase overrides and, when enabled, translate
//! container waiting/terminated reasons. Deletion always wins.

use crate::pod_event::{PodEvent, PodState};
use app_status_client::AppStatus;
use std::collections::BTreeMap;
use std::fmt;

/// Container reasons translated when reason translation is enabled
pub const DEFAULT_REASON_MAP: [(&str, AppStatus); 4] = [
    ("CrashLoopBackOff", AppStatus::Error),
    ("ErrImagePull", AppStatus::Error),
    ("ImagePullBackOff", AppStatus::Error),
    ("PostStartHookError", AppStatus::Error),
];

/// Configurable mapping rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Pod phase -> status, consulted before the default table
    pub phase_overrides: BTreeMap<String, AppStatus>,
    /// Container reason -> status
    pub reason_map: BTreeMap<String, AppStatus>,
    /// Apply `reason_map`
    pub translate_reasons: bool,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            phase_overrides: BTreeMap::new(),
            reason_map: DEFAULT_REASON_MAP
                .iter()
                .map(|(reason, status)| ((*reason).to_string(), *status))
                .collect(),
            translate_reasons: false,
        }
    }
}

/// Pod state the default table does not cover
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingAnomaly {
    MissingPhase,
    UnrecognizedPhase(String),
}

impl fmt::Display for MappingAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingAnomaly::MissingPhase => write!(f, "pod has no phase"),
            MappingAnomaly::UnrecognizedPhase(phase) => write!(f, "unrecognized pod phase '{}'", phase),
        }
    }
}

/// Result of mapping, with the rule that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapped {
    pub status: AppStatus,
    pub anomaly: Option<MappingAnomaly>,
    /// Container reason that was translated, if any
    pub translated_reason: Option<String>,
}

impl Mapped {
    fn plain(status: AppStatus) -> Self {
        Self {
            status,
            anomaly: None,
            translated_reason: None,
        }
    }
}

/// Pure, total mapping from pod state to `AppStatus`
#[derive(Debug, Clone, Default)]
pub struct StatusMapper {
    policy: StatusPolicy,
}

impl StatusMapper {
    pub fn new(policy: StatusPolicy) -> Self {
        Self { policy }
    }

    /// Map a pod state to a status
    #[cfg(test)]
    pub fn map(&self, state: &PodState) -> AppStatus {
        self.evaluate(state).status
    }

    /// Map a whole event; a DELETED notification is always `Deleted`.
    pub fn map_event(&self, event: &PodEvent) -> Mapped {
        if event.is_terminating() {
            return Mapped::plain(AppStatus::Deleted);
        }
        self.evaluate(&event.state)
    }

    /// Map a pod state, reporting anomalies and translated reasons
    pub fn evaluate(&self, state: &PodState) -> Mapped {
        if state.deletion_timestamp.is_some() {
            return Mapped::plain(AppStatus::Deleted);
        }

        if self.policy.translate_reasons {
            if let Some((reason, status)) = state
                .noteworthy_container()
                .and_then(|c| c.reason.as_deref())
                .and_then(|reason| self.policy.reason_map.get(reason).map(|s| (reason, *s)))
            {
                return Mapped {
                    status,
                    anomaly: None,
                    translated_reason: Some(reason.to_string()),
                };
            }
        }

        let Some(phase) = state.phase.as_deref() else {
            return Mapped {
                status: AppStatus::Error,
                anomaly: Some(MappingAnomaly::MissingPhase),
                translated_reason: None,
            };
        };

        if let Some(status) = self.policy.phase_overrides.get(phase) {
            return Mapped::plain(*status);
        }

        match phase {
            "Failed" => Mapped::plain(AppStatus::Failed),
            "Running" if state.is_ready() => Mapped::plain(AppStatus::Running),
            "Running" | "Pending" => Mapped::plain(AppStatus::Pending),
            "Unknown" => Mapped::plain(AppStatus::Unknown),
            other => Mapped {
                status: AppStatus::Error,
                anomaly: Some(MappingAnomaly::UnrecognizedPhase(other.to_string())),
                translated_reason: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod_event::{Condition, ContainerPhase, ContainerSnapshot, EventKind};
    use crate::test_utils::{event_from_json, pod_json, time};

    fn state(phase: Option<&str>, ready: Option<bool>, deleting: bool) -> PodState {
        PodState {
            phase: phase.map(str::to_string),
            conditions: ready
                .map(|r| Condition {
                    kind: "Ready".to_string(),
                    status: if r { "True" } else { "False" }.to_string(),
                })
                .into_iter()
                .collect(),
            deletion_timestamp: deleting.then(|| time("2025-01-01T00:05:00Z")),
            containers: Vec::new(),
        }
    }

    fn waiting(reason: &str) -> ContainerSnapshot {
        ContainerSnapshot {
            name: "app".to_string(),
            init: false,
            phase: ContainerPhase::Waiting,
            reason: Some(reason.to_string()),
            message: None,
        }
    }

    #[test]
    fn test_default_table() {
        let mapper = StatusMapper::default();
        let cases = [
            (state(Some("Running"), Some(true), true), AppStatus::Deleted),
            (state(Some("Pending"), None, true), AppStatus::Deleted),
            (state(Some("Failed"), None, false), AppStatus::Failed),
            (state(Some("Running"), Some(true), false), AppStatus::Running),
            (state(Some("Running"), Some(false), false), AppStatus::Pending),
            (state(Some("Running"), None, false), AppStatus::Pending),
            (state(Some("Pending"), Some(false), false), AppStatus::Pending),
            (state(Some("Unknown"), None, false), AppStatus::Unknown),
            (state(Some("Succeeded"), None, false), AppStatus::Error),
            (state(Some("Bogus"), None, false), AppStatus::Error),
            (state(None, None, false), AppStatus::Error),
        ];

        for (input, expected) in cases {
            assert_eq!(mapper.map(&input), expected, "mapping {:?}", input);
        }
    }

    #[test]
    fn test_anomalies_are_reported() {
        let mapper = StatusMapper::default();
        let mapped = mapper.evaluate(&state(Some("Succeeded"), None, false));
        assert_eq!(mapped.status, AppStatus::Error);
        assert_eq!(
            mapped.anomaly,
            Some(MappingAnomaly::UnrecognizedPhase("Succeeded".to_string()))
        );

        let mapped = mapper.evaluate(&state(None, None, false));
        assert_eq!(mapped.anomaly, Some(MappingAnomaly::MissingPhase));

        let mapped = mapper.evaluate(&state(Some("Running"), Some(true), false));
        assert_eq!(mapped.anomaly, None);
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let mapper = StatusMapper::default();
        let input = state(Some("Running"), Some(true), false);
        assert_eq!(mapper.evaluate(&input), mapper.evaluate(&input));
    }

    #[test]
    fn test_phase_override() {
        let mut policy = StatusPolicy::default();
        policy.phase_overrides.insert("Succeeded".to_string(), AppStatus::Deleted);
        let mapper = StatusMapper::new(policy);

        assert_eq!(mapper.map(&state(Some("Succeeded"), None, false)), AppStatus::Deleted);
        // Unlisted phases still fall through to Error
        assert_eq!(mapper.map(&state(Some("Bogus"), None, false)), AppStatus::Error);
    }

    #[test]
    fn test_override_cannot_beat_deletion() {
        let mut policy = StatusPolicy::default();
        policy.phase_overrides.insert("Running".to_string(), AppStatus::Running);
        let mapper = StatusMapper::new(policy);

        assert_eq!(mapper.map(&state(Some("Running"), Some(true), true)), AppStatus::Deleted);
    }

    #[test]
    fn test_reason_translation_only_when_enabled() {
        let mut input = state(Some("Running"), Some(false), false);
        input.containers.push(waiting("CrashLoopBackOff"));

        let disabled = StatusMapper::default();
        assert_eq!(disabled.map(&input), AppStatus::Pending);

        let enabled = StatusMapper::new(StatusPolicy {
            translate_reasons: true,
            ..Default::default()
        });
        let mapped = enabled.evaluate(&input);
        assert_eq!(mapped.status, AppStatus::Error);
        assert_eq!(mapped.translated_reason.as_deref(), Some("CrashLoopBackOff"));

        // Unlisted reasons fall back to the phase table
        let mut creating = state(Some("Pending"), Some(false), false);
        creating.containers.push(waiting("ContainerCreating"));
        assert_eq!(enabled.map(&creating), AppStatus::Pending);
    }

    #[test]
    fn test_deleted_event_maps_to_deleted() {
        let event = event_from_json(
            EventKind::Deleted,
            pod_json("p", Some("r"), "Running", true, "2025-01-01T00:00:00Z"),
        );
        assert_eq!(StatusMapper::default().map_event(&event).status, AppStatus::Deleted);
    }
}
