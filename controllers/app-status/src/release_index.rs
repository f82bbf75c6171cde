//! Per-release pod index.
//!
//! During a rolling update a release briefly has two pods: the new one coming
//! up and the old one terminating. Both emit events; only the newest live pod
//! may speak for the release, and `Deleted` is only reported once no other
//! live pod of the release remains.
//!
//! A re-list after an expired watch can miss DELETED events. `prune` drops
//! pods the list no longer returns and hands back a synthetic DELETED event
//! for every release left without pods.

use crate::pod_event::{EventKind, PodEvent};
use app_status_client::AppStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct PodEntry {
    creation: Option<Time>,
    terminating: bool,
    /// Most recent event seen for the pod
    last: PodEvent,
}

/// Whether an event may be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// A newer live pod of the same release exists
    Superseded { newer_pod: String },
    /// `Deleted` while other live pods of the release remain
    SiblingsAlive { live: usize },
}

/// Live pods per `app_instance_id`
#[derive(Debug, Default)]
pub struct ReleaseIndex {
    releases: HashMap<String, BTreeMap<String, PodEntry>>,
}

impl ReleaseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` and decide whether its `status` should be published.
    ///
    /// DELETED events drop the pod from the index after evaluation.
    pub fn admit(&mut self, event: &PodEvent, status: AppStatus) -> Admission {
        let id = event.app_instance_id().to_string();
        let pods = self.releases.entry(id.clone()).or_default();

        let entry = pods.entry(event.pod_name.clone()).or_insert_with(|| PodEntry {
            creation: None,
            terminating: false,
            last: event.clone(),
        });
        if event.creation_timestamp.is_some() {
            entry.creation = event.creation_timestamp.clone();
        }
        entry.terminating = event.is_terminating();
        entry.last = event.clone();
        let creation = entry.creation.clone();

        let newer_pod = creation.as_ref().and_then(|created| {
            pods.iter()
                .filter(|(name, other)| *name != &event.pod_name && !other.terminating)
                .find(|(_, other)| other.creation.as_ref().is_some_and(|c| c > created))
                .map(|(name, _)| name.clone())
        });

        let admission = if let Some(newer_pod) = newer_pod {
            Admission::Superseded { newer_pod }
        } else if status == AppStatus::Deleted {
            let live = pods
                .iter()
                .filter(|(name, other)| *name != &event.pod_name && !other.terminating)
                .count();
            if live > 0 {
                Admission::SiblingsAlive { live }
            } else {
                Admission::Admit
            }
        } else {
            Admission::Admit
        };

        if event.kind == EventKind::Deleted {
            pods.remove(&event.pod_name);
            if pods.is_empty() {
                self.releases.remove(&id);
            }
        }

        admission
    }

    /// Forget pods of owned releases that are not in `listed`.
    ///
    /// Returns one DELETED event per release that lost all of its pods, built
    /// from the last event of its newest pod.
    pub fn prune(
        &mut self,
        listed: &BTreeSet<String>,
        owns: impl Fn(&str) -> bool,
    ) -> Vec<PodEvent> {
        let mut gone = Vec::new();

        self.releases.retain(|id, pods| {
            if !owns(id) {
                return true;
            }

            let mut newest_vanished: Option<PodEntry> = None;
            pods.retain(|name, entry| {
                if listed.contains(name) {
                    return true;
                }
                if newest_vanished.as_ref().is_none_or(|kept| entry.creation >= kept.creation) {
                    newest_vanished = Some(entry.clone());
                }
                false
            });

            if !pods.is_empty() {
                return true;
            }
            if let Some(entry) = newest_vanished {
                let mut event = entry.last;
                event.kind = EventKind::Deleted;
                gone.push(event);
            }
            false
        });

        gone
    }

    /// Number of pods tracked for a release
    #[cfg(test)]
    pub fn pod_count(&self, app_instance_id: &str) -> usize {
        self.releases.get(app_instance_id).map_or(0, BTreeMap::len)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }
}
