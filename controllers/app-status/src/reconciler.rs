//! Per-event reconciliation.
//!
//! One pod event goes through `mapped -> admitted -> (probed) -> published`
//! and ends as published, ignored, abandoned or skipped. Everything except a
//! fatal authentication failure is contained here; the caller moves on to
//! the next event.

use crate::app::{AppDescriptor, AppUrlConfig};
use crate::error::ControllerError;
use crate::pod_event::PodEvent;
use crate::prober::StatusProbe;
use crate::release_index::{Admission, ReleaseIndex};
use crate::status_mapper::StatusMapper;
use app_status_client::{AppStatus, PublishOutcome, StatusPublisher, StatusUpdateRequest};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Terminal state of one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Published { status: AppStatus, attempts: u32 },
    /// The API does not know the instance
    Ignored { status: AppStatus },
    Abandoned { status: AppStatus, reason: String },
    Skipped { reason: String },
}

/// Reconciles pod events into status updates.
pub struct Reconciler {
    mapper: StatusMapper,
    prober: Option<Arc<dyn StatusProbe>>,
    publisher: StatusPublisher,
    index: Mutex<ReleaseIndex>,
    urls: AppUrlConfig,
}

impl Reconciler {
    /// Creates a new reconciler; `prober` is `None` when probing is disabled.
    pub fn new(
        mapper: StatusMapper,
        prober: Option<Arc<dyn StatusProbe>>,
        publisher: StatusPublisher,
        urls: AppUrlConfig,
    ) -> Self {
        Self {
            mapper,
            prober,
            publisher,
            index: Mutex::new(ReleaseIndex::new()),
            urls,
        }
    }

    /// Reconcile one event.
    ///
    /// # Errors
    ///
    /// `ControllerError::Authentication` when the status API rejects the
    /// controller's credentials; the controller must stop.
    pub async fn reconcile(
        &self,
        event: &PodEvent,
        shutdown: &CancellationToken,
    ) -> Result<ReconcileOutcome, ControllerError> {
        let id = event.app_instance_id().to_string();
        let mapped = self.mapper.map_event(event);

        if let Some(anomaly) = &mapped.anomaly {
            warn!(
                app_instance_id = %id,
                pod = %event.pod_name,
                "Mapping anomaly ({}), reporting {}",
                anomaly,
                mapped.status
            );
        }
        if let Some(reason) = &mapped.translated_reason {
            debug!("Container reason {} of {} translated to {}", reason, event.key(), mapped.status);
        }

        let admission = self.index.lock().await.admit(event, mapped.status);
        match admission {
            Admission::Admit => {}
            Admission::Superseded { newer_pod } => {
                info!(
                    "Skipping {} {} for {}: superseded by newer pod {}",
                    event.kind, event.key(), id, newer_pod
                );
                return Ok(ReconcileOutcome::Skipped {
                    reason: format!("superseded by {}", newer_pod),
                });
            }
            Admission::SiblingsAlive { live } => {
                info!(
                    "Not reporting Deleted for {} ({}): {} other pod(s) of the release still live",
                    id, event.key(), live
                );
                return Ok(ReconcileOutcome::Skipped {
                    reason: format!("{} sibling pod(s) still live", live),
                });
            }
        }

        let app = AppDescriptor::from_event(event, &self.urls);
        let status = match &self.prober {
            Some(prober) => match prober.confirm(&app, mapped.status, shutdown).await {
                Some(status) => status,
                None => {
                    warn!(
                        app_instance_id = %id,
                        pod = %event.pod_name,
                        status = %mapped.status,
                        kind = "shutdown",
                        "Abandoned status update"
                    );
                    return Ok(ReconcileOutcome::Abandoned {
                        status: mapped.status,
                        reason: "shutdown".to_string(),
                    });
                }
            },
            None => mapped.status,
        };
        if status != mapped.status {
            info!("Probe changed status of {} from {} to {}", id, mapped.status, status);
        }

        let url = (status == AppStatus::Running).then(|| app.url.clone()).flatten();
        let request = StatusUpdateRequest::new(id.clone(), status)
            .with_url(url)
            .with_messages(event.pod_message.as_deref(), event.container_message());

        match self.publisher.publish(&request).await {
            Ok(PublishOutcome::Published { attempts }) => {
                info!(
                    app_instance_id = %id,
                    pod = %event.pod_name,
                    status = %status,
                    "Published status after {} attempt(s)",
                    attempts
                );
                Ok(ReconcileOutcome::Published { status, attempts })
            }
            Ok(PublishOutcome::Ignored { status: code }) => {
                debug!("Status API has no instance {} (HTTP {}), ignoring", id, code);
                Ok(ReconcileOutcome::Ignored { status })
            }
            Ok(PublishOutcome::Abandoned { kind, attempts, reason }) => {
                error!(
                    app_instance_id = %id,
                    pod = %event.pod_name,
                    status = %status,
                    kind = %kind,
                    "Abandoned status update after {} attempt(s): {}",
                    attempts,
                    reason
                );
                Ok(ReconcileOutcome::Abandoned {
                    status,
                    reason: format!("{}: {}", kind, reason),
                })
            }
            Err(e) => {
                error!(
                    app_instance_id = %id,
                    pod = %event.pod_name,
                    status = %status,
                    kind = "fatal",
                    "{}",
                    e
                );
                Err(e.into())
            }
        }
    }

    /// Reconcile the index against a fresh pod list.
    ///
    /// Only releases accepted by `owns` are touched, so each worker resyncs
    /// its own shard in order with the events it already processed. Releases
    /// whose pods all vanished are reported `Deleted`.
    pub async fn resync(
        &self,
        listed: &BTreeSet<String>,
        owns: impl Fn(&str) -> bool,
        shutdown: &CancellationToken,
    ) -> Result<Vec<ReconcileOutcome>, ControllerError> {
        let gone = self.index.lock().await.prune(listed, owns);

        let mut outcomes = Vec::with_capacity(gone.len());
        for event in gone {
            info!(
                "Pod {} of {} vanished while the watch was down, reporting the release deleted",
                event.key(),
                event.app_instance_id()
            );
            outcomes.push(self.reconcile(&event, shutdown).await?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod tests;
