//! Pod watcher.
//!
//! Lists the pods matching the label selector, emits a synthetic `ADDED`
//! event for each, then watches from the list's resource version. The watch
//! reconnects forever with exponential backoff; an expired cursor (HTTP 410)
//! triggers a fresh list. Events are handed to the reconciler through a
//! bounded channel and the cursor only advances once an event is queued.
//! Every list ends with a `WatchItem::Resync` naming the pods it returned, so
//! consumers can forget pods whose deletion happened while the watch was down.
//!
//! `PodSource` abstracts the cluster so the reconnect logic can be tested
//! with a scripted source.

use crate::error::ControllerError;
use crate::pod_event::{EventKind, PodEvent};
use app_status_client::ExponentialBackoff;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::Api;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Server-side timeout for list calls, in seconds
pub const LIST_TIMEOUT_SECS: u32 = 30;
/// Server-side timeout for watch calls, in seconds
pub const WATCH_TIMEOUT_SECS: u32 = 240;

/// One item of a watch stream
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
    /// Cursor advance without an object change
    Bookmark(String),
}

/// Watch failures, by how the watcher recovers
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    /// Resource version too old; re-list
    #[error("resource version expired")]
    Expired,
    /// Reconnect after backoff
    #[error("transient watch error: {0}")]
    Transient(String),
    /// Access denied; fatal before the first successful list
    #[error("fatal watch error: {0}")]
    Fatal(String),
}

/// What the watcher hands downstream
#[derive(Debug, Clone)]
pub enum WatchItem {
    Event(PodEvent),
    /// End of a list: names of every pod it returned
    Resync(Arc<BTreeSet<String>>),
}

/// Result of a list call
#[derive(Debug, Clone)]
pub struct PodSnapshot {
    pub resource_version: String,
    pub pods: Vec<Pod>,
}

/// Source of pod lists and watch streams
#[async_trait::async_trait]
pub trait PodSource: Send + Sync {
    async fn list(&self) -> Result<PodSnapshot, WatchError>;

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<SourceEvent, WatchError>>, WatchError>;
}

/// `PodSource` backed by the Kubernetes API
pub struct KubePodSource {
    api: Api<Pod>,
    label_selector: String,
}

impl KubePodSource {
    pub fn new(api: Api<Pod>, label_selector: impl Into<String>) -> Self {
        Self {
            api,
            label_selector: label_selector.into(),
        }
    }
}

fn classify_kube_error(err: kube::Error) -> WatchError {
    match err {
        kube::Error::Api(ae) if ae.code == 410 => WatchError::Expired,
        kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => {
            WatchError::Fatal(format!("{} {}", ae.code, ae.message))
        }
        other => WatchError::Transient(other.to_string()),
    }
}

#[async_trait::async_trait]
impl PodSource for KubePodSource {
    async fn list(&self) -> Result<PodSnapshot, WatchError> {
        let params = ListParams::default()
            .labels(&self.label_selector)
            .timeout(LIST_TIMEOUT_SECS);
        let list = self.api.list(&params).await.map_err(classify_kube_error)?;

        Ok(PodSnapshot {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            pods: list.items,
        })
    }

    async fn watch(
        &self,
        resource_version: &str,
    ) -> Result<BoxStream<'static, Result<SourceEvent, WatchError>>, WatchError> {
        let params = WatchParams::default()
            .labels(&self.label_selector)
            .timeout(WATCH_TIMEOUT_SECS);
        let stream = self
            .api
            .watch(&params, resource_version)
            .await
            .map_err(classify_kube_error)?;

        Ok(stream
            .map(|item| match item {
                Ok(WatchEvent::Added(pod)) => Ok(SourceEvent::Added(pod)),
                Ok(WatchEvent::Modified(pod)) => Ok(SourceEvent::Modified(pod)),
                Ok(WatchEvent::Deleted(pod)) => Ok(SourceEvent::Deleted(pod)),
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    Ok(SourceEvent::Bookmark(bookmark.metadata.resource_version))
                }
                Ok(WatchEvent::Error(e)) if e.code == 410 => Err(WatchError::Expired),
                Ok(WatchEvent::Error(e)) => {
                    Err(WatchError::Transient(format!("{} {}", e.code, e.message)))
                }
                Err(e) => Err(classify_kube_error(e)),
            })
            .boxed())
    }
}

/// What the run loop does next
enum Flow {
    Continue,
    Reconnect,
    Stop,
}

/// Long-lived, auto-reconnecting pod watch
pub struct PodWatcher {
    source: Box<dyn PodSource>,
    cursor: Option<String>,
    backoff: ExponentialBackoff,
    listed_once: bool,
}

impl PodWatcher {
    /// Watcher with the default reconnect backoff (1s doubling to 30s)
    pub fn new(source: Box<dyn PodSource>) -> Self {
        Self::with_backoff(
            source,
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        )
    }

    pub fn with_backoff(source: Box<dyn PodSource>, backoff: ExponentialBackoff) -> Self {
        Self {
            source,
            cursor: None,
            backoff,
            listed_once: false,
        }
    }

    /// Run until shutdown or until the receiver is dropped.
    ///
    /// Only an access error on the very first list is returned as an error.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<WatchItem>,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError> {
        info!("Starting pod watcher");

        loop {
            let step = match self.cursor.clone() {
                None => self.relist(&tx, &shutdown).await,
                Some(rv) => self.consume(&rv, &tx, &shutdown).await,
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Ok(Flow::Reconnect) => {
                    let delay = self.backoff.next_backoff();
                    debug!("Watch stream closed, reconnecting in {:?}", delay);
                    if !pause(delay, &shutdown).await {
                        break;
                    }
                }
                Err(WatchError::Expired) => {
                    warn!("Watch cursor expired, re-listing pods");
                    self.cursor = None;
                }
                Err(WatchError::Fatal(msg)) if !self.listed_once => {
                    error!("Cannot list pods: {}", msg);
                    return Err(ControllerError::Watch(msg));
                }
                Err(e) => {
                    let delay = self.backoff.next_backoff();
                    warn!("Pod watch failed: {}. Reconnecting in {:?}", e, delay);
                    if !pause(delay, &shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Pod watcher stopped");
        Ok(())
    }

    async fn relist(
        &mut self,
        tx: &mpsc::Sender<WatchItem>,
        shutdown: &CancellationToken,
    ) -> Result<Flow, WatchError> {
        let snapshot = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Flow::Stop),
            result = self.source.list() => result?,
        };
        self.listed_once = true;
        info!(
            "Listed {} pods at resource version {}",
            snapshot.pods.len(),
            snapshot.resource_version
        );

        for pod in &snapshot.pods {
            if !deliver(EventKind::Added, pod, tx, shutdown).await {
                return Ok(Flow::Stop);
            }
        }

        let listed: BTreeSet<String> = snapshot
            .pods
            .iter()
            .filter_map(|pod| pod.metadata.name.clone())
            .collect();
        if !send(WatchItem::Resync(Arc::new(listed)), tx, shutdown).await {
            return Ok(Flow::Stop);
        }

        self.cursor = Some(snapshot.resource_version);
        self.backoff.reset();
        Ok(Flow::Continue)
    }

    async fn consume(
        &mut self,
        resource_version: &str,
        tx: &mpsc::Sender<WatchItem>,
        shutdown: &CancellationToken,
    ) -> Result<Flow, WatchError> {
        debug!("Watching pods from resource version {}", resource_version);
        let mut stream = tokio::select! {
            _ = shutdown.cancelled() => return Ok(Flow::Stop),
            result = self.source.watch(resource_version) => result?,
        };

        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => return Ok(Flow::Stop),
                _ = tx.closed() => return Ok(Flow::Stop),
                item = stream.next() => item,
            };
            let Some(item) = item else {
                return Ok(Flow::Reconnect);
            };

            let (kind, pod) = match item? {
                SourceEvent::Bookmark(rv) => {
                    debug!("Bookmark at resource version {}", rv);
                    self.cursor = Some(rv);
                    continue;
                }
                SourceEvent::Added(pod) => (EventKind::Added, pod),
                SourceEvent::Modified(pod) => (EventKind::Modified, pod),
                SourceEvent::Deleted(pod) => (EventKind::Deleted, pod),
            };

            if !deliver(kind, &pod, tx, shutdown).await {
                return Ok(Flow::Stop);
            }
            if let Some(rv) = pod.metadata.resource_version {
                self.cursor = Some(rv);
            }
            self.backoff.reset();
        }
    }
}

/// Queue one event. Returns false when the watcher should stop.
async fn deliver(
    kind: EventKind,
    pod: &Pod,
    tx: &mpsc::Sender<WatchItem>,
    shutdown: &CancellationToken,
) -> bool {
    let event = match PodEvent::from_pod(kind, pod) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                "Skipping {} event for pod {}: {}",
                kind,
                pod.metadata.name.as_deref().unwrap_or("<unnamed>"),
                e
            );
            return true;
        }
    };

    debug!("{} {} (rv {})", kind, event.key(), event.resource_version);
    send(WatchItem::Event(event), tx, shutdown).await
}

async fn send(item: WatchItem, tx: &mpsc::Sender<WatchItem>, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = tx.send(item) => {
            if sent.is_err() {
                debug!("Event channel closed");
            }
            sent.is_ok()
        }
    }
}

/// Sleep unless shutdown fires first. Returns false on shutdown.
async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
