//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the pod watcher to
//! a fixed pool of reconcile workers. Events are sharded by a hash of their
//! `app_instance_id`, so events of one application are processed in delivery
//! order while different applications are reconciled concurrently. The end
//! of every pod list is broadcast to all workers, each of which forgets the
//! vanished pods of its own shard.

use crate::config::Settings;
use crate::error::ControllerError;
use crate::prober::{ReadinessProber, StatusProbe};
use crate::reconciler::Reconciler;
use crate::status_mapper::StatusMapper;
use crate::watcher::{KubePodSource, PodSource, PodWatcher, WatchItem};
use app_status_client::{
    AppStatusApi, AppStatusClient, ClientError, ExponentialBackoff, StatusPublisher, TokenManager,
};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ping attempts before giving up at startup
pub const PING_ATTEMPTS: u32 = 5;

/// Main controller for application status reporting.
pub struct Controller {
    source: Box<dyn PodSource>,
    reconciler: Arc<Reconciler>,
    workers: usize,
    queue_capacity: usize,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// Waits for the status API to answer its ping endpoint and obtains the
    /// first token before returning, so a misconfigured deployment fails fast.
    pub async fn new(settings: Settings) -> Result<Self, ControllerError> {
        info!("Initializing app status controller");

        let kube_client = Client::try_default().await?;
        let pods: Api<Pod> = Api::namespaced(kube_client, &settings.namespace);
        let source = KubePodSource::new(pods, settings.label_selector.clone());

        let client = AppStatusClient::new(settings.endpoints.clone(), &settings.client_options)?;
        let api: Arc<dyn AppStatusApi> = Arc::new(client);

        info!("Waiting for status API at {}", settings.endpoints.ping_url);
        wait_for_api(
            api.as_ref(),
            PING_ATTEMPTS,
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(16)),
        )
        .await?;

        let tokens = Arc::new(TokenManager::new(
            Arc::clone(&api),
            settings.credentials.clone(),
            settings.token_ttl,
        ));
        tokens.get_token().await.map_err(|e| match e {
            ClientError::Authentication(msg) => {
                error!("Status API rejected the configured credentials: {}", msg);
                error!("Please ensure USERNAME and PASSWORD are set correctly");
                ControllerError::Authentication(msg)
            }
            other => ControllerError::Startup(format!("cannot obtain API token: {}", other)),
        })?;
        info!("Authenticated against {}", settings.endpoints.token_url);

        let prober = if settings.probe.trigger_statuses.is_empty() {
            info!("App probing disabled: no trigger statuses configured");
            None
        } else {
            let prober = ReadinessProber::new(settings.probe.clone())?;
            if prober.baseline(&settings.endpoints.ping_url).await {
                Some(Arc::new(prober) as Arc<dyn StatusProbe>)
            } else {
                None
            }
        };

        let publisher = StatusPublisher::new(api, tokens, settings.retry);
        let reconciler = Reconciler::new(
            StatusMapper::new(settings.policy.clone()),
            prober,
            publisher,
            settings.urls.clone(),
        );

        info!(
            "Watching pods in namespace {} with selector '{}'",
            settings.namespace, settings.label_selector
        );

        Ok(Self::from_parts(
            Box::new(source),
            Arc::new(reconciler),
            settings.workers,
            settings.queue_capacity,
        ))
    }

    /// Assemble a controller from an existing source and reconciler
    pub fn from_parts(
        source: Box<dyn PodSource>,
        reconciler: Arc<Reconciler>,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        Self {
            source,
            reconciler,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Runs the controller until shutdown or a fatal error.
    ///
    /// Returns `Ok` after a graceful shutdown. A fatal authentication error in
    /// any worker, or a failed initial pod list, cancels `shutdown` and is
    /// returned once every task has stopped.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        info!("Starting controller with {} workers", self.workers);

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut watch_task = tokio::spawn(PodWatcher::new(self.source).run(tx, shutdown.clone()));

        let per_worker = (self.queue_capacity / self.workers).max(1);
        let mut senders = Vec::with_capacity(self.workers);
        let mut workers = JoinSet::new();
        for index in 0..self.workers {
            let (worker_tx, worker_rx) = mpsc::channel(per_worker);
            senders.push(worker_tx);
            workers.spawn(work(
                index,
                self.workers,
                worker_rx,
                Arc::clone(&self.reconciler),
                shutdown.clone(),
            ));
        }
        let dispatcher = tokio::spawn(dispatch(rx, senders, shutdown.clone()));

        let mut result = Ok(());
        let mut watcher_done = false;
        loop {
            tokio::select! {
                joined = &mut watch_task, if !watcher_done => {
                    watcher_done = true;
                    let outcome = joined.unwrap_or_else(|e| Err(ControllerError::Watch(format!("watcher task failed: {}", e))));
                    if let Err(e) = outcome {
                        error!("Pod watcher stopped: {}", e);
                        record(&mut result, e);
                        shutdown.cancel();
                    }
                }
                Some(joined) = workers.join_next() => {
                    let outcome = joined.unwrap_or_else(|e| Err(ControllerError::Startup(format!("worker task failed: {}", e))));
                    if let Err(e) = outcome {
                        record(&mut result, e);
                        shutdown.cancel();
                    }
                }
                else => break,
            }
        }

        if let Err(e) = dispatcher.await {
            warn!("Dispatcher task failed: {}", e);
        }

        match &result {
            Ok(()) => info!("Controller stopped"),
            Err(e) => error!("Controller stopped: {}", e),
        }
        result
    }
}

/// Keep the first error
fn record(result: &mut Result<(), ControllerError>, err: ControllerError) {
    if result.is_ok() {
        *result = Err(err);
    }
}

/// Worker index for an application
fn shard_for(app_instance_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    app_instance_id.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// Route events from the watcher to the workers
async fn dispatch(
    mut rx: mpsc::Receiver<WatchItem>,
    senders: Vec<mpsc::Sender<WatchItem>>,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };

        let shard = match &item {
            WatchItem::Event(event) => Some(shard_for(event.app_instance_id(), senders.len())),
            WatchItem::Resync(_) => None,
        };
        let delivered = match shard {
            Some(shard) => forward(item, &senders[shard], &shutdown).await,
            None => broadcast(item, &senders, &shutdown).await,
        };
        if !delivered {
            break;
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        abandon(&item);
    }
}

/// Hand `item` to one worker; `false` once shutdown was requested
async fn forward(
    item: WatchItem,
    sender: &mpsc::Sender<WatchItem>,
    shutdown: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            abandon(&item);
            false
        }
        permit = sender.reserve() => {
            match permit {
                Ok(permit) => permit.send(item),
                Err(_) => abandon(&item),
            }
            true
        }
    }
}

async fn broadcast(
    item: WatchItem,
    senders: &[mpsc::Sender<WatchItem>],
    shutdown: &CancellationToken,
) -> bool {
    for sender in senders {
        if !forward(item.clone(), sender, shutdown).await {
            return false;
        }
    }
    true
}

/// Reconcile events of one shard in order
async fn work(
    index: usize,
    shards: usize,
    mut rx: mpsc::Receiver<WatchItem>,
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    debug!("Worker {} started", index);

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => {
                    debug!("Worker {} finished", index);
                    return Ok(());
                }
            },
        };

        let result = match item {
            WatchItem::Event(event) => reconciler
                .reconcile(&event, &shutdown)
                .await
                .map(|outcome| debug!("{} {} reconciled: {:?}", event.kind, event.key(), outcome)),
            WatchItem::Resync(listed) => reconciler
                .resync(&listed, |id| shard_for(id, shards) == index, &shutdown)
                .await
                .map(|outcomes| {
                    if !outcomes.is_empty() {
                        debug!("Worker {} resynced: {:?}", index, outcomes);
                    }
                }),
        };
        if let Err(e) = result {
            error!("Worker {} hit a fatal error, stopping controller: {}", index, e);
            shutdown.cancel();
            return Err(e);
        }
    }

    rx.close();
    while let Ok(item) = rx.try_recv() {
        abandon(&item);
    }
    debug!("Worker {} stopped", index);
    Ok(())
}

fn abandon(item: &WatchItem) {
    let WatchItem::Event(event) = item else {
        return;
    };
    warn!(
        app_instance_id = %event.app_instance_id(),
        pod = %event.pod_name,
        kind = "shutdown",
        "Abandoned queued {} event",
        event.kind
    );
}

/// Ping the API until it answers or `attempts` run out
async fn wait_for_api(
    api: &dyn AppStatusApi,
    attempts: u32,
    mut backoff: ExponentialBackoff,
) -> Result<(), ControllerError> {
    for attempt in 1..=attempts {
        match api.ping().await {
            Ok(true) => {
                info!("Status API at {} is available", api.base_url());
                return Ok(());
            }
            Ok(false) => warn!(
                "Status API at {} is not ready (attempt {}/{})",
                api.base_url(),
                attempt,
                attempts
            ),
            Err(e) => warn!(
                "Status API at {} is unreachable (attempt {}/{}): {}",
                api.base_url(),
                attempt,
                attempts,
                e
            ),
        }
        if attempt < attempts {
            tokio::time::sleep(backoff.next_backoff()).await;
        }
    }

    Err(ControllerError::Startup(format!(
        "status API at {} did not answer after {} attempts",
        api.base_url(),
        attempts
    )))
}
