//! App Status Controller
//!
//! Watches application pods in one namespace and reports each application's
//! lifecycle status (Pending, Running, Failed, Error, Deleted) to the
//! application status API.
//!
//! Selected transitions are confirmed by probing the application's
//! in-cluster URL before they are published.

mod app;
mod config;
mod controller;
mod error;
mod pod_event;
mod prober;
mod reconciler;
mod release_index;
mod status_mapper;
mod watcher;
#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use clap::Parser;
use controller::Controller;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Dependencies that are too chatty below `warn`
const QUIET_TARGETS: [&str; 4] = ["hyper", "kube_client", "reqwest", "rustls"];

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let config = Config::parse();
    init_tracing(config.debug);

    // kube and reqwest both pull in rustls; pick the provider explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting App Status Controller {}", env!("CARGO_PKG_VERSION"));

    let settings = config.into_settings().inspect_err(|e| error!("{}", e))?;

    info!("Configuration:");
    info!("  Namespace: {}", settings.namespace);
    info!("  Label selector: {}", settings.label_selector);
    info!("  Status API: {}", settings.endpoints.base_url);
    info!("  Workers: {}", settings.workers);
    info!(
        "  Probing: {:?} for {:?}",
        settings.probe.trigger_statuses, settings.probe.probe_apps
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let controller = Controller::new(settings).await.inspect_err(|e| error!("{}", e))?;
    controller.run(shutdown).await?;

    info!("App Status Controller exited cleanly");
    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if debug { "debug" } else { "info" };
        let directives = QUIET_TARGETS
            .iter()
            .map(|target| format!("{}=warn", target))
            .fold(level.to_string(), |acc, directive| format!("{},{}", acc, directive));
        EnvFilter::new(directives)
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received SIGINT, shutting down");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT, shutting down");
        }
    }

    shutdown.cancel();
}
