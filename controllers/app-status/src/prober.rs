//! Readiness prober.
//!
//! Confirms selected status transitions by checking that the application is
//! (or is no longer) answering on its in-cluster URL before the status is
//! published. A single probe resolves the host first and then issues a GET:
//!
//! - DNS failure or no host: `NotFound`
//! - 2xx/3xx (after redirects): `Reachable`
//! - 404: `NotFound`
//! - anything else, connection errors, timeouts: `Unreachable`
//!
//! Probing never fails upward; the worst case is a downgraded status.

use crate::app::{AppDescriptor, AppType};
use crate::error::ControllerError;
use app_status_client::AppStatus;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Prober settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Candidate statuses that trigger probing
    pub trigger_statuses: Vec<AppStatus>,
    /// App types that can be probed
    pub probe_apps: Vec<AppType>,
    pub running_window: Duration,
    pub running_interval: Duration,
    pub deleted_window: Duration,
    pub deleted_interval: Duration,
    /// Consecutive non-reachable results that confirm `Deleted`
    pub confirm_count: u32,
    /// Timeout for DNS and for each GET
    pub request_timeout: Duration,
    pub accept_invalid_certs: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            trigger_statuses: vec![AppStatus::Running, AppStatus::Deleted],
            probe_apps: vec![AppType::Shiny, AppType::ShinyProxy],
            running_window: Duration::from_secs(60),
            running_interval: Duration::from_secs(3),
            deleted_window: Duration::from_secs(30),
            deleted_interval: Duration::from_secs(2),
            confirm_count: 2,
            request_timeout: Duration::from_secs(5),
            accept_invalid_certs: false,
        }
    }
}

/// Classification of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Reachable,
    NotFound,
    Unreachable,
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Reachable => write!(f, "reachable"),
            ProbeOutcome::NotFound => write!(f, "not-found"),
            ProbeOutcome::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Result of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub outcome: ProbeOutcome,
    pub http_status: Option<u16>,
    pub note: String,
}

impl ProbeResult {
    fn new(outcome: ProbeOutcome, http_status: Option<u16>, note: impl Into<String>) -> Self {
        Self {
            outcome,
            http_status,
            note: note.into(),
        }
    }
}

/// Confirms a candidate status before it is published
#[async_trait::async_trait]
pub trait StatusProbe: Send + Sync {
    /// Confirmed (possibly downgraded) status, `None` when interrupted by shutdown
    async fn confirm(
        &self,
        app: &AppDescriptor,
        candidate: AppStatus,
        shutdown: &CancellationToken,
    ) -> Option<AppStatus>;
}

/// HTTP reachability checks for application URLs
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: Client,
    config: ProbeConfig,
}

impl ReadinessProber {
    pub fn new(config: ProbeConfig) -> Result<Self, ControllerError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout.min(Duration::from_secs(3)))
            .redirect(reqwest::redirect::Policy::limited(10))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| ControllerError::InvalidConfig(format!("failed to build probe client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Whether `candidate` for `app` needs confirmation
    pub fn should_probe(&self, app: &AppDescriptor, candidate: AppStatus) -> bool {
        self.config.trigger_statuses.contains(&candidate)
            && app
                .app_type
                .is_some_and(|app_type| self.config.probe_apps.contains(&app_type))
            && app.url.is_some()
    }

    /// Confirm or downgrade `candidate`.
    ///
    /// Returns `None` only when `shutdown` fires mid-probe.
    pub async fn probe(
        &self,
        app: &AppDescriptor,
        candidate: AppStatus,
        shutdown: &CancellationToken,
    ) -> Option<AppStatus> {
        let Some(url) = app.url.as_deref().filter(|_| self.should_probe(app, candidate)) else {
            return Some(candidate);
        };

        match candidate {
            AppStatus::Running => self.confirm_running(app, url, shutdown).await,
            AppStatus::Deleted => self.confirm_deleted(app, url, shutdown).await,
            other => {
                let result = self.probe_url(url).await;
                debug!(
                    "Probe of {} for {} ({}): {} {}",
                    url, app.app_instance_id, other, result.outcome, result.note
                );
                Some(other)
            }
        }
    }

    async fn confirm_running(
        &self,
        app: &AppDescriptor,
        url: &str,
        shutdown: &CancellationToken,
    ) -> Option<AppStatus> {
        let deadline = Instant::now() + self.config.running_window;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = self.probe_url(url).await;
            if result.outcome == ProbeOutcome::Reachable {
                info!(
                    "Probe confirmed Running for {} at {} after {} attempt(s)",
                    app.app_instance_id, url, attempts
                );
                return Some(AppStatus::Running);
            }
            debug!(
                "Probe {} for {} at {}: {} ({})",
                attempts, app.app_instance_id, url, result.outcome, result.note
            );

            if !self.wait(deadline, self.config.running_interval, shutdown).await? {
                break;
            }
        }

        warn!(
            "App {} not reachable at {} within {:?}, reporting Pending",
            app.app_instance_id, url, self.config.running_window
        );
        Some(AppStatus::Pending)
    }

    async fn confirm_deleted(
        &self,
        app: &AppDescriptor,
        url: &str,
        shutdown: &CancellationToken,
    ) -> Option<AppStatus> {
        let deadline = Instant::now() + self.config.deleted_window;
        let mut consecutive = 0u32;

        let last_reachable = loop {
            let result = self.probe_url(url).await;
            let reachable = result.outcome == ProbeOutcome::Reachable;
            if reachable {
                consecutive = 0;
            } else {
                consecutive += 1;
                if consecutive >= self.config.confirm_count {
                    info!(
                        "Probe confirmed Deleted for {} ({} consecutive {} results)",
                        app.app_instance_id, consecutive, result.outcome
                    );
                    return Some(AppStatus::Deleted);
                }
            }
            debug!(
                "Deletion probe for {} at {}: {} ({})",
                app.app_instance_id, url, result.outcome, result.note
            );

            if !self.wait(deadline, self.config.deleted_interval, shutdown).await? {
                break reachable;
            }
        };

        if last_reachable {
            warn!(
                "App {} still reachable at {} after {:?}, reporting Pending",
                app.app_instance_id, url, self.config.deleted_window
            );
            Some(AppStatus::Pending)
        } else {
            Some(AppStatus::Deleted)
        }
    }

    /// Sleep for `interval` unless that passes `deadline`.
    ///
    /// `Some(false)` means the window is over, `None` means shutdown.
    async fn wait(
        &self,
        deadline: Instant,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Option<bool> {
        if Instant::now() + interval > deadline {
            return Some(false);
        }
        tokio::select! {
            _ = shutdown.cancelled() => None,
            _ = tokio::time::sleep(interval) => Some(true),
        }
    }

    /// Probe a single URL
    pub async fn probe_url(&self, url: &str) -> ProbeResult {
        let parsed = match reqwest::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => return ProbeResult::new(ProbeOutcome::NotFound, None, format!("invalid URL: {}", e)),
        };
        let Some(host) = parsed.host_str().map(str::to_string) else {
            return ProbeResult::new(ProbeOutcome::NotFound, None, "URL has no host");
        };
        let port = parsed.port_or_known_default().unwrap_or(80);

        let lookup = tokio::time::timeout(
            self.config.request_timeout,
            tokio::net::lookup_host((host.trim_matches(|c| c == '[' || c == ']'), port)),
        )
        .await;
        match lookup {
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_none() {
                    return ProbeResult::new(ProbeOutcome::NotFound, None, format!("no addresses for {}", host));
                }
            }
            Ok(Err(e)) => {
                debug!("DNS resolution failed for {}: {}", host, e);
                return ProbeResult::new(ProbeOutcome::NotFound, None, "DNS resolution failed");
            }
            Err(_) => {
                return ProbeResult::new(ProbeOutcome::NotFound, None, "DNS resolution timed out");
            }
        }

        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match status {
                    200..=399 => ProbeResult::new(ProbeOutcome::Reachable, Some(status), "HTTP 2xx/3xx"),
                    404 => ProbeResult::new(ProbeOutcome::NotFound, Some(status), "HTTP 404"),
                    _ => ProbeResult::new(ProbeOutcome::Unreachable, Some(status), format!("HTTP {}", status)),
                }
            }
            Err(e) if e.is_timeout() => ProbeResult::new(ProbeOutcome::Unreachable, None, "timed out"),
            Err(e) => ProbeResult::new(ProbeOutcome::Unreachable, None, format!("request failed: {}", e)),
        }
    }

    /// Check the prober against a URL that must be reachable
    pub async fn baseline(&self, url: &str) -> bool {
        let result = self.probe_url(url).await;
        if result.outcome == ProbeOutcome::Reachable {
            info!("Probe baseline against {} succeeded", url);
            true
        } else {
            warn!(
                "Probe baseline against {} failed ({}: {}), disabling app probing",
                url, result.outcome, result.note
            );
            false
        }
    }
}

#[async_trait::async_trait]
impl StatusProbe for ReadinessProber {
    async fn confirm(
        &self,
        app: &AppDescriptor,
        candidate: AppStatus,
        shutdown: &CancellationToken,
    ) -> Option<AppStatus> {
        self.probe(app, candidate, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::Redirect;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/ok", get(|| async { "hello" }))
            .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "nope") }))
            .route("/boom", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }))
            .route("/moved", get(|| async { Redirect::temporary("/ok") }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn closed_port_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/", addr)
    }

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            running_window: Duration::from_millis(300),
            running_interval: Duration::from_millis(50),
            deleted_window: Duration::from_millis(300),
            deleted_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn app(url: Option<String>) -> AppDescriptor {
        AppDescriptor {
            app_instance_id: "app-123".to_string(),
            pod_name: "app-123-abc".to_string(),
            namespace: "default".to_string(),
            app_type: Some(AppType::Shiny),
            url,
        }
    }

    #[tokio::test]
    async fn test_probe_url_classification() {
        let base = spawn_server().await;
        let prober = ReadinessProber::new(fast_config()).unwrap();

        let ok = prober.probe_url(&format!("{}/ok", base)).await;
        assert_eq!(ok.outcome, ProbeOutcome::Reachable);
        assert_eq!(ok.http_status, Some(200));

        let moved = prober.probe_url(&format!("{}/moved", base)).await;
        assert_eq!(moved.outcome, ProbeOutcome::Reachable);

        let missing = prober.probe_url(&format!("{}/missing", base)).await;
        assert_eq!(missing.outcome, ProbeOutcome::NotFound);
        assert_eq!(missing.http_status, Some(404));

        let boom = prober.probe_url(&format!("{}/boom", base)).await;
        assert_eq!(boom.outcome, ProbeOutcome::Unreachable);
        assert_eq!(boom.http_status, Some(503));
    }

    #[tokio::test]
    async fn test_probe_url_network_failures() {
        let prober = ReadinessProber::new(fast_config()).unwrap();

        let nxdomain = prober.probe_url("http://app-123-shinyapp.nowhere.invalid:80/").await;
        assert_eq!(nxdomain.outcome, ProbeOutcome::NotFound);

        let refused = prober.probe_url(&closed_port_url().await).await;
        assert_eq!(refused.outcome, ProbeOutcome::Unreachable);

        let garbage = prober.probe_url("not a url").await;
        assert_eq!(garbage.outcome, ProbeOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_running_confirmed_when_reachable() {
        let base = spawn_server().await;
        let prober = ReadinessProber::new(fast_config()).unwrap();
        let shutdown = CancellationToken::new();

        let status = prober
            .probe(&app(Some(format!("{}/ok", base))), AppStatus::Running, &shutdown)
            .await;
        assert_eq!(status, Some(AppStatus::Running));
    }

    #[tokio::test]
    async fn test_running_downgraded_to_pending_when_failing() {
        let base = spawn_server().await;
        let prober = ReadinessProber::new(fast_config()).unwrap();
        let shutdown = CancellationToken::new();

        let status = prober
            .probe(&app(Some(format!("{}/boom", base))), AppStatus::Running, &shutdown)
            .await;
        assert_eq!(status, Some(AppStatus::Pending));
    }

    #[tokio::test]
    async fn test_deleted_confirmed_when_gone() {
        let base = spawn_server().await;
        let prober = ReadinessProber::new(fast_config()).unwrap();
        let shutdown = CancellationToken::new();

        let status = prober
            .probe(&app(Some(format!("{}/missing", base))), AppStatus::Deleted, &shutdown)
            .await;
        assert_eq!(status, Some(AppStatus::Deleted));
    }

    #[tokio::test]
    async fn test_deleted_downgraded_while_still_reachable() {
        let base = spawn_server().await;
        let prober = ReadinessProber::new(fast_config()).unwrap();
        let shutdown = CancellationToken::new();

        let status = prober
            .probe(&app(Some(format!("{}/ok", base))), AppStatus::Deleted, &shutdown)
            .await;
        assert_eq!(status, Some(AppStatus::Pending));
    }

    #[tokio::test]
    async fn test_untriggered_statuses_pass_through() {
        let prober = ReadinessProber::new(fast_config()).unwrap();
        let shutdown = CancellationToken::new();
        let target = app(Some("http://app-123-shinyapp.nowhere.invalid/".to_string()));

        assert!(!prober.should_probe(&target, AppStatus::Pending));
        assert_eq!(
            prober.probe(&target, AppStatus::Pending, &shutdown).await,
            Some(AppStatus::Pending)
        );

        // No URL, nothing to probe
        assert!(!prober.should_probe(&app(None), AppStatus::Running));

        let mut unknown_type = target.clone();
        unknown_type.app_type = None;
        assert!(!prober.should_probe(&unknown_type, AppStatus::Running));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_probe() {
        let base = spawn_server().await;
        let prober = ReadinessProber::new(ProbeConfig {
            running_window: Duration::from_secs(60),
            running_interval: Duration::from_secs(3),
            ..fast_config()
        })
        .unwrap();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let status = prober
            .probe(&app(Some(format!("{}/boom", base))), AppStatus::Running, &shutdown)
            .await;
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn test_baseline() {
        let base = spawn_server().await;
        let prober = ReadinessProber::new(fast_config()).unwrap();

        assert!(prober.baseline(&format!("{}/ok", base)).await);
        assert!(!prober.baseline(&closed_port_url().await).await);
    }
}
