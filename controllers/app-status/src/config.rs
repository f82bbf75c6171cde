//! Command line and environment configuration.
//!
//! Every flag can also be set through the environment variable named next to
//! it. The parsed `Config` is validated once and converted into the settings
//! each component takes.

use crate::app::{AppType, AppUrlConfig, DnsMode};
use crate::error::ControllerError;
use crate::prober::ProbeConfig;
use crate::status_mapper::StatusPolicy;
use app_status_client::{AppStatus, ClientOptions, Credentials, Endpoints, RetryPolicy};
use clap::Parser;
use std::collections::BTreeMap;
use std::time::Duration;

/// Watches application pods and publishes their status to the application status API
#[derive(Parser)]
#[command(name = "app-status-controller")]
#[command(version)]
pub struct Config {
    /// Namespace to watch
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Label selector for application pods
    #[arg(long, env = "LABEL_SELECTOR", default_value = "type=app")]
    pub label_selector: String,

    /// Base URL of the application status API
    #[arg(long, env = "BASE_URL", default_value = "http://studio.127.0.0.1.nip.io:8080")]
    pub base_url: String,

    #[arg(long, env = "USERNAME")]
    pub username: String,

    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Token endpoint (defaults to {base-url}/api/v1/token-auth/)
    #[arg(long, env = "TOKEN_API_ENDPOINT")]
    pub token_api_endpoint: Option<String>,

    /// Status endpoint (defaults to {base-url}/api/v1/app-status/)
    #[arg(long, env = "APP_STATUS_API_ENDPOINT")]
    pub app_status_api_endpoint: Option<String>,

    /// Ping endpoint (defaults to {base-url}/openapi/v1/are-you-there)
    #[arg(long, env = "PING_API_ENDPOINT")]
    pub ping_api_endpoint: Option<String>,

    /// Comma separated statuses confirmed by probing before publishing
    #[arg(long, env = "APP_PROBE_STATUSES", default_value = "running,deleted")]
    pub probe_statuses: String,

    /// Comma separated app types that are probed
    #[arg(long, env = "APP_PROBE_APPS", default_value = "shiny,shiny-proxy")]
    pub probe_apps: String,

    /// Consecutive failed probes that confirm a deletion
    #[arg(long, env = "APP_PROBE_NXDOMAIN_CONFIRM", default_value_t = 2)]
    pub probe_nxdomain_confirm: u32,

    #[arg(long, env = "RUNNING_PROBE_WINDOW", default_value_t = 60)]
    pub running_probe_window_secs: u64,

    #[arg(long, env = "DELETED_PROBE_WINDOW", default_value_t = 30)]
    pub deleted_probe_window_secs: u64,

    /// How app host names are formed: short or fqdn
    #[arg(long, env = "APP_URL_DNS_MODE", default_value = "short")]
    pub app_url_dns_mode: String,

    /// Domain appended to `service.namespace` in short mode
    #[arg(long, env = "APP_URL_DNS_SUFFIX")]
    pub app_url_dns_suffix: Option<String>,

    #[arg(long, env = "APP_URL_PORT", default_value_t = 80)]
    pub app_url_port: u16,

    #[arg(long, env = "APP_URL_SCHEME", default_value = "http")]
    pub app_url_scheme: String,

    #[arg(long, env = "SHINYPROXY_SERVICE_SUFFIX", default_value = "shinyproxyapp")]
    pub shinyproxy_service_suffix: String,

    #[arg(long, env = "SHINYPROXY_PATH_PREFIX", default_value = "/app")]
    pub shinyproxy_path_prefix: String,

    #[arg(long, env = "SHINY_SERVICE_SUFFIX", default_value = "shinyapp")]
    pub shiny_service_suffix: String,

    /// Report crash-looping and image pull failures as Error
    #[arg(long, env = "TRANSLATE_CONTAINER_REASONS")]
    pub translate_container_reasons: bool,

    /// Pod phase mapping override, `Phase=Status` (repeatable)
    #[arg(long = "phase-override", env = "PHASE_OVERRIDES", value_delimiter = ',')]
    pub phase_overrides: Vec<String>,

    #[arg(long, env = "PUBLISH_MAX_ATTEMPTS", default_value_t = 3)]
    pub publish_max_attempts: u32,

    /// Number of reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Capacity of the event queue
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 256)]
    pub queue_capacity: usize,

    /// Assumed API token lifetime
    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 43_200)]
    pub token_ttl_secs: u64,

    /// Skip TLS certificate verification for the API and probes
    #[arg(long, env = "TLS_INSECURE")]
    pub tls_insecure: bool,

    /// Enable debug logging
    #[arg(long, env = "DEBUG")]
    pub debug: bool,
}

/// Validated settings for every component
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub label_selector: String,
    pub endpoints: Endpoints,
    pub client_options: ClientOptions,
    pub credentials: Credentials,
    pub token_ttl: Duration,
    pub retry: RetryPolicy,
    pub policy: StatusPolicy,
    pub probe: ProbeConfig,
    pub urls: AppUrlConfig,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Config {
    /// Validate and convert into component settings.
    ///
    /// # Errors
    ///
    /// `ControllerError::InvalidConfig` naming the first offending setting.
    pub fn into_settings(self) -> Result<Settings, ControllerError> {
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace must not be empty"));
        }
        if self.label_selector.trim().is_empty() {
            return Err(invalid("label selector must not be empty"));
        }
        let base_url = self.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(invalid(format!("base URL must be http(s), got '{}'", base_url)));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(invalid("username and password are required"));
        }
        if self.workers == 0 {
            return Err(invalid("workers must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("queue capacity must be at least 1"));
        }
        if self.publish_max_attempts == 0 {
            return Err(invalid("publish max attempts must be at least 1"));
        }

        let trigger_statuses = parse_list(&self.probe_statuses, |s| s.parse::<AppStatus>())?;
        let probe_apps = parse_list(&self.probe_apps, |s| s.parse::<AppType>())?;
        let phase_overrides = parse_overrides(&self.phase_overrides)?;
        let dns_mode: DnsMode = self.app_url_dns_mode.parse().map_err(invalid)?;

        let endpoints = Endpoints::from_base(base_url)
            .with_token_url(self.token_api_endpoint)
            .with_status_url(self.app_status_api_endpoint)
            .with_ping_url(self.ping_api_endpoint);

        let defaults = ProbeConfig::default();
        let probe = ProbeConfig {
            trigger_statuses,
            probe_apps,
            running_window: Duration::from_secs(self.running_probe_window_secs),
            deleted_window: Duration::from_secs(self.deleted_probe_window_secs),
            confirm_count: self.probe_nxdomain_confirm.max(1),
            accept_invalid_certs: self.tls_insecure,
            ..defaults
        };

        let policy = StatusPolicy {
            phase_overrides,
            translate_reasons: self.translate_container_reasons,
            ..StatusPolicy::default()
        };

        Ok(Settings {
            namespace: self.namespace.trim().to_string(),
            label_selector: self.label_selector.trim().to_string(),
            endpoints,
            client_options: ClientOptions {
                accept_invalid_certs: self.tls_insecure,
                ..ClientOptions::default()
            },
            credentials: Credentials::new(self.username, self.password),
            token_ttl: Duration::from_secs(self.token_ttl_secs),
            retry: RetryPolicy {
                max_attempts: self.publish_max_attempts,
                ..RetryPolicy::default()
            },
            policy,
            probe,
            urls: AppUrlConfig {
                dns_mode,
                dns_suffix: self.app_url_dns_suffix.filter(|s| !s.trim().is_empty()),
                port: self.app_url_port,
                scheme: self.app_url_scheme,
                shinyproxy_service_suffix: self.shinyproxy_service_suffix,
                shinyproxy_path_prefix: self.shinyproxy_path_prefix,
                shiny_service_suffix: self.shiny_service_suffix,
            },
            workers: self.workers,
            queue_capacity: self.queue_capacity,
        })
    }
}

fn invalid(msg: impl Into<String>) -> ControllerError {
    ControllerError::InvalidConfig(msg.into())
}

/// Parse a comma separated list, skipping blanks
fn parse_list<T>(
    raw: &str,
    parse: impl Fn(&str) -> Result<T, String>,
) -> Result<Vec<T>, ControllerError> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse(item).map_err(invalid))
        .collect()
}

/// Parse `Phase=Status` pairs
fn parse_overrides(raw: &[String]) -> Result<BTreeMap<String, AppStatus>, ControllerError> {
    let mut overrides = BTreeMap::new();
    for item in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let (phase, status) = item
            .split_once('=')
            .ok_or_else(|| invalid(format!("phase override '{}' is not Phase=Status", item)))?;
        let phase = phase.trim();
        if phase.is_empty() {
            return Err(invalid(format!("phase override '{}' has no phase", item)));
        }
        let status: AppStatus = status.parse().map_err(invalid)?;
        overrides.insert(phase.to_string(), status);
    }
    Ok(overrides)
}
