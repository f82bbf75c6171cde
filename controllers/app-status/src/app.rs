//! Application descriptors and in-cluster URL resolution.
//!
//! An `AppDescriptor` is what the prober and publisher need to know about the
//! application behind a pod: its instance id, its type and, when the type is
//! known, the service URL it is reachable at from inside the cluster.

use crate::pod_event::{PodEvent, RELEASE_LABEL};
use std::fmt;
use std::str::FromStr;

/// Kinds of applications the controller knows how to reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppType {
    Shiny,
    ShinyProxy,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Shiny => "shiny",
            AppType::ShinyProxy => "shiny-proxy",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shiny" => Ok(AppType::Shiny),
            "shiny-proxy" | "shinyproxy" => Ok(AppType::ShinyProxy),
            other => Err(format!("unknown app type '{}'", other)),
        }
    }
}

/// Detect the application type from the pod's `app` label and images.
///
/// An `app` label mentioning shinyproxy wins; otherwise any image with
/// `shiny` or `rstudio` in its name is treated as a plain shiny app.
pub fn detect_app_type(event: &PodEvent) -> Option<AppType> {
    let app_label = event
        .labels
        .get("app")
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();
    if app_label.contains("shinyproxy") {
        return Some(AppType::ShinyProxy);
    }

    event
        .images
        .iter()
        .map(|image| image.to_ascii_lowercase())
        .any(|image| image.contains("shiny") || image.contains("rstudio"))
        .then_some(AppType::Shiny)
}

/// How service host names are formed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    /// `service.namespace`
    Short,
    /// `service.namespace.svc.cluster.local`
    Fqdn,
}

impl FromStr for DnsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "short" | "" => Ok(DnsMode::Short),
            "fqdn" => Ok(DnsMode::Fqdn),
            other => Err(format!("unknown DNS mode '{}', expected short or fqdn", other)),
        }
    }
}

/// Settings for building application URLs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUrlConfig {
    pub dns_mode: DnsMode,
    /// Appended after the namespace in short mode, e.g. `serve-dev.svc.cluster.local`
    pub dns_suffix: Option<String>,
    pub port: u16,
    pub scheme: String,
    pub shinyproxy_service_suffix: String,
    pub shinyproxy_path_prefix: String,
    pub shiny_service_suffix: String,
}

impl Default for AppUrlConfig {
    fn default() -> Self {
        Self {
            dns_mode: DnsMode::Short,
            dns_suffix: None,
            port: 80,
            scheme: "http".to_string(),
            shinyproxy_service_suffix: "shinyproxyapp".to_string(),
            shinyproxy_path_prefix: "/app".to_string(),
            shiny_service_suffix: "shinyapp".to_string(),
        }
    }
}

impl AppUrlConfig {
    fn host_for(&self, service: &str, namespace: &str) -> String {
        match (self.dns_mode, self.dns_suffix.as_deref()) {
            (DnsMode::Fqdn, _) => format!("{}.{}.svc.cluster.local", service, namespace),
            (DnsMode::Short, Some(suffix)) if !suffix.is_empty() => {
                format!("{}.{}.{}", service, namespace, suffix.trim_matches('.'))
            }
            (DnsMode::Short, _) => format!("{}.{}", service, namespace),
        }
    }

    /// Build the in-cluster URL of an application
    pub fn resolve(&self, app_type: AppType, release: &str, namespace: &str) -> String {
        match app_type {
            AppType::ShinyProxy => {
                let service = format!("{}-{}", release, self.shinyproxy_service_suffix);
                let prefix = self.shinyproxy_path_prefix.trim_end_matches('/');
                format!(
                    "{}://{}:{}{}/{}/",
                    self.scheme,
                    self.host_for(&service, namespace),
                    self.port,
                    prefix,
                    release
                )
            }
            AppType::Shiny => {
                let service = format!("{}-{}", release, self.shiny_service_suffix);
                format!("{}://{}:{}/", self.scheme, self.host_for(&service, namespace), self.port)
            }
        }
    }
}

/// What the prober and publisher know about one application instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub app_instance_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub app_type: Option<AppType>,
    /// Only resolvable with a known type and a `release` label
    pub url: Option<String>,
}

impl AppDescriptor {
    pub fn from_event(event: &PodEvent, urls: &AppUrlConfig) -> Self {
        let app_type = detect_app_type(event);
        let release = event
            .labels
            .get(RELEASE_LABEL)
            .filter(|release| !release.is_empty());
        let url = match (app_type, release) {
            (Some(app_type), Some(release)) => Some(urls.resolve(app_type, release, &event.namespace)),
            _ => None,
        };

        Self {
            app_instance_id: event.app_instance_id().to_string(),
            pod_name: event.pod_name.clone(),
            namespace: event.namespace.clone(),
            app_type,
            url,
        }
    }
}
