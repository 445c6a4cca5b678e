use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PrometheusConfig {
    /// The URL of the Prometheus server's exporter endpoint.
    pub url: Url,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "type")]
pub enum MetricConfig {
    #[serde(rename = "prometheus_push")]
    PrometheusPush(PrometheusConfig),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AppConfig {
    /// The host to listen on.
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// The port to listen on.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// The HTTP path reports are POSTed to.
    #[serde(default = "default_listen_path")]
    pub listen_path: String,
    /// The HTTP path answering health checks.
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    /// The SQLite database to store violations in.
    #[serde(default = "default_db")]
    pub db: String,
    /// A comma-separated list of substrings; when non-empty, the document URI
    /// of a report must contain one of them.
    #[serde(default)]
    pub whitelist: String,
    /// Replaces the built-in list of ignored blocked URI prefixes.
    pub blocked_uri_prefixes: Option<Vec<String>>,
    /// Metrics exporter configuration.
    pub metrics: Option<MetricConfig>,
}

fn default_listen_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_listen_port() -> u16 {
    8080
}

fn default_listen_path() -> String {
    "/".to_owned()
}

fn default_health_check_path() -> String {
    "/_healthcheck".to_owned()
}

fn default_db() -> String {
    "sqlite://csp.db".to_owned()
}

impl AppConfig {
    pub fn whitelist(&self) -> Vec<String> {
        parse_whitelist(&self.whitelist)
    }

    /// Check that the listen and health check paths can be routed.
    pub fn check_paths(&self) -> Result<()> {
        for (name, path) in [
            ("listen_path", &self.listen_path),
            ("health_check_path", &self.health_check_path),
        ] {
            if !path.starts_with('/') {
                bail!("{name} {path:?} must start with '/'");
            }
            if path.contains(['{', '}']) {
                bail!("{name} {path:?} must not contain '{{' or '}}'");
            }
            if path.split('/').any(|segment| segment.starts_with([':', '*'])) {
                bail!("{name} {path:?} must not have a segment starting with ':' or '*'");
            }
        }

        Ok(())
    }
}

/// Split a comma-separated whitelist into trimmed, lower-cased entries.
///
/// Blank entries are dropped: an empty entry would be a substring of every
/// document URI, so an empty setting must mean "no whitelist".
pub fn parse_whitelist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
