//! Metric name constants.

use std::time::Duration;

use anyhow::Context;
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config;

pub const REPORTS_RECEIVED: &str = "csp.reports.received"; // Counter.
pub const REPORTS_MALFORMED: &str = "csp.reports.malformed"; // Counter.
pub const REPORTS_REJECTED: &str = "csp.reports.rejected"; // Counter.
pub const REPORTS_STORED: &str = "csp.reports.stored"; // Counter.
pub const REPORTS_FAILED: &str = "csp.reports.failed"; // Counter.

/// Must be ran exactly once on startup. This will declare all of the instruments for `metrics`.
pub fn setup(config: Option<&config::MetricConfig>) -> anyhow::Result<()> {
    describe_counter!(REPORTS_RECEIVED, "The number of violation reports POSTed.");
    describe_counter!(
        REPORTS_MALFORMED,
        "The number of violation reports that could not be decoded."
    );
    describe_counter!(
        REPORTS_REJECTED,
        "The number of violation reports that failed validation."
    );
    describe_counter!(REPORTS_STORED, "The number of violation reports stored.");
    describe_counter!(
        REPORTS_FAILED,
        "The number of violation reports that could not be stored."
    );

    if let Some(config) = config {
        match config {
            config::MetricConfig::PrometheusPush(prometheus_config) => {
                PrometheusBuilder::new()
                    .with_push_gateway(
                        prometheus_config.url.clone(),
                        Duration::from_secs(10),
                        None,
                        None,
                    )
                    .context("failed to set up push gateway")?
                    .install()
                    .context("failed to install metrics exporter")?;
            }
        }
    }

    Ok(())
}
