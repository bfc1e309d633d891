//! Prometheus export for the Tether client.
//!
//! The engine records through the `metrics` facade. When `[metrics]` is
//! enabled this module installs a Prometheus recorder with a scrape
//! listener, registers the engine's metric descriptions alongside the
//! client's own, and labels every series with the socket endpoint.

use anyhow::{Context, Result};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{debug, info};

use crate::config::Config;

/// Topics the client joins on connect.
pub const TOPICS_CONFIGURED: &str = "tether_client_topics_configured";

/// Install the Prometheus exporter if the config enables it.
///
/// # Errors
///
/// Returns an error if the recorder or its HTTP listener cannot be started.
pub fn install(config: &Config) -> Result<()> {
    if !config.metrics.enabled {
        debug!("Metrics export disabled");
        return Ok(());
    }

    let addr = config.metrics.listen_addr();
    builder(config)
        .install()
        .with_context(|| format!("Failed to start metrics server on {addr}"))?;
    record_startup(config);

    info!(%addr, "Metrics server listening");
    Ok(())
}

fn builder(config: &Config) -> PrometheusBuilder {
    PrometheusBuilder::new()
        .with_http_listener(config.metrics.listen_addr())
        .add_global_label("endpoint", config.endpoint.clone())
}

fn record_startup(config: &Config) {
    tether_core::metrics::describe_metrics();
    metrics::describe_gauge!(TOPICS_CONFIGURED, "Topics the client joins on connect");
    gauge!(TOPICS_CONFIGURED).set(config.topics.len() as f64);
}
