//! Prometheus exporter wiring.
//!
//! A single global recorder installed once at startup; everywhere else in
//! the crate just calls the `metrics` crate macros directly.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}
