//! Prometheus recorder and `/metrics` rendering.
//!
//! Metric names live in [`shardgate_core::metrics`].

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Call once at startup, before anything records. Fails if another
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

#[cfg(test)]
mod tests {
    use shardgate_core::metrics::COMMANDS_ROUTED_TOTAL;

    use super::*;

    #[test]
    fn local_recorder_renders_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(COMMANDS_ROUTED_TOTAL, "origin" => "websocket").increment(2);
        });
        let text = render(&handle);
        assert!(text.contains(COMMANDS_ROUTED_TOTAL));
        assert!(text.contains("origin=\"websocket\""));
    }
}
