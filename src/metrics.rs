use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

/// Installs the Prometheus recorder. Without it the `metrics` macros are
/// no-ops, which is fine for library users and tests.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder install failed (possibly already installed): {}", e);
            None
        }
    }
}

pub fn pushgateway_url(base: &str, job: &str) -> String {
    format!("{}/metrics/job/{}", base.trim_end_matches('/'), job)
}

/// Pushes the current snapshot to a Pushgateway. A scheduled batch job has
/// nothing to scrape, so this runs once at the end of a run. Failures are
/// logged only.
pub async fn push_metrics(handle: &PrometheusHandle, base: &str, job: &str) {
    let url = pushgateway_url(base, job);
    let body = handle.render();

    let result = reqwest::Client::new()
        .put(&url)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .send()
        .await;

    match result {
        Ok(r) if r.status().is_success() => info!("Pushed metrics to {}", url),
        Ok(r) => warn!("Pushgateway responded with status {} for {}", r.status().as_u16(), url),
        Err(e) => warn!("Failed to push metrics to {}: {}", url, e),
    }
}
