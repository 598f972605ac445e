use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Install the Prometheus recorder with its own HTTP listener on `addr`.
pub fn setup_metrics_recorder(addr: &str) -> Result<()> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    let addr: SocketAddr = addr.parse().context("invalid metrics_addr")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(
            Matcher::Full("db_upsert_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("blob_upload_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )?
        .install()
        .context("installing prometheus recorder")?;
    Ok(())
}

/// Recording surface injected into the persister and the blob sink.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_upsert_time(&self, duration: Duration) {
        metrics::histogram!("db_upsert_seconds", duration.as_secs_f64());
    }

    pub fn record_blob_upload_time(&self, duration: Duration) {
        metrics::histogram!("blob_upload_seconds", duration.as_secs_f64());
    }

    pub fn record_blob_upload_failed(&self) {
        metrics::increment_counter!("blob_upload_failures_total");
    }

    pub fn record_height_persisted(&self) {
        metrics::increment_counter!("heights_persisted_total");
    }

    pub fn record_persist_failed(&self) {
        metrics::increment_counter!("persist_failures_total");
    }

    pub fn record_chain_tip(&self, height: i64) {
        metrics::gauge!("chain_tip_height", height as f64);
    }
}
