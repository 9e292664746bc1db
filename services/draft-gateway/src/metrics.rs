//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`
//! - `keypool_credentials` (gauge): label `state`
//!
//! The key-pool crate records its own dispatch counters through the same
//! `metrics` facade.

use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use key_pool::{CredentialState, StatusSnapshot};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_DURATION: &str = "gateway_request_duration_seconds";

/// Requests include rotation backoff and batch pacing, so buckets run to
/// several minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

const STATES: [CredentialState; 4] = [
    CredentialState::Available,
    CredentialState::InUse,
    CredentialState::Exhausted,
    CredentialState::Errored,
];

fn builder() -> anyhow::Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
        .context("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a completed HTTP request.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!(REQUEST_DURATION, "route" => route).record(duration_secs);
}

/// Per-state key count gauges fed from pool snapshots.
///
/// Snapshots can be delivered out of order when pool changes race; one older
/// than the last published version leaves the gauges alone.
#[derive(Debug, Default)]
pub struct CredentialGauges {
    last_version: Mutex<Option<u64>>,
}

impl CredentialGauges {
    /// Publish `snapshot` unless a newer one was already published.
    pub fn record(&self, snapshot: &StatusSnapshot) -> bool {
        let mut last = self
            .last_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if last.is_some_and(|v| v > snapshot.version) {
            return false;
        }
        *last = Some(snapshot.version);
        for state in STATES {
            metrics::gauge!("keypool_credentials", "state" => state.label())
                .set(snapshot.count(state) as f64);
        }
        true
    }
}
