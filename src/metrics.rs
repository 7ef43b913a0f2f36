use std::{future::Future, time::Instant};
use tracing::trace;

// Counters are trace events under `ceylog.metrics`; the Prometheus recorder only backs /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(target = "ceylog.metrics", route, "requests_total_inc");
}

pub fn delivery_outcome(outcome: &'static str) {
    trace!(target = "ceylog.metrics", outcome, "report_deliveries_total_inc");
}

pub fn rate_gate(decision: &'static str) {
    trace!(target = "ceylog.metrics", decision, "rate_gate_decisions_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "ceylog.metrics",
        stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

/// Awaits `fut` and reports its wall time as `stage`.
pub async fn timed<T, Fut>(stage: &'static str, fut: Fut) -> T
where
    Fut: Future<Output = T>,
{
    let started = Instant::now();
    let out = fut.await;
    stage_elapsed(stage, started.elapsed().as_millis());
    out
}
