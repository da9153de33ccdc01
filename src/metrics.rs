//! Metrics instrumentation for consul-dns.
//!
//! All metrics are prefixed with `consul_dns.`

use metrics::{counter, describe_counter, gauge, histogram};
use std::time::Instant;

/// Register the request counters with their help text so they export at
/// zero before the first increment.
pub fn register() {
    describe_counter!(
        "consul_dns.served_requests_total",
        "Counter of DNS requests answered from the catalog or upstream."
    );
    describe_counter!(
        "consul_dns.denied_requests_total",
        "Counter of DNS requests denied by a service ACL."
    );
    describe_counter!(
        "consul_dns.dropped_requests_total",
        "Counter of DNS requests for unsupported record types."
    );
    describe_counter!(
        "consul_dns.blocked_requests_total",
        "Counter of DNS requests blocked before resolution."
    );
    counter!("consul_dns.denied_requests_total").absolute(0);
    counter!("consul_dns.dropped_requests_total").absolute(0);
    counter!("consul_dns.blocked_requests_total").absolute(0);
}

/// Where an answer came from.
#[derive(Debug, Clone, Copy)]
pub enum AnswerSource {
    /// Addresses found in the aggregated catalog.
    Api,
    /// Addresses resolved through the upstream lookup.
    Dns,
}

impl AnswerSource {
    fn as_str(self) -> &'static str {
        match self {
            AnswerSource::Api => "api",
            AnswerSource::Dns => "dns",
        }
    }
}

/// Record a query answered by this server.
pub fn record_served(source: AnswerSource) {
    counter!("consul_dns.served_requests_total", "source" => source.as_str()).increment(1);
}

/// Record a query denied by a service ACL.
pub fn record_denied() {
    counter!("consul_dns.denied_requests_total").increment(1);
}

/// Record a query for a record type this server does not answer.
pub fn record_dropped() {
    counter!("consul_dns.dropped_requests_total").increment(1);
}

/// Outcome of one watch refresh round.
#[derive(Debug, Clone, Copy)]
pub enum RefreshOutcome {
    /// The registry index advanced and a new snapshot was published.
    Changed,
    /// The long poll returned without an index change.
    Unchanged,
    /// The fetch or process step failed.
    Error,
}

impl RefreshOutcome {
    fn as_str(self) -> &'static str {
        match self {
            RefreshOutcome::Changed => "changed",
            RefreshOutcome::Unchanged => "unchanged",
            RefreshOutcome::Error => "error",
        }
    }
}

/// Record the outcome and duration of a watch refresh.
pub fn record_watch_refresh(watch: &str, outcome: RefreshOutcome, duration: std::time::Duration) {
    counter!("consul_dns.watch.refresh.count", "watch" => watch.to_string(), "outcome" => outcome.as_str())
        .increment(1);
    histogram!("consul_dns.watch.refresh.duration.seconds", "watch" => watch.to_string())
        .record(duration.as_secs_f64());
}

/// Record a supervisor retry after a failed refresh.
pub fn record_watch_retry(watch: &str) {
    counter!("consul_dns.watch.retry.count", "watch" => watch.to_string()).increment(1);
}

/// Record per-source service counts, readiness, and refresh age.
pub fn record_source_state(watch: &str, services: usize, ready: bool, refresh_age: Option<f64>) {
    gauge!("consul_dns.source.services.count", "watch" => watch.to_string()).set(services as f64);
    gauge!("consul_dns.source.ready", "watch" => watch.to_string())
        .set(if ready { 1.0 } else { 0.0 });
    if let Some(age) = refresh_age {
        gauge!("consul_dns.source.refresh.age.seconds", "watch" => watch.to_string()).set(age);
    }
}

/// Record the aggregated service count and overall readiness.
pub fn record_catalog_state(services: usize, ready: bool, last_update_age: Option<f64>) {
    gauge!("consul_dns.catalog.services.count").set(services as f64);
    gauge!("consul_dns.catalog.ready").set(if ready { 1.0 } else { 0.0 });
    if let Some(age) = last_update_age {
        gauge!("consul_dns.catalog.last_update.age.seconds").set(age);
    }
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
