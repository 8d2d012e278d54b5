//! Pipeline metrics
//!
//! - `session_refresh_total` (counter): label `outcome` (`success`, `failure`, `abandoned`)
//! - `session_requests_queued_total` (counter): requests parked behind an in-flight refresh
//! - `session_unauthorized_total` (counter): terminal authorization failures

/// Record how a refresh cycle settled.
pub fn record_refresh(outcome: &'static str) {
    metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
}

/// Record a request queued behind an in-flight refresh.
pub fn record_queued() {
    metrics::counter!("session_requests_queued_total").increment(1);
}

/// Record a terminal authorization failure.
pub fn record_unauthorized() {
    metrics::counter!("session_unauthorized_total").increment(1);
}
