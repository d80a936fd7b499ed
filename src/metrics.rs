use tracing::trace;

// Trace-based counters. The Prometheus recorder installed in `main` renders
// whatever a subscriber or exporter layer picks up from these events.

pub fn inc_requests(route: &'static str) {
    trace!(target: "rehoming.metrics", route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target: "rehoming.metrics",
        stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn upload_batch(attempted: usize, succeeded: usize) {
    trace!(
        target: "rehoming.metrics",
        attempted = attempted as u64,
        succeeded = succeeded as u64,
        failed = attempted.saturating_sub(succeeded) as u64,
        "upload_batch"
    );
}

pub fn transition(action: &'static str, outcome: &'static str) {
    trace!(target: "rehoming.metrics", action, outcome, "request_transition");
}
