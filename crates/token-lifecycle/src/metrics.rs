//! Refresh cycle metrics
//!
//! Recorded through the `metrics` facade; without an installed recorder
//! every call is a no-op.
//!
//! - `credential_refresh_total` (counter): labels `outcome`, `reason`
//! - `credential_escalations_total` (counter): label `error_type`
//! - `credential_binding_failures_total` (counter)
//! - `credential_expires_in_seconds` (gauge): lifetime left on the stored credential

use std::time::Duration;

use crate::fetcher::RefreshReason;

/// Record one fetch attempt. `outcome` is `"success"` or an error kind.
pub fn record_refresh(reason: RefreshReason, outcome: &'static str) {
    metrics::counter!(
        "credential_refresh_total",
        "outcome" => outcome,
        "reason" => reason.label()
    )
    .increment(1);
}

/// Record an `ExpiryImminent` escalation.
pub fn record_escalation(error_type: &'static str) {
    metrics::counter!("credential_escalations_total", "error_type" => error_type).increment(1);
}

pub fn record_binding_failure() {
    metrics::counter!("credential_binding_failures_total").increment(1);
}

/// Publish the remaining lifetime of the freshly stored credential.
pub fn record_expires_in(remaining: Duration) {
    metrics::gauge!("credential_expires_in_seconds").set(remaining.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_refresh(RefreshReason::Scheduled, "success");
        record_escalation("transport");
        record_binding_failure();
        record_expires_in(Duration::from_secs(900));
    }

    #[test]
    fn refresh_counter_carries_outcome_and_reason() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_refresh(RefreshReason::Scheduled, "success");
        record_refresh(RefreshReason::Retry, "transport");

        let output = handle.render();
        assert!(output.contains("credential_refresh_total"));
        assert!(output.contains("outcome=\"success\""));
        assert!(output.contains("reason=\"scheduled\""));
        assert!(output.contains("outcome=\"transport\""));
        assert!(output.contains("reason=\"retry\""));
    }

    #[test]
    fn escalation_and_binding_counters_render() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_escalation("unauthorized");
        record_binding_failure();
        record_expires_in(Duration::from_secs(840));

        let output = handle.render();
        assert!(output.contains("credential_escalations_total"));
        assert!(output.contains("error_type=\"unauthorized\""));
        assert!(output.contains("credential_binding_failures_total"));
        assert!(output.contains("credential_expires_in_seconds"));
    }
}
