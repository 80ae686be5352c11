//! Metrics for the dispatch path and the device pool
//!
//! Counters are labelled by tenant and, where one was chosen, by instance.

use metrics::{counter, gauge};

/// Record a message the gateway accepted
pub fn record_sent(tenant_id: &str, instance_id: &str) {
    counter!(
        "wa_dispatch_sent_total",
        "tenant" => tenant_id.to_string(),
        "instance" => instance_id.to_string()
    )
    .increment(1);
}

/// Record a send that reached the gateway and failed (transport or ban)
pub fn record_failed(tenant_id: &str, instance_id: &str, reason: &str) {
    counter!(
        "wa_dispatch_failed_total",
        "tenant" => tenant_id.to_string(),
        "instance" => instance_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a dispatch rejected by hourly/daily quota or a gateway 429
pub fn record_rate_limited(tenant_id: &str, instance_id: &str) {
    counter!(
        "wa_dispatch_rate_limited_total",
        "tenant" => tenant_id.to_string(),
        "instance" => instance_id.to_string()
    )
    .increment(1);
}

/// Record a dispatch that found no usable instance
pub fn record_no_instance(tenant_id: &str, role: &str) {
    counter!(
        "wa_dispatch_no_instance_total",
        "tenant" => tenant_id.to_string(),
        "role" => role.to_string()
    )
    .increment(1);
}

/// Record a presence/typing call that failed without aborting the send
pub fn record_behavioral_soft_fail(instance_id: &str, step: &str) {
    counter!(
        "wa_dispatch_behavioral_soft_fail_total",
        "instance" => instance_id.to_string(),
        "step" => step.to_string()
    )
    .increment(1);
}

/// Record a selection that fell back to a non-compliant instance
pub fn record_degraded_selection(tenant_id: &str) {
    counter!(
        "wa_registry_degraded_selection_total",
        "tenant" => tenant_id.to_string()
    )
    .increment(1);
}

/// Update the health score gauge for an instance
pub fn set_instance_score(instance_id: &str, score: f64) {
    gauge!(
        "wa_registry_instance_score",
        "instance" => instance_id.to_string()
    )
    .set(score);
}
