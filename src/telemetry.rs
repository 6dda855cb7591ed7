use tracing_subscriber::EnvFilter;

use crate::types::TenantId;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_tenant(name: &'static str, tenant_id: &TenantId) {
    metrics::increment_counter!(name, "tenant" => tenant_id.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_tenant(_name: &'static str, _tenant_id: &TenantId) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_reason(name: &'static str, reason: &'static str) {
    metrics::increment_counter!(name, "reason" => reason);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_reason(_name: &'static str, _reason: &'static str) {}

/// Install the global `fmt` subscriber, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,webhook_gateway=debug"));

    // Ignore the error if a subscriber is already installed (tests).
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
