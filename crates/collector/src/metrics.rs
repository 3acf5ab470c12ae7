use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, Encoder, IntCounter,
    IntCounterVec, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref WORKLOADS_COLLECTED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "chargeback_workloads_collected_total",
        "Workloads normalized, by kind.",
        &["kind"],
        REGISTRY
    )
    .unwrap();
    pub static ref WORKLOADS_SKIPPED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "chargeback_workloads_skipped_total",
        "Workloads skipped because their manifest could not be normalized.",
        REGISTRY
    )
    .unwrap();
    pub static ref SNAPSHOTS_INSERTED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "chargeback_snapshots_inserted_total",
        "Allocation snapshots written. Re-runs of a stored window do not count.",
        REGISTRY
    )
    .unwrap();
    pub static ref INVENTORY_APPENDED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "chargeback_inventory_appended_total",
        "Workload inventory rows appended.",
        REGISTRY
    )
    .unwrap();
    pub static ref BUDGET_ALERTS_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "chargeback_budget_alerts_total",
        "Budget alerts raised, by severity.",
        &["severity"],
        REGISTRY
    )
    .unwrap();
    pub static ref WEBHOOK_DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "chargeback_webhook_deliveries_total",
        "Webhook deliveries, by outcome.",
        &["outcome"],
        REGISTRY
    )
    .unwrap();
}

// Text exposition of everything in REGISTRY
pub fn gather_metrics() -> crate::Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| crate::Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| crate::Error::Internal(format!("Metrics are not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_counters() {
        WORKLOADS_COLLECTED_TOTAL.with_label_values(&["Deployment"]).inc();
        WEBHOOK_DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
        SNAPSHOTS_INSERTED_TOTAL.inc();

        let text = gather_metrics().unwrap();
        assert!(text.contains("chargeback_workloads_collected_total{kind=\"Deployment\"}"));
        assert!(text.contains("chargeback_webhook_deliveries_total{outcome=\"success\"}"));
        assert!(text.contains("chargeback_snapshots_inserted_total"));
    }
}
