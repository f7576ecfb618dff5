use std::sync::Arc;
use tracing::{info, warn};

use crate::model::{QuotaMetric, ResourceKind, ResourceState};

/// Audit trail of lifecycle and ledger events.
///
/// Entries go to the `audit` tracing target with the ids of the objects
/// involved, so they can be routed separately from operational logs.
pub struct OstackAuditLogger {
    enabled: bool,
}

impl OstackAuditLogger {
    pub fn new() -> Self {
        Self { enabled: true }
    }

    pub fn new_noop() -> Self {
        Self { enabled: false }
    }

    fn audit(&self, message: String, object_ids: Vec<String>) {
        if self.enabled {
            info!(target: "audit", component = "ostack", object_ids = ?object_ids, "{}", message);
        }
    }

    fn alert(&self, message: String, object_ids: Vec<String>) {
        if self.enabled {
            warn!(target: "audit", component = "ostack", object_ids = ?object_ids, "{}", message);
        }
    }

    // Intent events
    pub fn intent_accepted(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        operation: &str,
        scope_id: &str,
    ) {
        self.audit(
            format!("{} {} accepted in scope {}", kind, operation, scope_id),
            vec![resource_id.to_string(), scope_id.to_string()],
        );
    }

    pub fn intent_cancelled(&self, resource_id: &str) {
        self.audit(
            format!("Pending operation cancelled: {}", resource_id),
            vec![resource_id.to_string()],
        );
    }

    pub fn quota_exceeded(&self, scope_id: &str, metric: QuotaMetric, requested: i64) {
        self.alert(
            format!("Quota exceeded in {}: {} (+{})", scope_id, metric, requested),
            vec![scope_id.to_string()],
        );
    }

    pub fn quota_limit_set(&self, scope_id: &str, metric: QuotaMetric, limit: Option<i64>) {
        let limit = limit.map_or_else(|| "unlimited".to_string(), |l| l.to_string());
        self.audit(
            format!("Quota limit of {} in {} set to {}", metric, scope_id, limit),
            vec![scope_id.to_string()],
        );
    }

    // Lifecycle events
    pub fn state_changed(&self, resource_id: &str, from: ResourceState, to: ResourceState) {
        self.audit(
            format!("Resource {}: {} -> {}", resource_id, from, to),
            vec![resource_id.to_string()],
        );
    }

    pub fn resource_erred(&self, resource_id: &str, message: &str) {
        self.alert(
            format!("Resource {} erred: {}", resource_id, message),
            vec![resource_id.to_string()],
        );
    }

    pub fn resource_recovered(&self, resource_id: &str) {
        self.audit(
            format!("Resource {} recovered by operator", resource_id),
            vec![resource_id.to_string()],
        );
    }

    // Reconciliation events
    pub fn resource_imported(&self, resource_id: &str, kind: ResourceKind, backend_id: &str) {
        self.audit(
            format!("Imported {} {} as {}", kind, backend_id, resource_id),
            vec![resource_id.to_string(), backend_id.to_string()],
        );
    }

    pub fn resource_disappeared(&self, resource_id: &str, backend_id: &str) {
        self.alert(
            format!("Resource {} ({}) disappeared from backend", resource_id, backend_id),
            vec![resource_id.to_string(), backend_id.to_string()],
        );
    }

    pub fn ledger_drift(&self, scope_id: &str, metric: QuotaMetric, recorded: i64, computed: i64) {
        self.alert(
            format!(
                "Ledger drift in {} for {}: recorded {}, computed {}",
                scope_id, metric, recorded, computed
            ),
            vec![scope_id.to_string()],
        );
    }

    pub fn ledger_corrected(&self, scope_id: &str, metric: QuotaMetric, usage: i64) {
        self.audit(
            format!("Ledger counter {} of {} corrected to {}", metric, scope_id, usage),
            vec![scope_id.to_string()],
        );
    }
}

impl Default for OstackAuditLogger {
    fn default() -> Self {
        Self::new()
    }
}

pub fn create_audit_logger() -> Arc<OstackAuditLogger> {
    Arc::new(OstackAuditLogger::new())
}
