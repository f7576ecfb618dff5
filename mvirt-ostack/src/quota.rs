//! Hierarchical quota ledger.
//!
//! Counters exist per (scope, metric) and every counter of a scope includes
//! the usage of its descendants. A reservation increments the whole chain
//! from the project up to the customer in one transaction, after checking
//! every limit on that chain.
//!
//! Reservation tokens move `pending -> committed -> released`. Commit and
//! release are idempotent, so an executor delivered twice cannot count twice.

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::OstackAuditLogger;
use crate::config::QuotaConfig;
use crate::error::{Result, SyncError};
use crate::model::{
    Demand, DriftReport, QuotaMetric, QuotaSnapshot, QuotaUsage, Reservation, ResourceKind,
    ResourceRecord,
};
use crate::store::{DataStore, RecordFilter, ReserveRequest};

/// Quota demand of a resource.
///
/// Backend attributes win over the requested spec when both carry a field,
/// so the demand of a created resource reflects what the backend reports.
pub fn demand(kind: ResourceKind, spec: &Value, attributes: &Value) -> Demand {
    let number = |keys: &[&str]| -> i64 {
        keys.iter()
            .find_map(|key| attributes.get(*key).or_else(|| spec.get(*key)))
            .and_then(Value::as_i64)
            .unwrap_or(0)
            .max(0)
    };
    let count = |key: &str| -> i64 {
        attributes
            .get(key)
            .or_else(|| spec.get(key))
            .and_then(Value::as_array)
            .map(|items| items.len() as i64)
            .unwrap_or(0)
    };

    let mut demand = Demand::new();
    let mut add = |metric: QuotaMetric, amount: i64| {
        if amount > 0 {
            demand.insert(metric, amount);
        }
    };

    match kind {
        ResourceKind::Instance => {
            add(QuotaMetric::Instances, 1);
            add(QuotaMetric::Vcpu, number(&["vcpu", "cores"]));
            add(QuotaMetric::Ram, number(&["ram"]));
        }
        ResourceKind::Volume => {
            add(QuotaMetric::Volumes, 1);
            add(QuotaMetric::Storage, number(&["size"]));
        }
        ResourceKind::Backup => {
            add(QuotaMetric::Snapshots, 1);
            add(QuotaMetric::Storage, number(&["size"]));
        }
        ResourceKind::Network => {
            add(QuotaMetric::NetworkCount, 1);
            add(QuotaMetric::SubnetCount, count("subnets"));
        }
        ResourceKind::SecurityGroup => {
            add(QuotaMetric::SecurityGroupCount, 1);
            add(QuotaMetric::SecurityGroupRuleCount, count("rules"));
        }
        ResourceKind::FloatingIp => {
            add(QuotaMetric::FloatingIpCount, 1);
        }
    }
    demand
}

/// Outcome of recomputing one scope.
#[derive(Debug, Clone)]
pub struct RecomputeReport {
    pub scope_id: String,
    /// Counters after any correction.
    pub counters: Vec<QuotaUsage>,
    /// Divergences observed in this pass.
    pub drift: Vec<DriftReport>,
    /// Metrics whose counter was overwritten.
    pub corrected: Vec<QuotaMetric>,
}

pub struct QuotaLedger {
    store: Arc<dyn DataStore>,
    config: QuotaConfig,
    audit: Arc<OstackAuditLogger>,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn DataStore>,
        config: QuotaConfig,
        audit: Arc<OstackAuditLogger>,
    ) -> Self {
        Self {
            store,
            config,
            audit,
        }
    }

    /// Reserve `amount` of one metric along the chain of `scope_id`.
    pub async fn reserve(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        amount: i64,
    ) -> Result<Reservation> {
        let mut amounts = Demand::new();
        amounts.insert(metric, amount);
        self.reserve_demand(scope_id, amounts).await
    }

    pub async fn reserve_demand(&self, scope_id: &str, amounts: Demand) -> Result<Reservation> {
        self.submit(ReserveRequest {
            scope_id: scope_id.to_string(),
            amounts,
            enforce_limits: true,
            committed: false,
            record: None,
        })
        .await
    }

    /// Reserve the demand of a new record and insert the record holding it.
    pub async fn reserve_for(
        &self,
        record: ResourceRecord,
        amounts: Demand,
    ) -> Result<Reservation> {
        self.submit(ReserveRequest {
            scope_id: record.scope_id.clone(),
            amounts,
            enforce_limits: true,
            committed: false,
            record: Some(record),
        })
        .await
    }

    /// Charge an imported resource without a limit check.
    ///
    /// Going over a limit is logged, not refused.
    pub async fn adopt(&self, record: ResourceRecord) -> Result<Reservation> {
        let amounts = demand(record.kind, &record.spec, &record.attributes);
        let scope_id = record.scope_id.clone();
        let reservation = self
            .submit(ReserveRequest {
                scope_id: scope_id.clone(),
                amounts: amounts.clone(),
                enforce_limits: false,
                committed: true,
                record: Some(record),
            })
            .await?;

        let snapshot = self.snapshot(&scope_id).await?;
        for metric in amounts.keys() {
            if let Some(limit) = snapshot.limit(*metric)
                && snapshot.usage(*metric) > limit
            {
                warn!(
                    scope = %scope_id,
                    metric = %metric,
                    usage = snapshot.usage(*metric),
                    limit,
                    "Imported resource pushes usage over limit"
                );
            }
        }
        Ok(reservation)
    }

    async fn submit(&self, request: ReserveRequest) -> Result<Reservation> {
        match self.store.reserve(request).await {
            Ok(reservation) => {
                debug!(reservation = %reservation.id, scope = %reservation.scope_id, "Quota reserved");
                Ok(reservation)
            }
            Err(e) => {
                let err = SyncError::from(e);
                if let SyncError::QuotaExceeded {
                    scope_id,
                    metric,
                    requested,
                    ..
                } = &err
                {
                    self.audit.quota_exceeded(scope_id, *metric, *requested);
                }
                Err(err)
            }
        }
    }

    /// Mark a reservation committed. Repeated or late commits are no-ops.
    pub async fn commit(&self, reservation_id: &str) -> Result<()> {
        if !self.store.commit_reservation(reservation_id).await? {
            debug!(reservation = %reservation_id, "Reservation already committed or released");
        }
        Ok(())
    }

    /// Give the reserved amounts back exactly once.
    pub async fn release(&self, reservation_id: &str) -> Result<()> {
        if self.store.release_reservation(reservation_id).await? {
            debug!(reservation = %reservation_id, "Quota released");
        } else {
            debug!(reservation = %reservation_id, "Reservation already released");
        }
        Ok(())
    }

    pub async fn snapshot(&self, scope_id: &str) -> Result<QuotaSnapshot> {
        if self.store.get_scope(scope_id).await?.is_none() {
            return Err(SyncError::NotFound(format!("scope '{}'", scope_id)));
        }
        Ok(QuotaSnapshot {
            scope_id: scope_id.to_string(),
            entries: self.store.get_quota(scope_id).await?,
        })
    }

    pub async fn set_limit(
        &self,
        scope_id: &str,
        metric: QuotaMetric,
        limit: Option<i64>,
    ) -> Result<QuotaUsage> {
        if let Some(limit) = limit
            && limit < 0
        {
            return Err(SyncError::InvalidIntent(format!(
                "limit for {} must not be negative",
                metric
            )));
        }
        let usage = self.store.set_limit(scope_id, metric, limit).await?;
        info!(scope = %scope_id, metric = %metric, limit = ?limit, "Quota limit set");
        Ok(usage)
    }

    /// Derive the usage of `scope_id` from the records holding quota in its
    /// subtree and compare it with the counters.
    ///
    /// A divergence beyond the tolerance is reported. The counter is only
    /// overwritten once the divergence has been seen on enough consecutive
    /// passes and no reservation in the subtree is pending.
    pub async fn recompute(&self, scope_id: &str) -> Result<RecomputeReport> {
        let subtree = self.store.scope_subtree(scope_id).await?;
        let subtree_ids: Vec<String> = subtree.iter().map(|s| s.id.clone()).collect();

        let mut computed = Demand::new();
        for id in &subtree_ids {
            let records = self.store.list_records(&RecordFilter::scope(id)).await?;
            for record in records.iter().filter(|r| r.reservation_id.is_some()) {
                for (metric, amount) in demand(record.kind, &record.spec, &record.attributes) {
                    *computed.entry(metric).or_insert(0) += amount;
                }
            }
        }

        let recorded = self.store.get_quota(scope_id).await?;
        let pending = self.store.count_pending_reservations(&subtree_ids).await?;

        let metrics: BTreeSet<QuotaMetric> = computed
            .keys()
            .copied()
            .chain(recorded.iter().map(|q| q.metric))
            .collect();

        let mut drift = Vec::new();
        let mut corrected = Vec::new();
        for metric in metrics {
            let recorded_usage = recorded
                .iter()
                .find(|q| q.metric == metric)
                .map(|q| q.usage)
                .unwrap_or(0);
            let computed_usage = computed.get(&metric).copied().unwrap_or(0);

            if (recorded_usage - computed_usage).abs() <= self.config.drift_tolerance {
                self.store.resolve_drift(scope_id, metric, false).await?;
                continue;
            }

            let report = self
                .store
                .record_drift(scope_id, metric, recorded_usage, computed_usage)
                .await?;
            self.audit
                .ledger_drift(scope_id, metric, recorded_usage, computed_usage);

            if report.passes >= self.config.drift_confirm_passes && pending == 0 {
                self.store
                    .overwrite_usage(scope_id, metric, computed_usage)
                    .await?;
                self.store.resolve_drift(scope_id, metric, true).await?;
                self.audit.ledger_corrected(scope_id, metric, computed_usage);
                corrected.push(metric);
            }
            drift.push(report);
        }

        Ok(RecomputeReport {
            scope_id: scope_id.to_string(),
            counters: self.store.get_quota(scope_id).await?,
            drift,
            corrected,
        })
    }

    pub async fn drift_reports(&self, scope_id: &str) -> Result<Vec<DriftReport>> {
        if self.store.get_scope(scope_id).await?.is_none() {
            return Err(SyncError::NotFound(format!("scope '{}'", scope_id)));
        }
        Ok(self.store.list_drift(scope_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_instance_demand() {
        let d = demand(
            ResourceKind::Instance,
            &json!({"vcpu": 4, "ram": 8192, "name": "web"}),
            &json!({}),
        );
        assert_eq!(d.get(&QuotaMetric::Instances), Some(&1));
        assert_eq!(d.get(&QuotaMetric::Vcpu), Some(&4));
        assert_eq!(d.get(&QuotaMetric::Ram), Some(&8192));
    }

    #[test]
    fn test_attributes_override_spec() {
        let d = demand(
            ResourceKind::Volume,
            &json!({"size": 10}),
            &json!({"size": 20, "status": "available"}),
        );
        assert_eq!(d.get(&QuotaMetric::Storage), Some(&20));
        assert_eq!(d.get(&QuotaMetric::Volumes), Some(&1));
    }

    #[test]
    fn test_counted_children() {
        let d = demand(
            ResourceKind::SecurityGroup,
            &json!({"rules": [{"port": 22}, {"port": 443}]}),
            &Value::Null,
        );
        assert_eq!(d.get(&QuotaMetric::SecurityGroupRuleCount), Some(&2));

        let d = demand(ResourceKind::Network, &json!({}), &Value::Null);
        assert_eq!(d.get(&QuotaMetric::NetworkCount), Some(&1));
        assert!(!d.contains_key(&QuotaMetric::SubnetCount));
    }

    #[test]
    fn test_negative_amounts_are_ignored() {
        let d = demand(ResourceKind::Instance, &json!({"vcpu": -3}), &Value::Null);
        assert!(!d.contains_key(&QuotaMetric::Vcpu));
    }
}
