//! Domain types shared by the store, the executors and the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of cloud object managed through a backend adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    Volume,
    Network,
    SecurityGroup,
    FloatingIp,
    Backup,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Instance,
        ResourceKind::Volume,
        ResourceKind::Network,
        ResourceKind::SecurityGroup,
        ResourceKind::FloatingIp,
        ResourceKind::Backup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::Volume => "volume",
            ResourceKind::Network => "network",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::FloatingIp => "floating_ip",
            ResourceKind::Backup => "backup",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind '{}'", s))
    }
}

/// Lifecycle state of a resource record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    CreationScheduled,
    Creating,
    Ok,
    Updating,
    DeletionScheduled,
    Deleting,
    Deleted,
    Erred,
}

impl ResourceState {
    pub const ALL: [ResourceState; 8] = [
        ResourceState::CreationScheduled,
        ResourceState::Creating,
        ResourceState::Ok,
        ResourceState::Updating,
        ResourceState::DeletionScheduled,
        ResourceState::Deleting,
        ResourceState::Deleted,
        ResourceState::Erred,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::CreationScheduled => "CREATION_SCHEDULED",
            ResourceState::Creating => "CREATING",
            ResourceState::Ok => "OK",
            ResourceState::Updating => "UPDATING",
            ResourceState::DeletionScheduled => "DELETION_SCHEDULED",
            ResourceState::Deleting => "DELETING",
            ResourceState::Deleted => "DELETED",
            ResourceState::Erred => "ERRED",
        }
    }

    /// States in which an operation is underway or queued.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ResourceState::CreationScheduled
                | ResourceState::Creating
                | ResourceState::Updating
                | ResourceState::DeletionScheduled
                | ResourceState::Deleting
        )
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        ResourceState::ALL
            .into_iter()
            .find(|st| st.as_str() == upper)
            .ok_or_else(|| format!("unknown resource state '{}'", s))
    }
}

/// Push operation carried out by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level of a scope in the ownership hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeLevel {
    Customer,
    Tenant,
    Project,
}

impl ScopeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScopeLevel::Customer => "customer",
            ScopeLevel::Tenant => "tenant",
            ScopeLevel::Project => "project",
        }
    }
}

impl FromStr for ScopeLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(ScopeLevel::Customer),
            "tenant" => Ok(ScopeLevel::Tenant),
            "project" => Ok(ScopeLevel::Project),
            other => Err(format!("unknown scope level '{}'", other)),
        }
    }
}

/// Ownership unit. Parents are referenced by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub name: String,
    pub level: ScopeLevel,
    pub parent_id: Option<String>,
}

/// Local durable representation of one managed cloud object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: String,
    pub kind: ResourceKind,
    pub scope_id: String,
    pub backend_id: Option<String>,
    pub state: ResourceState,
    /// Requested properties as submitted with the last intent.
    pub spec: Value,
    /// Spec of an accepted update the backend has not confirmed yet.
    pub pending_spec: Option<Value>,
    /// Backend-reported properties; authoritative once `backend_id` is set.
    pub attributes: Value,
    pub error_message: Option<String>,
    /// Quota reservation currently held by this record.
    pub reservation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// New record awaiting creation on the backend.
    pub fn scheduled(kind: ResourceKind, scope_id: &str, spec: Value) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            scope_id: scope_id.to_string(),
            backend_id: None,
            state: ResourceState::CreationScheduled,
            spec,
            pending_spec: None,
            attributes: Value::Object(Default::default()),
            error_message: None,
            reservation_id: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Record for a resource discovered at the backend.
    pub fn imported(
        kind: ResourceKind,
        scope_id: &str,
        backend_id: &str,
        attributes: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            scope_id: scope_id.to_string(),
            backend_id: Some(backend_id.to_string()),
            state: ResourceState::Ok,
            spec: attributes.clone(),
            pending_spec: None,
            attributes,
            error_message: None,
            reservation_id: None,
            created_at: now,
            modified_at: now,
        }
    }
}

/// Quota metric tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMetric {
    Instances,
    Vcpu,
    Ram,
    Storage,
    Volumes,
    Snapshots,
    SecurityGroupCount,
    SecurityGroupRuleCount,
    FloatingIpCount,
    NetworkCount,
    SubnetCount,
}

impl QuotaMetric {
    pub const ALL: [QuotaMetric; 11] = [
        QuotaMetric::Instances,
        QuotaMetric::Vcpu,
        QuotaMetric::Ram,
        QuotaMetric::Storage,
        QuotaMetric::Volumes,
        QuotaMetric::Snapshots,
        QuotaMetric::SecurityGroupCount,
        QuotaMetric::SecurityGroupRuleCount,
        QuotaMetric::FloatingIpCount,
        QuotaMetric::NetworkCount,
        QuotaMetric::SubnetCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaMetric::Instances => "instances",
            QuotaMetric::Vcpu => "vcpu",
            QuotaMetric::Ram => "ram",
            QuotaMetric::Storage => "storage",
            QuotaMetric::Volumes => "volumes",
            QuotaMetric::Snapshots => "snapshots",
            QuotaMetric::SecurityGroupCount => "security_group_count",
            QuotaMetric::SecurityGroupRuleCount => "security_group_rule_count",
            QuotaMetric::FloatingIpCount => "floating_ip_count",
            QuotaMetric::NetworkCount => "network_count",
            QuotaMetric::SubnetCount => "subnet_count",
        }
    }

    /// Resource kinds whose records contribute to this metric.
    pub fn kinds(&self) -> &'static [ResourceKind] {
        match self {
            QuotaMetric::Instances | QuotaMetric::Vcpu | QuotaMetric::Ram => {
                &[ResourceKind::Instance]
            }
            QuotaMetric::Storage => &[ResourceKind::Volume, ResourceKind::Backup],
            QuotaMetric::Volumes => &[ResourceKind::Volume],
            QuotaMetric::Snapshots => &[ResourceKind::Backup],
            QuotaMetric::SecurityGroupCount | QuotaMetric::SecurityGroupRuleCount => {
                &[ResourceKind::SecurityGroup]
            }
            QuotaMetric::FloatingIpCount => &[ResourceKind::FloatingIp],
            QuotaMetric::NetworkCount | QuotaMetric::SubnetCount => &[ResourceKind::Network],
        }
    }
}

impl fmt::Display for QuotaMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QuotaMetric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown quota metric '{}'", s))
    }
}

/// Amounts per metric requested by or charged to a resource.
pub type Demand = BTreeMap<QuotaMetric, i64>;

/// One usage/limit counter of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub scope_id: String,
    pub metric: QuotaMetric,
    pub usage: i64,
    /// `None` means unlimited.
    pub limit: Option<i64>,
}

/// Ledger counters of one scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub scope_id: String,
    pub entries: Vec<QuotaUsage>,
}

impl QuotaSnapshot {
    pub fn usage(&self, metric: QuotaMetric) -> i64 {
        self.entries
            .iter()
            .find(|e| e.metric == metric)
            .map(|e| e.usage)
            .unwrap_or(0)
    }

    pub fn limit(&self, metric: QuotaMetric) -> Option<i64> {
        self.entries
            .iter()
            .find(|e| e.metric == metric)
            .and_then(|e| e.limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Committed,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Committed => "committed",
            ReservationStatus::Released => "released",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReservationStatus::Pending),
            "committed" => Ok(ReservationStatus::Committed),
            "released" => Ok(ReservationStatus::Released),
            other => Err(format!("unknown reservation status '{}'", other)),
        }
    }
}

/// Token returned by a successful reserve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub scope_id: String,
    pub resource_id: Option<String>,
    pub amounts: Demand,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}

/// Divergence between a ledger counter and the usage derived from records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub id: String,
    pub scope_id: String,
    pub metric: QuotaMetric,
    pub recorded: i64,
    pub computed: i64,
    /// Consecutive reconciliation passes that observed the divergence.
    pub passes: u32,
    pub corrected: bool,
    pub resolved: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}
