//! Events emitted by store changes.

use crate::model::{DriftReport, QuotaMetric, ResourceRecord, ResourceState};

/// Events emitted after a store transaction commits.
///
/// These events are dispatched via a broadcast channel to subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    // Resource events
    /// A record was inserted (intent accepted or resource imported).
    ResourceCreated(ResourceRecord),
    /// A record moved between lifecycle states.
    ResourceStateChanged {
        id: String,
        from: ResourceState,
        to: ResourceState,
    },
    /// Attributes or backend id of a record changed without a state change.
    ResourcePatched { id: String },

    // Ledger events
    /// Usage of a scope chain changed.
    QuotaChanged { scope_id: String },
    /// A limit was set or removed.
    LimitChanged {
        scope_id: String,
        metric: QuotaMetric,
        limit: Option<i64>,
    },
    /// A drift report was opened or updated.
    DriftRecorded(DriftReport),
}

impl Event {
    /// Get the object type for this event.
    pub fn resource_type(&self) -> &'static str {
        match self {
            Event::ResourceCreated(_)
            | Event::ResourceStateChanged { .. }
            | Event::ResourcePatched { .. } => "resource",
            Event::QuotaChanged { .. } | Event::LimitChanged { .. } | Event::DriftRecorded(_) => {
                "quota"
            }
        }
    }

    /// Get the object ID for this event.
    pub fn resource_id(&self) -> &str {
        match self {
            Event::ResourceCreated(r) => &r.id,
            Event::ResourceStateChanged { id, .. } => id,
            Event::ResourcePatched { id } => id,
            Event::QuotaChanged { scope_id } => scope_id,
            Event::LimitChanged { scope_id, .. } => scope_id,
            Event::DriftRecorded(d) => &d.scope_id,
        }
    }
}
