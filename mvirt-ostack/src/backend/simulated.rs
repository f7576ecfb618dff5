//! In-memory cloud used by `--dev` mode and the test suites.
//!
//! Objects settle after a configurable number of `fetch` calls, failures can
//! be queued per kind and call, and objects can be created or removed behind
//! the back of the engine to exercise pull reconciliation.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{
    AdapterRegistry, BackendAdapter, BackendError, BackendObject, BackendResource, BackendStatus,
    CreateRequest,
};
use crate::model::ResourceKind;

/// Polls left value that never counts down.
const HELD: u32 = u32::MAX;

/// Adapter call, used to target injected failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCall {
    Create,
    Update,
    Delete,
    Fetch,
    List,
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Building,
    Updating,
    Active,
    Deleting,
    Failed(String),
}

impl Phase {
    fn status_text(&self) -> &'static str {
        match self {
            Phase::Building => "building",
            Phase::Updating => "updating",
            Phase::Active => "available",
            Phase::Deleting => "deleting",
            Phase::Failed(_) => "error",
        }
    }

    fn status(&self) -> BackendStatus {
        match self {
            Phase::Building | Phase::Updating | Phase::Deleting => BackendStatus::Pending,
            Phase::Active => BackendStatus::Stable,
            Phase::Failed(msg) => BackendStatus::Error(msg.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct SimObject {
    kind: ResourceKind,
    scope_id: String,
    attributes: Map<String, Value>,
    local_ref: Option<String>,
    phase: Phase,
    polls_left: u32,
}

impl SimObject {
    fn attributes(&self) -> Value {
        let mut attributes = self.attributes.clone();
        attributes.insert(
            "status".to_string(),
            Value::String(self.phase.status_text().to_string()),
        );
        Value::Object(attributes)
    }

    fn observe(&self, backend_id: &str) -> BackendObject {
        BackendObject {
            backend_id: backend_id.to_string(),
            status: self.phase.status(),
            attributes: self.attributes(),
        }
    }
}

#[derive(Default)]
struct CloudState {
    objects: BTreeMap<String, SimObject>,
    settle_polls: u32,
    failures: HashMap<(ResourceKind, SimCall), VecDeque<BackendError>>,
    calls: HashMap<(ResourceKind, SimCall), u32>,
}

impl CloudState {
    /// Count the call and pop an injected failure, if any.
    fn enter(&mut self, kind: ResourceKind, call: SimCall) -> Result<(), BackendError> {
        *self.calls.entry((kind, call)).or_default() += 1;
        match self
            .failures
            .get_mut(&(kind, call))
            .and_then(|queue| queue.pop_front())
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn object(
        &mut self,
        kind: ResourceKind,
        backend_id: &str,
    ) -> Result<&mut SimObject, BackendError> {
        self.objects
            .get_mut(backend_id)
            .filter(|o| o.kind == kind)
            .ok_or_else(|| BackendError::NotFound(format!("{} {}", kind, backend_id)))
    }
}

fn merge(target: &mut Map<String, Value>, spec: &Value) {
    if let Value::Object(fields) = spec {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// Shared in-memory cloud. Cloning yields a handle to the same cloud.
#[derive(Clone, Default)]
pub struct SimulatedCloud {
    state: Arc<Mutex<CloudState>>,
}

impl SimulatedCloud {
    /// Cloud whose operations settle immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cloud whose operations need `polls` fetches before they settle.
    pub fn with_settle_polls(polls: u32) -> Self {
        let cloud = Self::new();
        cloud.set_settle_polls(polls);
        cloud
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_settle_polls(&self, polls: u32) {
        self.state().settle_polls = polls;
    }

    pub fn adapter(&self, kind: ResourceKind) -> Arc<dyn BackendAdapter> {
        Arc::new(SimulatedAdapter {
            kind,
            cloud: self.clone(),
        })
    }

    /// Registry with an adapter for every resource kind.
    pub fn registry(&self) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for kind in ResourceKind::ALL {
            registry.register(self.adapter(kind));
        }
        registry
    }

    /// Queue a failure returned by the next matching call.
    pub fn fail_next(&self, kind: ResourceKind, call: SimCall, error: BackendError) {
        self.state()
            .failures
            .entry((kind, call))
            .or_default()
            .push_back(error);
    }

    pub fn call_count(&self, kind: ResourceKind, call: SimCall) -> u32 {
        self.state().calls.get(&(kind, call)).copied().unwrap_or(0)
    }

    /// Create an object outside of the engine, already active.
    pub fn insert_external(&self, kind: ResourceKind, scope_id: &str, attributes: Value) -> String {
        let backend_id = format!("os-{}", uuid::Uuid::new_v4());
        let mut fields = Map::new();
        merge(&mut fields, &attributes);
        self.state().objects.insert(
            backend_id.clone(),
            SimObject {
                kind,
                scope_id: scope_id.to_string(),
                attributes: fields,
                local_ref: None,
                phase: Phase::Active,
                polls_left: 0,
            },
        );
        backend_id
    }

    /// Remove an object outside of the engine.
    pub fn remove(&self, backend_id: &str) -> bool {
        self.state().objects.remove(backend_id).is_some()
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.state().objects.contains_key(backend_id)
    }

    /// Change one attribute outside of the engine.
    pub fn set_attribute(&self, backend_id: &str, key: &str, value: Value) {
        if let Some(object) = self.state().objects.get_mut(backend_id) {
            object.attributes.insert(key.to_string(), value);
        }
    }

    /// Put an object into the error status.
    pub fn set_error(&self, backend_id: &str, message: &str) {
        if let Some(object) = self.state().objects.get_mut(backend_id) {
            object.phase = Phase::Failed(message.to_string());
            object.polls_left = 0;
        }
    }

    /// Keep an object's pending operation from ever settling.
    pub fn hold(&self, backend_id: &str) {
        if let Some(object) = self.state().objects.get_mut(backend_id) {
            object.polls_left = HELD;
        }
    }

    /// Backend ids of objects of `kind` in `scope_id`.
    pub fn backend_ids(&self, kind: ResourceKind, scope_id: &str) -> Vec<String> {
        self.state()
            .objects
            .iter()
            .filter(|(_, o)| o.kind == kind && o.scope_id == scope_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Adapter for one kind, backed by a [`SimulatedCloud`].
pub struct SimulatedAdapter {
    kind: ResourceKind,
    cloud: SimulatedCloud,
}

#[async_trait]
impl BackendAdapter for SimulatedAdapter {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn create(&self, request: &CreateRequest) -> Result<BackendObject, BackendError> {
        let mut state = self.cloud.state();
        state.enter(self.kind, SimCall::Create)?;

        let backend_id = format!("os-{}", uuid::Uuid::new_v4());
        let mut attributes = Map::new();
        merge(&mut attributes, &request.spec);
        let settle = state.settle_polls;
        let object = SimObject {
            kind: self.kind,
            scope_id: request.scope_id.clone(),
            attributes,
            local_ref: Some(request.resource_id.clone()),
            phase: if settle == 0 { Phase::Active } else { Phase::Building },
            polls_left: settle,
        };
        let observed = object.observe(&backend_id);
        state.objects.insert(backend_id.clone(), object);

        debug!(kind = %self.kind, backend_id = %backend_id, "Simulated create");
        Ok(observed)
    }

    async fn update(&self, backend_id: &str, spec: &Value) -> Result<BackendObject, BackendError> {
        let mut state = self.cloud.state();
        state.enter(self.kind, SimCall::Update)?;
        let settle = state.settle_polls;

        let object = state.object(self.kind, backend_id)?;
        merge(&mut object.attributes, spec);
        object.phase = if settle == 0 { Phase::Active } else { Phase::Updating };
        object.polls_left = settle;
        Ok(object.observe(backend_id))
    }

    async fn delete(&self, backend_id: &str) -> Result<BackendStatus, BackendError> {
        let mut state = self.cloud.state();
        state.enter(self.kind, SimCall::Delete)?;
        let settle = state.settle_polls;

        state.object(self.kind, backend_id)?;
        if settle == 0 {
            state.objects.remove(backend_id);
            return Ok(BackendStatus::Deleted);
        }
        let object = state.object(self.kind, backend_id)?;
        object.phase = Phase::Deleting;
        object.polls_left = settle;
        Ok(BackendStatus::Pending)
    }

    async fn fetch(&self, backend_id: &str) -> Result<BackendObject, BackendError> {
        let mut state = self.cloud.state();
        state.enter(self.kind, SimCall::Fetch)?;

        let object = state.object(self.kind, backend_id)?;
        if object.polls_left > 0 && object.polls_left != HELD {
            object.polls_left -= 1;
        }
        let settled = object.polls_left == 0;
        if settled && matches!(object.phase, Phase::Building | Phase::Updating) {
            object.phase = Phase::Active;
        }
        if settled && object.phase == Phase::Deleting {
            state.objects.remove(backend_id);
            return Err(BackendError::NotFound(format!("{} {}", self.kind, backend_id)));
        }
        Ok(state.object(self.kind, backend_id)?.observe(backend_id))
    }

    async fn list(&self, scope_id: &str) -> Result<Vec<BackendResource>, BackendError> {
        let mut state = self.cloud.state();
        state.enter(self.kind, SimCall::List)?;

        Ok(state
            .objects
            .iter()
            .filter(|(_, o)| o.kind == self.kind && o.scope_id == scope_id)
            .map(|(id, o)| BackendResource {
                backend_id: id.clone(),
                status: o.phase.status(),
                attributes: o.attributes(),
                local_ref: o.local_ref.clone(),
            })
            .collect())
    }
}
