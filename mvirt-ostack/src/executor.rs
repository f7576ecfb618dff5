//! Executors: one intent turned into backend calls and local transitions.
//!
//! A run starts with a claim in the [`RunRegistry`], so a record has at
//! most one run at a time. The run then proceeds in steps, each one a task
//! handed to the scheduler:
//!
//! ```text
//! run ─► call ──(transient)──► call (after backoff) ─► ... ─► ERRED
//!          │
//!          └─► poll ─► poll (after interval) ─► ... ─► OK / DELETED / ERRED
//! ```
//!
//! The backend call always happens before the local commit. If the process
//! dies in between, the pull reconciler resolves the record.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audit::OstackAuditLogger;
use crate::backend::{
    AdapterRegistry, BackendAdapter, BackendError, BackendObject, BackendStatus, CreateRequest,
};
use crate::config::{PollConfig, RetryConfig};
use crate::error::{Result, SyncError};
use crate::lifecycle::Transition;
use crate::model::{Operation, ResourceRecord, ResourceState};
use crate::quota::QuotaLedger;
use crate::scheduler::{Task, TaskHandle, TaskScheduler};
use crate::store::{DataStore, RecordPatch};

/// Error message of records found missing at the backend.
pub const NOT_FOUND_MESSAGE: &str = "Does not exist at backend.";

/// Error message of operations withdrawn before dispatch.
pub const CANCELLED_MESSAGE: &str = "Cancelled before dispatch";

/// Append the not-found message to an existing error message once.
pub fn not_found_message(existing: Option<&str>) -> String {
    match existing {
        None => NOT_FOUND_MESSAGE.to_string(),
        Some(msg) if msg.is_empty() => NOT_FOUND_MESSAGE.to_string(),
        Some(msg) if msg.contains(NOT_FOUND_MESSAGE) => msg.to_string(),
        Some(msg) => format!("{} ({})", msg, NOT_FOUND_MESSAGE),
    }
}

/// In-memory record of one orchestration attempt.
#[derive(Debug, Clone)]
pub struct ExecutorRun {
    pub run_id: String,
    pub resource_id: String,
    pub operation: Operation,
    pub attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Runs in flight, at most one per resource record.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, ExecutorRun>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, ExecutorRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the record for a run. Returns the run id, or `None` if another
    /// run holds the record.
    pub fn claim(&self, resource_id: &str, operation: Operation) -> Option<String> {
        let mut runs = self.runs();
        if runs.contains_key(resource_id) {
            return None;
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        runs.insert(
            resource_id.to_string(),
            ExecutorRun {
                run_id: run_id.clone(),
                resource_id: resource_id.to_string(),
                operation,
                attempt_count: 0,
                started_at: Utc::now(),
                last_error: None,
            },
        );
        Some(run_id)
    }

    pub fn is_active(&self, resource_id: &str) -> bool {
        self.runs().contains_key(resource_id)
    }

    /// Whether `run_id` still owns the record.
    pub fn owns(&self, resource_id: &str, run_id: &str) -> bool {
        self.runs()
            .get(resource_id)
            .is_some_and(|run| run.run_id == run_id)
    }

    pub fn get(&self, resource_id: &str) -> Option<ExecutorRun> {
        self.runs().get(resource_id).cloned()
    }

    /// Count a backend call attempt. Returns the attempt number.
    pub fn begin_attempt(&self, resource_id: &str) -> u32 {
        match self.runs().get_mut(resource_id) {
            Some(run) => {
                run.attempt_count += 1;
                run.attempt_count
            }
            None => 0,
        }
    }

    pub fn record_error(&self, resource_id: &str, error: &str) {
        if let Some(run) = self.runs().get_mut(resource_id) {
            run.last_error = Some(error.to_string());
        }
    }

    /// Drop the run if `run_id` still owns the record.
    pub fn finish(&self, resource_id: &str, run_id: &str) -> Option<ExecutorRun> {
        let mut runs = self.runs();
        if runs.get(resource_id).is_some_and(|run| run.run_id == run_id) {
            runs.remove(resource_id)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.runs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs().is_empty()
    }
}

/// Result of one executor step.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A status check was scheduled.
    Polling { check: u32 },
    /// The backend call will be retried after a transient failure.
    Retrying { attempt: u32, delay: Duration },
    /// The run ended with the record in this state.
    Finished(ResourceState),
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Call { attempt: u32 },
    Poll { check: u32 },
}

enum Observation {
    Present(BackendObject),
    Gone,
}

pub struct Executor {
    store: Arc<dyn DataStore>,
    ledger: Arc<QuotaLedger>,
    adapters: Arc<AdapterRegistry>,
    scheduler: Arc<dyn TaskScheduler>,
    runs: Arc<RunRegistry>,
    retry: RetryConfig,
    poll: PollConfig,
    scheduler_max_attempts: u32,
    audit: Arc<OstackAuditLogger>,
    /// Dispatched runs not delivered yet.
    pending: Mutex<HashMap<String, TaskHandle>>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DataStore>,
        ledger: Arc<QuotaLedger>,
        adapters: Arc<AdapterRegistry>,
        scheduler: Arc<dyn TaskScheduler>,
        runs: Arc<RunRegistry>,
        retry: RetryConfig,
        poll: PollConfig,
        scheduler_max_attempts: u32,
        audit: Arc<OstackAuditLogger>,
    ) -> Self {
        Self {
            store,
            ledger,
            adapters,
            scheduler,
            runs,
            retry,
            poll,
            scheduler_max_attempts,
            audit,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, TaskHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn adapter(&self, record: &ResourceRecord) -> Result<Arc<dyn BackendAdapter>> {
        self.adapters.get(record.kind).ok_or_else(|| {
            SyncError::InvalidIntent(format!("no backend adapter for {}", record.kind))
        })
    }

    async fn load(&self, resource_id: &str) -> Result<ResourceRecord> {
        self.store
            .get_record(resource_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("resource '{}'", resource_id)))
    }

    /// Hand a run to the scheduler.
    pub fn dispatch(self: &Arc<Self>, resource_id: &str, operation: Operation) -> TaskHandle {
        let this = Arc::clone(self);
        let id = resource_id.to_string();
        let task = Task::new(format!("{}-{}", operation, resource_id), move || {
            let this = Arc::clone(&this);
            let id = id.clone();
            async move { this.run(&id, operation).await.map(|_| ()) }
        })
        .max_attempts(self.scheduler_max_attempts);

        let handle = self.scheduler.schedule(task);
        self.pending()
            .insert(resource_id.to_string(), handle.clone());
        debug!(resource_id = %resource_id, operation = %operation, "Run dispatched");
        handle
    }

    /// Start a run for `operation` on the record.
    ///
    /// Fails with a conflict if another run holds the record or the record
    /// is not in the state the operation starts from.
    pub async fn run(
        self: &Arc<Self>,
        resource_id: &str,
        operation: Operation,
    ) -> Result<RunOutcome> {
        let run_id = self
            .runs
            .claim(resource_id, operation)
            .ok_or_else(|| SyncError::RunInFlight(resource_id.to_string()))?;
        self.pending().remove(resource_id);

        let result = self.start(resource_id, operation, &run_id).await;
        self.settle(resource_id, &run_id, &result);
        result
    }

    async fn start(
        self: &Arc<Self>,
        resource_id: &str,
        operation: Operation,
        run_id: &str,
    ) -> Result<RunOutcome> {
        let record = self.load(resource_id).await?;
        let (expected, begin) = match operation {
            Operation::Create => (ResourceState::CreationScheduled, Some(Transition::BeginCreate)),
            Operation::Update => (ResourceState::Updating, None),
            Operation::Delete => (ResourceState::DeletionScheduled, Some(Transition::BeginDelete)),
        };
        if record.state != expected {
            return Err(SyncError::StateConflict {
                resource_id: resource_id.to_string(),
                current: record.state,
                requested: begin.map(|t| t.target()).unwrap_or(expected),
            });
        }

        let record = match begin {
            Some(transition) => {
                let updated = self
                    .store
                    .transition(resource_id, transition, RecordPatch::new())
                    .await?;
                self.audit
                    .state_changed(resource_id, record.state, updated.state);
                updated
            }
            None => record,
        };

        info!(resource_id = %resource_id, kind = %record.kind, operation = %operation, "Run started");

        if operation == Operation::Delete && record.backend_id.is_none() {
            // Never reached the backend
            return self.complete_delete(&record).await;
        }

        self.call(&record, operation, 1, run_id).await
    }

    /// Continue a run with a scheduled step.
    async fn resume(
        self: &Arc<Self>,
        resource_id: &str,
        operation: Operation,
        step: Step,
        run_id: &str,
    ) -> Result<RunOutcome> {
        if !self.runs.owns(resource_id, run_id) {
            return Err(SyncError::RunInFlight(resource_id.to_string()));
        }

        let result = match step {
            Step::Call { attempt } => {
                let record = self.load(resource_id).await?;
                self.expect_in_progress(&record, operation)?;
                self.call(&record, operation, attempt, run_id).await
            }
            Step::Poll { check } => self.poll_once(resource_id, operation, check, run_id).await,
        };
        self.settle(resource_id, run_id, &result);
        result
    }

    /// Drop the claim once the run has ended.
    fn settle(&self, resource_id: &str, run_id: &str, result: &Result<RunOutcome>) {
        match result {
            Ok(RunOutcome::Finished(state)) => {
                self.runs.finish(resource_id, run_id);
                debug!(resource_id = %resource_id, state = %state, "Run finished");
            }
            Err(e) => {
                self.runs.record_error(resource_id, &e.to_string());
                self.runs.finish(resource_id, run_id);
                warn!(resource_id = %resource_id, error = %e, "Run aborted");
            }
            Ok(_) => {}
        }
    }

    fn expect_in_progress(&self, record: &ResourceRecord, operation: Operation) -> Result<()> {
        let expected = match operation {
            Operation::Create => ResourceState::Creating,
            Operation::Update => ResourceState::Updating,
            Operation::Delete => ResourceState::Deleting,
        };
        if record.state != expected {
            return Err(SyncError::StateConflict {
                resource_id: record.id.clone(),
                current: record.state,
                requested: expected,
            });
        }
        Ok(())
    }

    fn schedule_step(
        self: &Arc<Self>,
        resource_id: &str,
        operation: Operation,
        step: Step,
        delay: Duration,
        run_id: &str,
    ) {
        let this = Arc::clone(self);
        let id = resource_id.to_string();
        let run = run_id.to_string();
        let name = match step {
            Step::Call { attempt } => format!("{}-{}-call-{}", operation, resource_id, attempt),
            Step::Poll { check } => format!("{}-{}-poll-{}", operation, resource_id, check),
        };
        self.scheduler.schedule(
            Task::new(name, move || {
                let this = Arc::clone(&this);
                let id = id.clone();
                let run = run.clone();
                async move { this.resume(&id, operation, step, &run).await.map(|_| ()) }
            })
            .delay(delay),
        );
    }

    /// Issue the backend call of the operation.
    async fn call(
        self: &Arc<Self>,
        record: &ResourceRecord,
        operation: Operation,
        attempt: u32,
        run_id: &str,
    ) -> Result<RunOutcome> {
        let adapter = self.adapter(record)?;
        self.runs.begin_attempt(&record.id);

        let result = match (operation, record.backend_id.as_deref()) {
            (Operation::Create, _) => adapter
                .create(&CreateRequest {
                    resource_id: record.id.clone(),
                    scope_id: record.scope_id.clone(),
                    spec: record.spec.clone(),
                })
                .await
                .map(Observation::Present),
            (Operation::Update, Some(backend_id)) => adapter
                .update(backend_id, record.pending_spec.as_ref().unwrap_or(&record.spec))
                .await
                .map(Observation::Present),
            (Operation::Delete, Some(backend_id)) => {
                adapter.delete(backend_id).await.map(|status| match status {
                    BackendStatus::Deleted => Observation::Gone,
                    status => Observation::Present(BackendObject {
                        backend_id: backend_id.to_string(),
                        status,
                        attributes: record.attributes.clone(),
                    }),
                })
            }
            (_, None) => {
                return self
                    .fail(record, "Resource has no backend id", false)
                    .await;
            }
        };

        match result {
            Ok(Observation::Present(object)) if operation == Operation::Create => {
                // Store the backend id before anything else can go wrong
                let record = self
                    .store
                    .patch_record(
                        &record.id,
                        ResourceState::Creating,
                        RecordPatch::new()
                            .backend_id(object.backend_id.clone())
                            .attributes(object.attributes.clone()),
                    )
                    .await?;
                info!(resource_id = %record.id, backend_id = %object.backend_id, "Backend object created");
                self.observe(&record, operation, Observation::Present(object), 0, run_id)
                    .await
            }
            Ok(observation) => self.observe(record, operation, observation, 0, run_id).await,
            Err(BackendError::NotFound(_)) if operation == Operation::Delete => {
                info!(resource_id = %record.id, "Backend object already absent");
                self.complete_delete(record).await
            }
            Err(BackendError::NotFound(msg)) => {
                let message = not_found_message(Some(&msg));
                self.fail(record, &message, operation == Operation::Create)
                    .await
            }
            Err(BackendError::Transient(msg)) => {
                self.runs.record_error(&record.id, &msg);
                if attempt < self.retry.max_attempts {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        resource_id = %record.id,
                        operation = %operation,
                        attempt,
                        error = %msg,
                        ?delay,
                        "Transient backend failure, retrying"
                    );
                    self.schedule_step(&record.id, operation, Step::Call { attempt: attempt + 1 }, delay, run_id);
                    Ok(RunOutcome::Retrying {
                        attempt: attempt + 1,
                        delay,
                    })
                } else {
                    let err = SyncError::BackendTransient(format!(
                        "{} (gave up after {} attempts)",
                        msg, attempt
                    ));
                    self.fail(record, &err.to_string(), operation == Operation::Create)
                        .await
                }
            }
            Err(BackendError::Terminal(msg)) => {
                let err = SyncError::BackendTerminal(msg);
                self.fail(record, &err.to_string(), operation == Operation::Create)
                    .await
            }
        }
    }

    async fn poll_once(
        self: &Arc<Self>,
        resource_id: &str,
        operation: Operation,
        check: u32,
        run_id: &str,
    ) -> Result<RunOutcome> {
        let record = self.load(resource_id).await?;
        self.expect_in_progress(&record, operation)?;
        let Some(backend_id) = record.backend_id.clone() else {
            return self.fail(&record, "Resource has no backend id", false).await;
        };

        match self.adapter(&record)?.fetch(&backend_id).await {
            Ok(object) => {
                self.observe(&record, operation, Observation::Present(object), check, run_id)
                    .await
            }
            Err(BackendError::NotFound(_)) => {
                self.observe(&record, operation, Observation::Gone, check, run_id)
                    .await
            }
            Err(BackendError::Transient(msg)) => {
                debug!(resource_id = %resource_id, check, error = %msg, "Status check failed");
                self.runs.record_error(resource_id, &msg);
                self.poll_later(&record, operation, check, run_id).await
            }
            Err(BackendError::Terminal(msg)) => {
                let err = SyncError::BackendTerminal(msg);
                self.fail(&record, &err.to_string(), false).await
            }
        }
    }

    /// Act on what the backend reported after a call or status check.
    async fn observe(
        self: &Arc<Self>,
        record: &ResourceRecord,
        operation: Operation,
        observation: Observation,
        check: u32,
        run_id: &str,
    ) -> Result<RunOutcome> {
        match (operation, observation) {
            (Operation::Delete, Observation::Gone)
            | (
                Operation::Delete,
                Observation::Present(BackendObject {
                    status: BackendStatus::Deleted,
                    ..
                }),
            ) => self.complete_delete(record).await,
            (_, Observation::Gone)
            | (
                _,
                Observation::Present(BackendObject {
                    status: BackendStatus::Deleted,
                    ..
                }),
            ) => {
                let message = not_found_message(record.error_message.as_deref());
                self.fail(record, &message, operation == Operation::Create)
                    .await
            }
            (_, Observation::Present(object)) => match &object.status {
                BackendStatus::Error(msg) => {
                    let message = format!("Backend reports error status: {}", msg);
                    self.fail(record, &message, false).await
                }
                BackendStatus::Stable if operation == Operation::Create => {
                    self.complete_create(record, object).await
                }
                BackendStatus::Stable if operation == Operation::Update => {
                    self.complete_update(record, object).await
                }
                _ => self.poll_later(record, operation, check, run_id).await,
            },
        }
    }

    async fn poll_later(
        self: &Arc<Self>,
        record: &ResourceRecord,
        operation: Operation,
        check: u32,
        run_id: &str,
    ) -> Result<RunOutcome> {
        let next = check + 1;
        if next > self.poll.max_checks {
            let err = SyncError::Timeout(format!(
                "backend did not finish {} after {} status checks",
                operation, self.poll.max_checks
            ));
            // The operation may still complete; the reconciler finds out
            return self.fail(record, &err.to_string(), false).await;
        }
        self.schedule_step(&record.id, operation, Step::Poll { check: next }, self.poll.interval(next), run_id);
        Ok(RunOutcome::Polling { check: next })
    }

    /// Pick up a CREATING, UPDATING or DELETING record that no run holds,
    /// starting from what the backend reports now.
    pub async fn resume_stale(self: &Arc<Self>, resource_id: &str) -> Result<RunOutcome> {
        let record = self.load(resource_id).await?;
        let operation = match record.state {
            ResourceState::Creating => Operation::Create,
            ResourceState::Updating => Operation::Update,
            ResourceState::Deleting => Operation::Delete,
            current => {
                return Err(SyncError::InvalidIntent(format!(
                    "resource {} is {}, nothing to resume",
                    resource_id, current
                )));
            }
        };

        let run_id = self
            .runs
            .claim(resource_id, operation)
            .ok_or_else(|| SyncError::RunInFlight(resource_id.to_string()))?;
        let result = self.resolve_in_progress(resource_id, operation, &run_id).await;
        self.settle(resource_id, &run_id, &result);
        result
    }

    async fn resolve_in_progress(
        self: &Arc<Self>,
        resource_id: &str,
        operation: Operation,
        run_id: &str,
    ) -> Result<RunOutcome> {
        let record = self.load(resource_id).await?;
        self.expect_in_progress(&record, operation)?;

        let Some(backend_id) = record.backend_id.clone() else {
            // The create call never returned, or the delete never needed one
            return match operation {
                Operation::Delete => self.complete_delete(&record).await,
                _ => {
                    let message = not_found_message(record.error_message.as_deref());
                    self.fail(&record, &message, operation == Operation::Create)
                        .await
                }
            };
        };

        match self.adapter(&record)?.fetch(&backend_id).await {
            Ok(object)
                if operation == Operation::Delete && object.status == BackendStatus::Stable =>
            {
                self.fail(&record, "Deletion did not complete", false).await
            }
            Ok(object) => {
                self.observe(&record, operation, Observation::Present(object), 0, run_id)
                    .await
            }
            Err(BackendError::NotFound(_)) => {
                self.observe(&record, operation, Observation::Gone, 0, run_id)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    // === Terminal steps, shared with the reconciler ===

    /// CREATING -> OK with the observed attributes; commits the reservation.
    pub(crate) async fn complete_create(
        &self,
        record: &ResourceRecord,
        object: BackendObject,
    ) -> Result<RunOutcome> {
        let updated = self
            .store
            .transition(
                &record.id,
                Transition::CreateSucceeded,
                RecordPatch::new()
                    .backend_id(object.backend_id)
                    .attributes(object.attributes)
                    .clear_error(),
            )
            .await?;
        if let Some(reservation) = &updated.reservation_id {
            self.ledger.commit(reservation).await?;
        }
        self.audit.state_changed(&record.id, record.state, updated.state);
        info!(resource_id = %record.id, "Resource created");
        Ok(RunOutcome::Finished(updated.state))
    }

    /// UPDATING -> OK with the observed attributes.
    ///
    /// The pending spec becomes the spec only if this run sent it to the
    /// backend. A stale record settled from a status check keeps its old spec.
    pub(crate) async fn complete_update(
        &self,
        record: &ResourceRecord,
        object: BackendObject,
    ) -> Result<RunOutcome> {
        let mut patch = RecordPatch::new().attributes(object.attributes).clear_error();
        let sent = self
            .runs
            .get(&record.id)
            .is_some_and(|run| run.attempt_count > 0);
        match record.pending_spec.clone() {
            Some(pending) if sent => patch = patch.spec(pending),
            Some(_) => {
                warn!(resource_id = %record.id, "Update settled without reaching the backend, pending spec dropped");
            }
            None => {}
        }
        let updated = self
            .store
            .transition(&record.id, Transition::UpdateSucceeded, patch)
            .await?;
        self.audit.state_changed(&record.id, record.state, updated.state);
        info!(resource_id = %record.id, "Resource updated");
        Ok(RunOutcome::Finished(updated.state))
    }

    /// DELETING -> DELETED; releases whatever quota the record holds.
    pub(crate) async fn complete_delete(&self, record: &ResourceRecord) -> Result<RunOutcome> {
        let updated = self
            .store
            .transition(&record.id, Transition::DeleteSucceeded, RecordPatch::new())
            .await?;
        if let Some(reservation) = &updated.reservation_id {
            self.ledger.release(reservation).await?;
        }
        self.audit.state_changed(&record.id, record.state, updated.state);
        info!(resource_id = %record.id, "Resource deleted");
        Ok(RunOutcome::Finished(updated.state))
    }

    /// Any active state -> ERRED with `message`.
    ///
    /// `release` gives the quota back; it is set when the backend object is
    /// known not to exist.
    pub(crate) async fn fail(
        &self,
        record: &ResourceRecord,
        message: &str,
        release: bool,
    ) -> Result<RunOutcome> {
        let updated = self
            .store
            .transition(&record.id, Transition::Fail, RecordPatch::new().error(message))
            .await?;
        if release && let Some(reservation) = &updated.reservation_id {
            self.ledger.release(reservation).await?;
        }
        self.audit.resource_erred(&record.id, message);
        warn!(resource_id = %record.id, from = %record.state, error = %message, "Resource erred");
        Ok(RunOutcome::Finished(updated.state))
    }

    /// Withdraw a dispatched operation that has not been delivered yet.
    pub async fn cancel(&self, resource_id: &str) -> Result<ResourceRecord> {
        let record = self.load(resource_id).await?;
        let operation = match record.state {
            ResourceState::CreationScheduled => Operation::Create,
            ResourceState::Updating => Operation::Update,
            ResourceState::DeletionScheduled => Operation::Delete,
            current => {
                return Err(SyncError::StateConflict {
                    resource_id: resource_id.to_string(),
                    current,
                    requested: ResourceState::Erred,
                });
            }
        };

        // Holding the claim keeps a late delivery from starting the run
        let run_id = self
            .runs
            .claim(resource_id, operation)
            .ok_or_else(|| SyncError::RunInFlight(resource_id.to_string()))?;
        if let Some(handle) = self.pending().remove(resource_id) {
            handle.cancel();
        }

        let result = match operation {
            Operation::Update => {
                self.store
                    .transition(resource_id, Transition::AbandonUpdate, RecordPatch::new())
                    .await
            }
            Operation::Create | Operation::Delete => {
                self.store
                    .transition(
                        resource_id,
                        Transition::Fail,
                        RecordPatch::new().error(CANCELLED_MESSAGE),
                    )
                    .await
            }
        };
        self.runs.finish(resource_id, &run_id);
        let mut updated = result?;

        if operation == Operation::Create
            && let Some(reservation) = updated.reservation_id.take()
        {
            self.ledger.release(&reservation).await?;
        }
        self.audit.intent_cancelled(resource_id);
        self.audit
            .state_changed(resource_id, record.state, updated.state);
        Ok(updated)
    }
}
