use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::audit::OstackAuditLogger;
use crate::engine::{Intent, SubmitReceipt, SyncEngine};
use crate::error::SyncError;
use crate::model::{
    DriftReport, QuotaMetric, QuotaUsage, ResourceKind, ResourceRecord, ResourceState, Scope,
};
use crate::reconciler::ReconcileReport;
use crate::store::StoreError;

/// Shared application state
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub audit: Arc<OstackAuditLogger>,
}

/// API error response
#[derive(Serialize, ToSchema)]
pub struct ApiError {
    pub error: String,
    pub code: u32,
}

impl ApiError {
    fn bad_request(error: String) -> Self {
        ApiError { error, code: 400 }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code {
            404 => StatusCode::NOT_FOUND,
            409 => StatusCode::CONFLICT,
            400 => StatusCode::BAD_REQUEST,
            503 => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        let code = match &e {
            SyncError::NotFound(_) | SyncError::Store(StoreError::NotFound(_)) => 404,
            SyncError::StateConflict { .. }
            | SyncError::RunInFlight(_)
            | SyncError::QuotaExceeded { .. }
            | SyncError::ReconcileInProgress(_)
            | SyncError::Store(StoreError::Conflict(_)) => 409,
            SyncError::InvalidIntent(_) => 400,
            SyncError::BackendTransient(_) => 503,
            _ => 500,
        };
        ApiError {
            error: e.to_string(),
            code,
        }
    }
}

fn parse_kind(raw: &str) -> Result<ResourceKind, ApiError> {
    raw.parse().map_err(ApiError::bad_request)
}

// === Version ===

/// Version information
#[derive(Serialize, ToSchema)]
pub struct VersionInfo {
    pub version: String,
}

/// Get service version
#[utoipa::path(
    get,
    path = "/api/v1/version",
    responses(
        (status = 200, description = "Service version", body = VersionInfo)
    ),
    tag = "system"
)]
pub async fn get_version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// === Resources ===

/// Resource record
#[derive(Serialize, ToSchema)]
pub struct Resource {
    pub id: String,
    pub kind: String,
    pub scope_id: String,
    pub backend_id: Option<String>,
    pub state: String,
    /// Requested properties
    #[schema(value_type = Object)]
    pub spec: Value,
    /// Spec of an update in progress
    #[schema(value_type = Option<Object>)]
    pub pending_spec: Option<Value>,
    /// Properties reported by the backend
    #[schema(value_type = Object)]
    pub attributes: Value,
    pub error_message: Option<String>,
    pub created_at: String,
    pub modified_at: String,
}

impl From<ResourceRecord> for Resource {
    fn from(record: ResourceRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind.to_string(),
            scope_id: record.scope_id,
            backend_id: record.backend_id,
            state: record.state.to_string(),
            spec: record.spec,
            pending_spec: record.pending_spec,
            attributes: record.attributes,
            error_message: record.error_message,
            created_at: record.created_at.to_rfc3339(),
            modified_at: record.modified_at.to_rfc3339(),
        }
    }
}

/// Accepted intent
#[derive(Serialize, ToSchema)]
pub struct SubmitResponse {
    pub id: String,
    pub state: String,
}

impl From<SubmitReceipt> for SubmitResponse {
    fn from(receipt: SubmitReceipt) -> Self {
        Self {
            id: receipt.resource_id,
            state: receipt.state.to_string(),
        }
    }
}

/// Query parameters for listing resources
#[derive(Deserialize, ToSchema)]
pub struct ListResourcesQuery {
    /// Filter by scope ID
    pub scope: Option<String>,
    /// Filter by resource kind
    pub kind: Option<String>,
    /// Filter by lifecycle state
    pub state: Option<String>,
}

/// List resource records
#[utoipa::path(
    get,
    path = "/api/v1/resources",
    params(
        ("scope" = Option<String>, Query, description = "Filter by scope ID"),
        ("kind" = Option<String>, Query, description = "Filter by resource kind"),
        ("state" = Option<String>, Query, description = "Filter by lifecycle state")
    ),
    responses(
        (status = 200, description = "List of resources", body = Vec<Resource>),
        (status = 400, description = "Invalid filter", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn list_resources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListResourcesQuery>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    let kind = query.kind.as_deref().map(parse_kind).transpose()?;
    let lifecycle_state = query
        .state
        .as_deref()
        .map(|s| s.parse::<ResourceState>().map_err(ApiError::bad_request))
        .transpose()?;

    let records = state
        .engine
        .list(query.scope.as_deref(), kind, lifecycle_state)
        .await?;
    Ok(Json(records.into_iter().map(Resource::from).collect()))
}

/// Get a resource record
#[utoipa::path(
    get,
    path = "/api/v1/resources/{id}",
    params(
        ("id" = String, Path, description = "Resource ID")
    ),
    responses(
        (status = 200, description = "Resource found", body = Resource),
        (status = 404, description = "Resource not found", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn get_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, ApiError> {
    let record = state.engine.get(&id).await?;
    Ok(Json(record.into()))
}

/// Request to create a resource
#[derive(Deserialize, ToSchema)]
pub struct CreateResourceRequest {
    /// Resource kind (instance, volume, network, security_group, floating_ip, backup)
    pub kind: String,
    /// Project scope owning the resource
    pub scope_id: String,
    /// Requested properties
    #[schema(value_type = Option<Object>)]
    pub spec: Option<Value>,
    /// Client token; a repeated token returns the first response
    pub request_id: Option<String>,
}

/// Submit a create intent
#[utoipa::path(
    post,
    path = "/api/v1/resources",
    request_body = CreateResourceRequest,
    responses(
        (status = 202, description = "Create accepted", body = SubmitResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Scope not found", body = ApiError),
        (status = 409, description = "Quota exceeded", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn create_resource(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let intent = Intent::Create {
        kind: parse_kind(&req.kind)?,
        scope_id: req.scope_id,
        spec: req.spec.unwrap_or_else(|| Value::Object(Default::default())),
    };
    let receipt = state
        .engine
        .submit(intent, req.request_id.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}

/// Request to update a resource
#[derive(Deserialize, ToSchema)]
pub struct UpdateResourceRequest {
    /// Fields replacing the same fields of the current spec
    #[schema(value_type = Object)]
    pub spec: Value,
    /// Client token; a repeated token returns the first response
    pub request_id: Option<String>,
}

/// Submit an update intent
#[utoipa::path(
    patch,
    path = "/api/v1/resources/{id}",
    params(
        ("id" = String, Path, description = "Resource ID")
    ),
    request_body = UpdateResourceRequest,
    responses(
        (status = 202, description = "Update accepted", body = SubmitResponse),
        (status = 404, description = "Resource not found", body = ApiError),
        (status = 409, description = "Resource is not OK", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn update_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateResourceRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let intent = Intent::Update {
        resource_id: id,
        spec: req.spec,
    };
    let receipt = state
        .engine
        .submit(intent, req.request_id.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}

/// Query parameters for deleting a resource
#[derive(Deserialize, ToSchema)]
pub struct DeleteResourceQuery {
    /// Client token; a repeated token returns the first response
    pub request_id: Option<String>,
}

/// Submit a delete intent
#[utoipa::path(
    delete,
    path = "/api/v1/resources/{id}",
    params(
        ("id" = String, Path, description = "Resource ID"),
        ("request_id" = Option<String>, Query, description = "Client token for deduplication")
    ),
    responses(
        (status = 202, description = "Delete accepted", body = SubmitResponse),
        (status = 404, description = "Resource not found", body = ApiError),
        (status = 409, description = "Resource is busy", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DeleteResourceQuery>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let receipt = state
        .engine
        .submit(Intent::Delete { resource_id: id }, query.request_id.as_deref())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt.into())))
}

/// Cancel an operation that has not started
#[utoipa::path(
    post,
    path = "/api/v1/resources/{id}/cancel",
    params(
        ("id" = String, Path, description = "Resource ID")
    ),
    responses(
        (status = 200, description = "Operation cancelled", body = Resource),
        (status = 404, description = "Resource not found", body = ApiError),
        (status = 409, description = "Nothing to cancel or already running", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn cancel_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, ApiError> {
    let record = state.engine.cancel(&id).await?;
    Ok(Json(record.into()))
}

/// Clear the error of an ERRED resource
#[utoipa::path(
    post,
    path = "/api/v1/resources/{id}/recover",
    params(
        ("id" = String, Path, description = "Resource ID")
    ),
    responses(
        (status = 200, description = "Resource recovered", body = Resource),
        (status = 400, description = "Resource has no backend object", body = ApiError),
        (status = 404, description = "Resource not found", body = ApiError),
        (status = 409, description = "Resource is not ERRED", body = ApiError)
    ),
    tag = "resources"
)]
pub async fn recover_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Resource>, ApiError> {
    let record = state.engine.recover(&id).await?;
    Ok(Json(record.into()))
}

// === Scopes & Quota ===

/// Scope information
#[derive(Serialize, ToSchema)]
pub struct ScopeInfo {
    pub id: String,
    pub name: String,
    pub level: String,
    pub parent_id: Option<String>,
}

impl From<Scope> for ScopeInfo {
    fn from(scope: Scope) -> Self {
        Self {
            id: scope.id,
            name: scope.name,
            level: scope.level.as_str().to_string(),
            parent_id: scope.parent_id,
        }
    }
}

/// List all scopes
#[utoipa::path(
    get,
    path = "/api/v1/scopes",
    responses(
        (status = 200, description = "List of scopes", body = Vec<ScopeInfo>)
    ),
    tag = "scopes"
)]
pub async fn list_scopes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ScopeInfo>>, ApiError> {
    let scopes = state.engine.list_scopes().await?;
    Ok(Json(scopes.into_iter().map(ScopeInfo::from).collect()))
}

/// Ledger counter
#[derive(Serialize, ToSchema)]
pub struct QuotaEntry {
    pub metric: String,
    /// Usage including descendant scopes and pending reservations
    pub usage: i64,
    /// Absent when unlimited
    pub limit: Option<i64>,
}

impl From<QuotaUsage> for QuotaEntry {
    fn from(usage: QuotaUsage) -> Self {
        Self {
            metric: usage.metric.to_string(),
            usage: usage.usage,
            limit: usage.limit,
        }
    }
}

/// Ledger snapshot of a scope
#[derive(Serialize, ToSchema)]
pub struct QuotaInfo {
    pub scope_id: String,
    pub entries: Vec<QuotaEntry>,
}

/// Get the quota ledger of a scope
#[utoipa::path(
    get,
    path = "/api/v1/scopes/{id}/quota",
    params(
        ("id" = String, Path, description = "Scope ID")
    ),
    responses(
        (status = 200, description = "Ledger snapshot", body = QuotaInfo),
        (status = 404, description = "Scope not found", body = ApiError)
    ),
    tag = "scopes"
)]
pub async fn get_quota(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<QuotaInfo>, ApiError> {
    let snapshot = state.engine.get_quota(&id).await?;
    Ok(Json(QuotaInfo {
        scope_id: snapshot.scope_id,
        entries: snapshot.entries.into_iter().map(QuotaEntry::from).collect(),
    }))
}

/// Request to set a quota limit
#[derive(Deserialize, ToSchema)]
pub struct SetLimitRequest {
    /// New limit; null removes the limit
    pub limit: Option<i64>,
}

/// Set the limit of one metric
#[utoipa::path(
    put,
    path = "/api/v1/scopes/{id}/quota/{metric}",
    params(
        ("id" = String, Path, description = "Scope ID"),
        ("metric" = String, Path, description = "Quota metric")
    ),
    request_body = SetLimitRequest,
    responses(
        (status = 200, description = "Limit set", body = QuotaEntry),
        (status = 400, description = "Invalid metric or limit", body = ApiError),
        (status = 404, description = "Scope not found", body = ApiError)
    ),
    tag = "scopes"
)]
pub async fn set_quota_limit(
    State(state): State<Arc<AppState>>,
    Path((id, metric)): Path<(String, String)>,
    Json(req): Json<SetLimitRequest>,
) -> Result<Json<QuotaEntry>, ApiError> {
    let metric: QuotaMetric = metric.parse().map_err(ApiError::bad_request)?;
    let usage = state.engine.set_limit(&id, metric, req.limit).await?;
    state.audit.quota_limit_set(&id, metric, req.limit);
    Ok(Json(usage.into()))
}

/// Ledger drift report
#[derive(Serialize, ToSchema)]
pub struct DriftInfo {
    pub id: String,
    pub metric: String,
    /// Counter value when last observed
    pub recorded: i64,
    /// Usage derived from resource records
    pub computed: i64,
    pub passes: u32,
    pub corrected: bool,
    pub resolved: bool,
    pub first_seen: String,
    pub last_seen: String,
}

impl From<DriftReport> for DriftInfo {
    fn from(report: DriftReport) -> Self {
        Self {
            id: report.id,
            metric: report.metric.to_string(),
            recorded: report.recorded,
            computed: report.computed,
            passes: report.passes,
            corrected: report.corrected,
            resolved: report.resolved,
            first_seen: report.first_seen.to_rfc3339(),
            last_seen: report.last_seen.to_rfc3339(),
        }
    }
}

/// List ledger drift reports of a scope
#[utoipa::path(
    get,
    path = "/api/v1/scopes/{id}/drift",
    params(
        ("id" = String, Path, description = "Scope ID")
    ),
    responses(
        (status = 200, description = "Drift reports", body = Vec<DriftInfo>),
        (status = 404, description = "Scope not found", body = ApiError)
    ),
    tag = "scopes"
)]
pub async fn list_drift(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DriftInfo>>, ApiError> {
    let reports = state.engine.list_drift(&id).await?;
    Ok(Json(reports.into_iter().map(DriftInfo::from).collect()))
}

/// Result of one reconciliation pass
#[derive(Serialize, ToSchema)]
pub struct ReconcileSummary {
    pub scope_id: String,
    pub imported: Vec<String>,
    pub updated: Vec<String>,
    pub disappeared: Vec<String>,
    pub resolved: Vec<String>,
    pub redispatched: Vec<String>,
    pub drift: Vec<DriftInfo>,
    pub corrected: Vec<String>,
    pub errors: Vec<String>,
}

impl From<ReconcileReport> for ReconcileSummary {
    fn from(report: ReconcileReport) -> Self {
        Self {
            scope_id: report.scope_id,
            imported: report.imported,
            updated: report.updated,
            disappeared: report.disappeared,
            resolved: report.resolved,
            redispatched: report.redispatched,
            drift: report.drift.into_iter().map(DriftInfo::from).collect(),
            corrected: report.corrected.iter().map(|m| m.to_string()).collect(),
            errors: report.errors,
        }
    }
}

/// Run a reconciliation pass for a scope
#[utoipa::path(
    post,
    path = "/api/v1/scopes/{id}/reconcile",
    params(
        ("id" = String, Path, description = "Scope ID")
    ),
    responses(
        (status = 200, description = "Pass completed", body = ReconcileSummary),
        (status = 404, description = "Scope not found", body = ApiError),
        (status = 409, description = "Pass already running", body = ApiError)
    ),
    tag = "scopes"
)]
pub async fn reconcile_scope(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ReconcileSummary>, ApiError> {
    let report = state.engine.reconcile(&id).await?;
    Ok(Json(report.into()))
}
