use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::handlers::{self, AppState};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "mvirt OpenStack Sync API",
        version = "0.1.0",
        description = "REST API for the mvirt OpenStack synchronization core. Exposes resource lifecycle state, the hierarchical quota ledger and pull reconciliation.",
        license(name = "MIT")
    ),
    tags(
        (name = "system", description = "System information"),
        (name = "resources", description = "Resource records and intents"),
        (name = "scopes", description = "Scopes, quota ledger and reconciliation")
    ),
    paths(
        handlers::get_version,
        handlers::list_resources,
        handlers::get_resource,
        handlers::create_resource,
        handlers::update_resource,
        handlers::delete_resource,
        handlers::cancel_resource,
        handlers::recover_resource,
        handlers::list_scopes,
        handlers::get_quota,
        handlers::set_quota_limit,
        handlers::list_drift,
        handlers::reconcile_scope,
    ),
    components(schemas(
        handlers::VersionInfo,
        handlers::ApiError,
        handlers::Resource,
        handlers::SubmitResponse,
        handlers::ListResourcesQuery,
        handlers::CreateResourceRequest,
        handlers::UpdateResourceRequest,
        handlers::DeleteResourceQuery,
        handlers::ScopeInfo,
        handlers::QuotaEntry,
        handlers::QuotaInfo,
        handlers::SetLimitRequest,
        handlers::DriftInfo,
        handlers::ReconcileSummary,
    ))
)]
pub struct ApiDoc;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // System
        .route("/version", get(handlers::get_version))
        // Resources
        .route(
            "/resources",
            get(handlers::list_resources).post(handlers::create_resource),
        )
        .route(
            "/resources/{id}",
            get(handlers::get_resource)
                .patch(handlers::update_resource)
                .delete(handlers::delete_resource),
        )
        .route("/resources/{id}/cancel", post(handlers::cancel_resource))
        .route("/resources/{id}/recover", post(handlers::recover_resource))
        // Scopes
        .route("/scopes", get(handlers::list_scopes))
        .route("/scopes/{id}/quota", get(handlers::get_quota))
        .route("/scopes/{id}/quota/{metric}", put(handlers::set_quota_limit))
        .route("/scopes/{id}/drift", get(handlers::list_drift))
        .route("/scopes/{id}/reconcile", post(handlers::reconcile_scope));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
