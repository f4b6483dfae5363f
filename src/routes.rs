use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Path, Query, Request, State},
    http::Method,
    routing::{get, post},
    Json,
    Router,
};
use bytes::Bytes;
use data_model::DeleteSelector;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::{
    dispatch::Dispatcher,
    http_objects::{
        ApiError,
        CreateSnapshotRequest,
        DeleteSnapshotsRequest,
        DeletedSnapshots,
        DispatchRequest,
        DispatchResponse,
        ProcessResponse,
        ProcessStatus,
        RestoreSnapshotRequest,
        RestoreSnapshotResponse,
        SandboxRequest,
        Snapshot,
        SnapshotCreated,
        SnapshotDetails,
        SnapshotList,
        SnapshotStatus,
        TeardownResponse,
        TenantRequest,
    },
    lifecycle::{IdleMonitor, LifecycleManager},
    snapshots::SnapshotStore,
};

#[derive(OpenApi)]
#[openapi(
        paths(
            create_snapshot,
            list_snapshots,
            latest_snapshot,
            describe_snapshot,
            delete_snapshots,
            restore_snapshot,
            ensure_running,
            dispatch_work,
            restart_sandbox,
            reset_sandbox,
            factory_reset_sandbox,
        ),
        components(
            schemas(
                ApiError,
                TenantRequest,
                CreateSnapshotRequest,
                SnapshotCreated,
                SnapshotStatus,
                Snapshot,
                SnapshotDetails,
                SnapshotList,
                DeleteSnapshotsRequest,
                DeletedSnapshots,
                RestoreSnapshotRequest,
                RestoreSnapshotResponse,
                SandboxRequest,
                ProcessResponse,
                ProcessStatus,
                DispatchRequest,
                DispatchResponse,
                TeardownResponse,
            )
        ),
        tags(
            (name = "sandkeep", description = "Sandbox lifecycle and snapshot API")
        )
    )]
pub struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub store: Arc<SnapshotStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub idle: Arc<IdleMonitor>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/docs/openapi.json", get(openapi))
        .route(
            "/v1/snapshots",
            post(create_snapshot)
                .get(list_snapshots)
                .delete(delete_snapshots),
        )
        .route("/v1/snapshots/latest", get(latest_snapshot))
        .route("/v1/snapshots/{key}", get(describe_snapshot))
        .route("/v1/snapshots/restore", post(restore_snapshot))
        .route("/v1/sandboxes/ensure-running", post(ensure_running))
        .route("/v1/sandboxes/dispatch", post(dispatch_work))
        .route("/v1/sandboxes/restart", post(restart_sandbox))
        .route("/v1/sandboxes/reset", post(reset_sandbox))
        .route("/v1/sandboxes/factory-reset", post(factory_reset_sandbox))
        .with_state(route_state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Snapshot the tenant's sandbox now
#[utoipa::path(
    post,
    path = "/v1/snapshots",
    request_body = CreateSnapshotRequest,
    tag = "snapshots",
    responses(
        (status = 200, description = "Snapshot created, or nothing to snapshot", body = SnapshotCreated),
        (status = SERVICE_UNAVAILABLE, description = "Sandbox unreachable, retry later"),
        (status = INTERNAL_SERVER_ERROR, description = "Archive or upload failed")
    ),
)]
async fn create_snapshot(
    State(state): State<RouteState>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Result<Json<SnapshotCreated>, ApiError> {
    let scope = request.tenant.scope()?;
    let outcome = state.lifecycle.snapshot(&scope, request.reason()).await?;
    Ok(Json(outcome.into()))
}

/// List the tenant's snapshots, newest first
#[utoipa::path(
    get,
    path = "/v1/snapshots",
    params(TenantRequest),
    tag = "snapshots",
    responses(
        (status = 200, description = "Snapshots for the tenant", body = SnapshotList),
        (status = BAD_REQUEST, description = "Invalid tenant")
    ),
)]
async fn list_snapshots(
    State(state): State<RouteState>,
    Query(tenant): Query<TenantRequest>,
) -> Result<Json<SnapshotList>, ApiError> {
    let scope = tenant.scope()?;
    let snapshots = state.store.list(&scope).await?;
    Ok(Json(SnapshotList {
        snapshots: snapshots.into_iter().map(Snapshot::from).collect(),
    }))
}

/// Get the tenant's newest snapshot
#[utoipa::path(
    get,
    path = "/v1/snapshots/latest",
    params(TenantRequest),
    tag = "snapshots",
    responses(
        (status = 200, description = "Newest snapshot", body = Snapshot),
        (status = NOT_FOUND, description = "No snapshots found")
    ),
)]
async fn latest_snapshot(
    State(state): State<RouteState>,
    Query(tenant): Query<TenantRequest>,
) -> Result<Json<Snapshot>, ApiError> {
    let scope = tenant.scope()?;
    match state.store.latest(&scope).await? {
        Some(latest) => Ok(Json(latest.into())),
        None => Err(ApiError::not_found("no snapshots found")),
    }
}

/// Describe one snapshot. The key is URL-encoded into a single segment.
#[utoipa::path(
    get,
    path = "/v1/snapshots/{key}",
    params(
        ("key" = String, Path, description = "Snapshot key"),
        TenantRequest,
    ),
    tag = "snapshots",
    responses(
        (status = 200, description = "Snapshot details", body = SnapshotDetails),
        (status = FORBIDDEN, description = "Key belongs to another tenant"),
        (status = NOT_FOUND, description = "Key not found")
    ),
)]
async fn describe_snapshot(
    State(state): State<RouteState>,
    Path(key): Path<String>,
    Query(tenant): Query<TenantRequest>,
) -> Result<Json<SnapshotDetails>, ApiError> {
    let scope = tenant.scope()?;
    match state.store.describe(&scope, &key).await? {
        Some(description) => Ok(Json(description.into())),
        None => Err(ApiError::not_found(&format!("snapshot {} not found", key))),
    }
}

/// Delete one snapshot, or all of the tenant's snapshots
#[utoipa::path(
    delete,
    path = "/v1/snapshots",
    request_body = DeleteSnapshotsRequest,
    tag = "snapshots",
    responses(
        (status = 200, description = "Deleted keys", body = DeletedSnapshots),
        (status = FORBIDDEN, description = "Key belongs to another tenant"),
        (status = NOT_FOUND, description = "Key not found")
    ),
)]
async fn delete_snapshots(
    State(state): State<RouteState>,
    Json(request): Json<DeleteSnapshotsRequest>,
) -> Result<Json<DeletedSnapshots>, ApiError> {
    let scope = request.tenant.scope()?;
    if request.selector.trim().is_empty() {
        return Err(ApiError::bad_request("selector is required"));
    }
    let deleted = state
        .store
        .delete(&scope, &DeleteSelector::parse(&request.selector))
        .await?;
    Ok(Json(DeletedSnapshots { deleted }))
}

/// Restore a snapshot into the tenant's sandbox
#[utoipa::path(
    post,
    path = "/v1/snapshots/restore",
    request_body = RestoreSnapshotRequest,
    tag = "snapshots",
    responses(
        (status = 200, description = "Snapshot restored", body = RestoreSnapshotResponse),
        (status = FORBIDDEN, description = "Key belongs to another tenant"),
        (status = NOT_FOUND, description = "Snapshot not found"),
        (status = SERVICE_UNAVAILABLE, description = "Sandbox unreachable, retry later"),
        (status = INTERNAL_SERVER_ERROR, description = "Restore failed; a restart may be needed")
    ),
)]
async fn restore_snapshot(
    State(state): State<RouteState>,
    Json(request): Json<RestoreSnapshotRequest>,
) -> Result<Json<RestoreSnapshotResponse>, ApiError> {
    let scope = request.tenant.scope()?;
    let report = state
        .lifecycle
        .restore(&scope, &request.key, request.mark_as_latest)
        .await?;
    Ok(Json(report.into()))
}

/// Make sure the persistent process is running
#[utoipa::path(
    post,
    path = "/v1/sandboxes/ensure-running",
    request_body = SandboxRequest,
    tag = "sandboxes",
    responses(
        (status = 200, description = "Process running", body = ProcessResponse),
        (status = SERVICE_UNAVAILABLE, description = "Sandbox unreachable, retry later"),
        (status = INTERNAL_SERVER_ERROR, description = "Process failed to start")
    ),
)]
async fn ensure_running(
    State(state): State<RouteState>,
    Json(request): Json<SandboxRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let scope = request.tenant.scope()?;
    state.idle.touch(&scope);
    let (process, _) = state
        .lifecycle
        .ensure_running(&scope, &request.settings())
        .await?;
    Ok(Json(process.into()))
}

/// Hand one unit of work to the tenant's sandbox
#[utoipa::path(
    post,
    path = "/v1/sandboxes/dispatch",
    request_body = DispatchRequest,
    tag = "sandboxes",
    responses(
        (status = 200, description = "Work handled", body = DispatchResponse),
        (status = SERVICE_UNAVAILABLE, description = "Sandbox unreachable, retry later")
    ),
)]
async fn dispatch_work(
    State(state): State<RouteState>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    let scope = request.sandbox.tenant.scope()?;
    let payload = serde_json::to_vec(&request.payload)
        .map_err(|e| ApiError::bad_request(&e.to_string()))?;
    let response = state
        .dispatcher
        .dispatch(&scope, &request.sandbox.settings(), Bytes::from(payload))
        .await?;
    Ok(Json(response.into()))
}

/// Snapshot, then restart the persistent process
#[utoipa::path(
    post,
    path = "/v1/sandboxes/restart",
    request_body = TenantRequest,
    tag = "sandboxes",
    responses(
        (status = 200, description = "Restarted", body = TeardownResponse),
        (status = SERVICE_UNAVAILABLE, description = "Sandbox unreachable, retry later")
    ),
)]
async fn restart_sandbox(
    State(state): State<RouteState>,
    Json(tenant): Json<TenantRequest>,
) -> Result<Json<TeardownResponse>, ApiError> {
    let scope = tenant.scope()?;
    let report = state.lifecycle.restart(&scope).await?;
    Ok(Json(report.into()))
}

/// Snapshot, then destroy the sandbox
#[utoipa::path(
    post,
    path = "/v1/sandboxes/reset",
    request_body = TenantRequest,
    tag = "sandboxes",
    responses(
        (status = 200, description = "Reset", body = TeardownResponse),
        (status = SERVICE_UNAVAILABLE, description = "Sandbox unreachable, retry later")
    ),
)]
async fn reset_sandbox(
    State(state): State<RouteState>,
    Json(tenant): Json<TenantRequest>,
) -> Result<Json<TeardownResponse>, ApiError> {
    let scope = tenant.scope()?;
    state.idle.forget(&scope.sandbox_id());
    let report = state.lifecycle.reset(&scope).await?;
    Ok(Json(report.into()))
}

/// Snapshot, wipe the watched directories, then destroy the sandbox
#[utoipa::path(
    post,
    path = "/v1/sandboxes/factory-reset",
    request_body = TenantRequest,
    tag = "sandboxes",
    responses(
        (status = 200, description = "Factory reset", body = TeardownResponse),
        (status = SERVICE_UNAVAILABLE, description = "Sandbox unreachable, retry later")
    ),
)]
async fn factory_reset_sandbox(
    State(state): State<RouteState>,
    Json(tenant): Json<TenantRequest>,
) -> Result<Json<TeardownResponse>, ApiError> {
    let scope = tenant.scope()?;
    state.idle.forget(&scope.sandbox_id());
    let report = state.lifecycle.factory_reset(&scope).await?;
    Ok(Json(report.into()))
}
