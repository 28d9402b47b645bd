//! REST API Handlers
//!
//! Implements the REST endpoints for mapping-domain management, backend
//! metadata, bulk identity conversion, and cache maintenance.

use crate::daemon::client::ClientSession;
use crate::domain::ports::UnixId;
use crate::error::Error;
use crate::idmap::backend::IdmapBackend;
use crate::idmap::domain::{DomainCreate, DomainUpdate};
use crate::idmap::store::DomainStore;
use crate::idmap::sync::CacheSynchronizer;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Query options for domain listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainQuery {
    /// Attach live daemon info to each entry
    #[serde(default)]
    pub domain_info: bool,
}

/// Bulk SID conversion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertSidsRequest {
    pub sids: Vec<String>,
}

/// Bulk Unix id conversion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertUnixIdsRequest {
    pub ids: Vec<UnixId>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Map a middleware error onto an HTTP response
fn error_response(err: Error) -> (StatusCode, Json<ApiErrorResponse>) {
    let (status, label) = match &err {
        Error::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_failed"),
        Error::PermissionDenied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
        Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::AlreadyExists { .. } => (StatusCode::CONFLICT, "already_exists"),
        Error::DaemonUnavailable { .. } => (StatusCode::SERVICE_UNAVAILABLE, "daemon_unavailable"),
        Error::DaemonTimeout { .. } => (StatusCode::SERVICE_UNAVAILABLE, "daemon_timeout"),
        Error::DaemonProtocol { .. } => (StatusCode::BAD_GATEWAY, "daemon_protocol"),
        Error::Configuration(_) | Error::LdapBind(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    let details = err.daemon_code().map(|code| format!("daemon error code {code}"));
    (
        status,
        Json(ApiErrorResponse {
            error: label.to_string(),
            message: err.to_string(),
            details,
        }),
    )
}

// =============================================================================
// REST Router
// =============================================================================

/// Shared application state
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<DomainStore>,
    pub session: Arc<ClientSession>,
    pub sync: Arc<CacheSynchronizer>,
}

/// REST API router builder
pub struct RestRouter {
    state: ApiState,
}

impl RestRouter {
    pub fn new(store: Arc<DomainStore>, session: Arc<ClientSession>, sync: Arc<CacheSynchronizer>) -> Self {
        Self {
            state: ApiState {
                store,
                session,
                sync,
            },
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        Router::new()
            // Domain CRUD
            .route("/v1/idmap", get(list_domains).post(create_domain))
            .route(
                "/v1/idmap/:id",
                get(get_domain).put(update_domain).delete(delete_domain),
            )
            // Backend metadata
            .route("/v1/idmap/backend_options", get(backend_options))
            .route("/v1/idmap/backend_choices", get(backend_choices))
            .route("/v1/idmap/options_choices/:backend", get(options_choices))
            // Conversion
            .route("/v1/idmap/convert_sids", post(convert_sids))
            .route("/v1/idmap/convert_unixids", post(convert_unix_ids))
            .route("/v1/idmap/domain_info/:name", get(domain_info))
            .route("/v1/idmap/online_status", get(online_status))
            // Maintenance
            .route("/v1/idmap/clear_cache", post(clear_cache))
            // Probes
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(
                tower::ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.state)
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_domains(
    State(state): State<ApiState>,
    Query(query): Query<DomainQuery>,
) -> Response {
    match state.store.query_extended(&[], query.domain_info).await {
        Ok(entries) => Json(entries).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn get_domain(State(state): State<ApiState>, Path(id): Path<i64>) -> Response {
    match state.store.get(id).await {
        Ok(domain) => Json(domain).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn create_domain(
    State(state): State<ApiState>,
    Json(request): Json<DomainCreate>,
) -> Response {
    info!(domain = %request.name, "creating idmap domain");
    match state.store.create(request).await {
        Ok(domain) => (StatusCode::CREATED, Json(domain)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn update_domain(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(request): Json<DomainUpdate>,
) -> Response {
    match state.store.update(id, request).await {
        Ok(domain) => Json(domain).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn delete_domain(State(state): State<ApiState>, Path(id): Path<i64>) -> Response {
    match state.store.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

/// Full information about every idmap backend's options
async fn backend_options() -> Response {
    let mut out = serde_json::Map::new();
    for backend in IdmapBackend::ALL {
        let descriptor = backend.describe();
        let parameters: serde_json::Map<String, serde_json::Value> = descriptor
            .parameters
            .iter()
            .map(|p| {
                (
                    p.key.to_string(),
                    serde_json::json!({
                        "required": p.required,
                        "default": p.default.map(|d| d.to_json()),
                    }),
                )
            })
            .collect();
        out.insert(
            backend.as_str().to_string(),
            serde_json::json!({
                "description": descriptor.description,
                "parameters": parameters,
                "has_secrets": descriptor.has_secrets,
                "services": descriptor.services,
            }),
        );
    }
    Json(serde_json::Value::Object(out)).into_response()
}

/// Valid backend choices per directory service
async fn backend_choices() -> Response {
    let choices: serde_json::Map<String, serde_json::Value> = IdmapBackend::ds_choices()
        .into_iter()
        .map(|(kind, backends)| {
            let label = match kind {
                crate::domain::ports::DirectoryServiceKind::ActiveDirectory => "AD",
                crate::domain::ports::DirectoryServiceKind::Ldap => "LDAP",
            };
            (
                label.to_string(),
                serde_json::json!(backends
                    .iter()
                    .map(|b| b.as_str())
                    .collect::<Vec<_>>()),
            )
        })
        .collect();
    Json(serde_json::Value::Object(choices)).into_response()
}

/// Supported option keys for one backend
async fn options_choices(Path(backend): Path<String>) -> Response {
    match IdmapBackend::from_str(&backend) {
        Ok(backend) => Json(backend.supported_keys()).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn convert_sids(
    State(state): State<ApiState>,
    Json(request): Json<ConvertSidsRequest>,
) -> Response {
    match state.session.convert_sids(&request.sids).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn convert_unix_ids(
    State(state): State<ApiState>,
    Json(request): Json<ConvertUnixIdsRequest>,
) -> Response {
    match state.session.convert_unix_ids(&request.ids).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn domain_info(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    match state.session.domain_info(&name).await {
        Ok(info) => Json(info).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn online_status(State(state): State<ApiState>) -> Response {
    match state.session.online_status().await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

/// Clear the daemon's mapping caches. Idempotent; safe to call when the
/// daemon is already stopped.
async fn clear_cache(State(state): State<ApiState>) -> Response {
    match state.sync.clear_cache().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn readiness_check() -> impl IntoResponse {
    StatusCode::OK
}
