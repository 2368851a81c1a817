//! API request handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::types::*;
use crate::models::ServiceTemplate;
use crate::orchestrator::{Operation, Outcome};
use crate::{Error, Orchestrator};

pub type AppState = Arc<Orchestrator>;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

// === Health ===

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// === Service templates ===

pub async fn list_templates(State(orch): State<AppState>) -> ApiResult<Json<Vec<TemplateResponse>>> {
    let templates = orch.list_templates().map_err(to_api_error)?;
    Ok(Json(templates.into_iter().map(TemplateResponse::from).collect()))
}

pub async fn create_template(
    State(orch): State<AppState>,
    Json(template): Json<ServiceTemplate>,
) -> ApiResult<(StatusCode, Json<TemplateResponse>)> {
    let id = orch.create_template(template).map_err(to_api_error)?;
    let stored = orch.get_template(id).map_err(to_api_error)?;
    Ok((StatusCode::CREATED, Json(stored.into())))
}

pub async fn get_template(
    State(orch): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<TemplateResponse>> {
    let template = orch.get_template(id).map_err(to_api_error)?;
    Ok(Json(template.into()))
}

pub async fn delete_template(
    State(orch): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ApiSuccess>> {
    orch.delete_template(id).map_err(to_api_error)?;
    Ok(Json(ApiSuccess {
        message: format!("Service template {} deleted", id),
    }))
}

pub async fn instantiate(
    State(orch): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<InstantiateServiceRequest>,
) -> ApiResult<(StatusCode, Json<ServiceCreated>)> {
    let user = req.user.unwrap_or_else(|| crate::ADMIN_USER.to_string());
    let service_id = orch.instantiate(id, &req.merge, &user).map_err(to_api_error)?;
    Ok((StatusCode::CREATED, Json(ServiceCreated { id: service_id })))
}

// === Services ===

pub async fn list_services(State(orch): State<AppState>) -> Json<Vec<ServiceResponse>> {
    Json(orch.list().into_iter().map(ServiceResponse::from).collect())
}

pub async fn get_service(
    State(orch): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ServiceResponse>> {
    let service = orch.show(id).map_err(to_api_error)?;
    Ok(Json(service.into()))
}

pub async fn delete_service(
    State(orch): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Json<ApiSuccess>> {
    orch.delete(id, query.force).map_err(to_api_error)?;
    Ok(Json(ApiSuccess {
        message: format!("Service {} deleted", id),
    }))
}

pub async fn recover_service(
    State(orch): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ApiSuccess>> {
    orch.recover(id).map_err(to_api_error)?;
    Ok(Json(ApiSuccess {
        message: format!("Service {} recovering", id),
    }))
}

pub async fn shutdown_service(
    State(orch): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<ApiSuccess>> {
    orch.shutdown(id).map_err(to_api_error)?;
    Ok(Json(ApiSuccess {
        message: format!("Service {} undeploying", id),
    }))
}

pub async fn scale_role(
    State(orch): State<AppState>,
    Path((id, role)): Path<(u64, String)>,
    Json(req): Json<ScaleRequest>,
) -> ApiResult<Json<ApiSuccess>> {
    orch.scale(id, &role, req.cardinality, req.force)
        .map_err(to_api_error)?;
    Ok(Json(ApiSuccess {
        message: format!("Role '{}' of service {} scaling to {}", role, id, req.cardinality),
    }))
}

/// Typed operation endpoint: `{"op": "scale", "service_id": 1, ...}`
pub async fn operation(
    State(orch): State<AppState>,
    Json(op): Json<Operation>,
) -> ApiResult<Json<Outcome>> {
    let outcome = orch.dispatch(op).map_err(to_api_error)?;
    Ok(Json(outcome))
}

// === Reconcile ===

pub async fn reconcile(State(orch): State<AppState>) -> ApiResult<Json<ReconcileResponse>> {
    let stepped = tokio::task::spawn_blocking(move || orch.reconcile_all())
        .await
        .map_err(|e| to_api_error(Error::Other(e.to_string())))?;
    Ok(Json(ReconcileResponse { stepped }))
}

// === Helpers ===

fn to_api_error(e: Error) -> (StatusCode, Json<ApiError>) {
    let (status, kind) = match &e {
        Error::Validation(_) => (StatusCode::BAD_REQUEST, "Validation"),
        Error::Conflict(_) => (StatusCode::CONFLICT, "Conflict"),
        Error::InvalidState { .. } => (StatusCode::CONFLICT, "InvalidState"),
        Error::ServiceNotFound(_) => (StatusCode::NOT_FOUND, "ServiceNotFound"),
        Error::TemplateNotFound(_) => (StatusCode::NOT_FOUND, "TemplateNotFound"),
        Error::RoleNotFound(_) => (StatusCode::NOT_FOUND, "RoleNotFound"),
        Error::VmNotFound(_) => (StatusCode::NOT_FOUND, "VmNotFound"),
        Error::TransientInfra(_) => (StatusCode::SERVICE_UNAVAILABLE, "TransientInfra"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
    };

    (
        status,
        Json(ApiError {
            error: kind.to_string(),
            message: e.to_string(),
        }),
    )
}
