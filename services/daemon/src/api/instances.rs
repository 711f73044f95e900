//! Instance API endpoints.
//!
//! Listing is exposed under three collections that differ only in the
//! instance type they imply and in the URLs they return.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::client::CLUSTER_NOTIFIER_USER_AGENT;
use crate::listing::{ListingParams, ListingRequest, ListingResult, Route, DEFAULT_PROJECT};
use crate::operation::Operation;
use crate::state::AppState;
use crate::update::{self, InstancePut};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/instances", get(list_instances))
        .route("/containers", get(list_containers))
        .route("/virtual-machines", get(list_virtual_machines))
        .route("/instances/{name}", put(update_instance))
        .route("/operations/{id}", get(get_operation))
        .route("/operations/{id}/wait", get(wait_operation))
}

// =============================================================================
// Response envelopes
// =============================================================================

/// Envelope of a synchronous response.
#[derive(Debug, Serialize)]
pub struct SyncResponse<T> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: &'static str,
    pub status_code: u16,
    pub metadata: T,
}

impl<T> SyncResponse<T> {
    pub fn success(metadata: T) -> Self {
        Self {
            kind: "sync",
            status: "Success",
            status_code: 200,
            metadata,
        }
    }
}

/// Envelope of a response that started a background operation.
#[derive(Debug, Serialize)]
pub struct AsyncResponse {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub status: &'static str,
    pub status_code: u16,
    /// Path of the operation resource.
    pub operation: String,
    pub metadata: Operation,
}

impl AsyncResponse {
    pub fn created(operation: Operation) -> Self {
        Self {
            kind: "async",
            status: "Operation Created",
            status_code: 100,
            operation: operation.url(),
            metadata: operation,
        }
    }
}

/// Query parameters of single-instance endpoints.
#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    pub project: Option<String>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListingParams>,
) -> Result<Json<SyncResponse<ListingResult>>, ApiError> {
    list(&state, Route::Instances, &headers, &params).await
}

async fn list_containers(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListingParams>,
) -> Result<Json<SyncResponse<ListingResult>>, ApiError> {
    list(&state, Route::Containers, &headers, &params).await
}

async fn list_virtual_machines(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListingParams>,
) -> Result<Json<SyncResponse<ListingResult>>, ApiError> {
    list(&state, Route::VirtualMachines, &headers, &params).await
}

async fn list(
    state: &AppState,
    route: Route,
    headers: &HeaderMap,
    params: &ListingParams,
) -> Result<Json<SyncResponse<ListingResult>>, ApiError> {
    let request = ListingRequest::from_params(route, params, is_cluster_notification(headers))?;
    let result = state.lister().list_with_retry(&request).await?;
    Ok(Json(SyncResponse::success(result)))
}

/// Requests forwarded by another cluster member identify themselves through
/// their user agent.
fn is_cluster_notification(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ua| ua == CLUSTER_NOTIFIER_USER_AGENT)
}

async fn update_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ProjectQuery>,
    Json(put): Json<InstancePut>,
) -> Result<impl IntoResponse, ApiError> {
    let project = query.project.unwrap_or_else(|| DEFAULT_PROJECT.to_string());
    let operation =
        update::update_instance(state.instances(), state.operations(), &project, &name, put)
            .await?;

    let location = operation.url();
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, location)],
        Json(AsyncResponse::created(operation)),
    ))
}

async fn get_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncResponse<Operation>>, ApiError> {
    state
        .operations()
        .get(id)
        .map(|op| Json(SyncResponse::success(op)))
        .ok_or_else(|| operation_not_found(id))
}

async fn wait_operation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SyncResponse<Operation>>, ApiError> {
    state
        .operations()
        .wait(id)
        .await
        .map(|op| Json(SyncResponse::success(op)))
        .ok_or_else(|| operation_not_found(id))
}

fn operation_not_found(id: Uuid) -> ApiError {
    ApiError::not_found("operation_not_found", format!("operation {id} not found"))
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_cluster_notification_header() {
        let mut headers = HeaderMap::new();
        assert!(!is_cluster_notification(&headers));

        headers.insert(header::USER_AGENT, HeaderValue::from_static("curl/8.0"));
        assert!(!is_cluster_notification(&headers));

        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(CLUSTER_NOTIFIER_USER_AGENT),
        );
        assert!(is_cluster_notification(&headers));
    }

    #[test]
    fn test_sync_envelope() {
        let body = SyncResponse::success(ListingResult::Urls(vec![
            "/1.0/instances/c1".to_string()
        ]));
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["type"], "sync");
        assert_eq!(json["status"], "Success");
        assert_eq!(json["status_code"], 200);
        assert_eq!(json["metadata"][0], "/1.0/instances/c1");
    }
}
