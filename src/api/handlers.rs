//! Route handlers and the shared server state they close over.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::supervisor::{ControlError, ProjectSnapshot, Supervisor};

#[derive(Clone)]
pub struct ServerState {
    pub supervisor: Arc<Supervisor>,
}

/// Maps `ControlError` onto the HTTP status codes the control API surface
/// promises (§10.6): not-registered and not-in-the-right-state are client
/// errors, everything from the core is a server error.
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::ProjectNotFound(_) => StatusCode::NOT_FOUND,
            ControlError::NotAwaitingReview(_) | ControlError::NoActiveMilestone(_) => StatusCode::CONFLICT,
            ControlError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterProjectRequest {
    pub path: std::path::PathBuf,
    pub display_name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterProjectResponse {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct GuidanceRequest {
    pub text: String,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn register_project(
    State(state): State<ServerState>,
    Json(req): Json<RegisterProjectRequest>,
) -> Result<Json<RegisterProjectResponse>, ApiError> {
    let id = state.supervisor.register_project(req.path, req.display_name).await?;
    Ok(Json(RegisterProjectResponse { id }))
}

pub async fn list_projects(State(state): State<ServerState>) -> Json<Vec<ProjectSnapshot>> {
    Json(state.supervisor.list_projects().await)
}

pub async fn remove_project(State(state): State<ServerState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.supervisor.remove_project(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_project_snapshot(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProjectSnapshot>, ApiError> {
    Ok(Json(state.supervisor.get_snapshot(id).await?))
}

pub async fn wake_now(State(state): State<ServerState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.supervisor.wake_now(id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn pause(State(state): State<ServerState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.supervisor.pause(id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn resume(State(state): State<ServerState>, Path(id): Path<Uuid>) -> Result<StatusCode, ApiError> {
    state.supervisor.resume(id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn cancel_milestone(
    State(state): State<ServerState>,
    Path((id, milestone_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.cancel_milestone(id, milestone_id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn approve_milestone(
    State(state): State<ServerState>,
    Path((id, milestone_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.approve_awaiting_review(id, milestone_id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn reject_milestone(
    State(state): State<ServerState>,
    Path((id, milestone_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.reject_awaiting_review(id, milestone_id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn provide_guidance(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
    Json(req): Json<GuidanceRequest>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.provide_guidance(id, req.text).await?;
    Ok(StatusCode::ACCEPTED)
}

fn to_sse_event(result: Result<crate::events::AnimaEvent, BroadcastStreamRecvError>) -> Result<Event, Infallible> {
    match result {
        Ok(event) => Ok(Event::default()
            .event(format!("{:?}", event.kind))
            .json_data(&event)
            .unwrap_or_else(|_| Event::default())),
        Err(BroadcastStreamRecvError::Lagged(n)) => {
            Ok(Event::default().event("lagged").data(n.to_string()))
        }
    }
}

pub async fn subscribe_events_all(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.supervisor.subscribe_all();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).map(to_sse_event);
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)))
}

pub async fn subscribe_events_project(
    State(state): State<ServerState>,
    Path(id): Path<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.supervisor.subscribe_all();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx)
        .filter(move |result| matches!(result, Ok(event) if event.project_id == id) || matches!(result, Err(_)))
        .map(to_sse_event);
    Sse::new(stream).keep_alive(axum::response::sse::KeepAlive::new().interval(Duration::from_secs(15)))
}
