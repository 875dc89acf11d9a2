//! Command REST endpoints: the producer surface of the pipeline
//!
//! Creating a command writes the durable row and enqueues a dispatch
//! job; everything past that point happens in the worker and the
//! device socket. Cancel and retry are guarded transitions, so a
//! request that arrives too late gets a 409 instead of clobbering
//! state the pipeline already moved past.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{Command, CommandStatus, CommandType, NewCommand, TargetType};
use crate::dispatch::Lane;

use super::ApiState;

/// Request body for creating a command
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCommandBody {
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub target_type: TargetType,
    pub target_device_id: Option<String>,
    pub target_group_id: Option<String>,
    pub command_name: String,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

/// Single-command response wrapper
#[derive(Serialize)]
pub struct CommandResponse {
    pub command: Command,
}

/// List response wrapper
#[derive(Serialize)]
pub struct CommandListResponse {
    pub commands: Vec<Command>,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn empty_params() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<CommandStatus>,
    pub limit: Option<usize>,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn err(code: StatusCode, message: impl Into<String>) -> ApiError {
    (
        code,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!(error = %e, "command endpoint failed");
    err(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

/// Build command routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_commands).post(create_command))
        .route("/{id}", get(get_command))
        .route("/{id}/cancel", post(cancel_command))
        .route("/{id}/retry", post(retry_command))
        .with_state(state)
}

/// List commands, newest first, optionally filtered by status
async fn list_commands(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<CommandListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let commands = state
        .command_repo
        .list(query.status, limit)
        .map_err(internal)?;
    Ok(Json(CommandListResponse { commands }))
}

/// Get a single command
async fn get_command(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    state
        .command_repo
        .find(&id)
        .map_err(internal)?
        .map(|command| Json(CommandResponse { command }))
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "command not found"))
}

/// Create a command and enqueue it for dispatch
async fn create_command(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateCommandBody>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    validate(&body)?;

    let command = state
        .command_repo
        .create(&NewCommand {
            kind: body.kind,
            target_type: body.target_type,
            target_device_id: body.target_device_id,
            target_group_id: body.target_group_id,
            command_name: body.command_name,
            params: body.params,
            scheduled_at: body.scheduled_at,
            created_by: body.created_by,
        })
        .map_err(internal)?;

    // Scheduled commands wait in the scheduled lane until due; the
    // scheduler promotes them into the command lane at that point.
    match command.scheduled_at {
        Some(due) => {
            let delay = (due - Utc::now()).to_std().ok();
            state
                .queue
                .enqueue(Lane::Scheduled, &command.id, delay)
                .map_err(internal)?;
        }
        None => {
            state
                .queue
                .enqueue(Lane::Commands, &command.id, None)
                .map_err(internal)?;
        }
    }

    tracing::info!(
        command_id = %command.id,
        command_name = %command.command_name,
        target_type = command.target_type.as_str(),
        "command created"
    );
    Ok((StatusCode::CREATED, Json(CommandResponse { command })))
}

/// Cancel a command that has not yet been picked up
///
/// Only PENDING and QUEUED commands are cancellable; anything further
/// along answers 409. Waiting dispatch jobs for the command are purged
/// so a cancelled command is never delivered.
async fn cancel_command(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let cancelled = state.command_repo.cancel(&id).map_err(internal)?;
    if !cancelled {
        return match state.command_repo.find(&id).map_err(internal)? {
            Some(command) => Err(err(
                StatusCode::CONFLICT,
                format!("command is {}, not cancellable", command.status.as_str()),
            )),
            None => Err(err(StatusCode::NOT_FOUND, "command not found")),
        };
    }

    state.queue.cancel_for_command(&id).map_err(internal)?;

    let command = state
        .command_repo
        .find(&id)
        .map_err(internal)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "command not found"))?;

    tracing::info!(command_id = %id, "command cancelled");
    Ok(Json(CommandResponse { command }))
}

/// Re-queue a FAILED command for another delivery attempt
async fn retry_command(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<CommandResponse>, ApiError> {
    let requeued = state.command_repo.retry(&id).map_err(internal)?;
    if !requeued {
        return match state.command_repo.find(&id).map_err(internal)? {
            Some(command) => Err(err(
                StatusCode::CONFLICT,
                format!("command is {}, only FAILED commands can be retried", command.status.as_str()),
            )),
            None => Err(err(StatusCode::NOT_FOUND, "command not found")),
        };
    }

    state
        .queue
        .enqueue(Lane::Commands, &id, None)
        .map_err(internal)?;

    let command = state
        .command_repo
        .find(&id)
        .map_err(internal)?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "command not found"))?;

    tracing::info!(command_id = %id, retry_count = command.retry_count, "command requeued");
    Ok(Json(CommandResponse { command }))
}

fn validate(body: &CreateCommandBody) -> Result<(), ApiError> {
    if body.command_name.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "commandName is required"));
    }
    if body.created_by.trim().is_empty() {
        return Err(err(StatusCode::BAD_REQUEST, "createdBy is required"));
    }

    match body.target_type {
        TargetType::Device if body.target_device_id.is_none() => Err(err(
            StatusCode::BAD_REQUEST,
            "targetDeviceId is required for DEVICE targets",
        )),
        TargetType::Group if body.target_group_id.is_none() => Err(err(
            StatusCode::BAD_REQUEST,
            "targetGroupId is required for GROUP targets",
        )),
        _ => Ok(()),
    }
}
