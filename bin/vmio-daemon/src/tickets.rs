//! /tickets/{id} handlers
//!
//! The tickets API is served only on the control socket; the data
//! service never exposes it.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::Value;
use tracing::info;

use vmio_auth::AuthError;
use vmio_common::Error;

use crate::errors::{ApiError, ApiResult};
use crate::state::SharedState;

pub async fn get(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let ticket = state.auth.get(&ticket_id)?;
    Ok(Json(ticket.info()))
}

pub async fn put(
    State(state): State<SharedState>,
    Path(_ticket_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let value: Value = serde_json::from_slice(&body).map_err(|err| {
        ApiError(Error::invalid_argument(format!(
            "ticket is not in a JSON format: {err}"
        )))
    })?;
    state.auth.add(&value)?;
    Ok(StatusCode::OK)
}

pub async fn patch(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let patch: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError(Error::invalid_argument(format!("invalid patch: {err}"))))?;
    let timeout = patch["timeout"]
        .as_u64()
        .ok_or_else(|| ApiError(Error::invalid_argument("timeout is required and must be >= 0")))?;

    state
        .auth
        .extend(&ticket_id, std::time::Duration::from_secs(timeout))?;
    Ok(StatusCode::OK)
}

/// DELETE is idempotent; the client may retry after network failures.
pub async fn delete(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
) -> ApiResult<StatusCode> {
    match state.auth.remove(&ticket_id).await {
        // Already deleted.
        Ok(()) | Err(AuthError::NoSuchTicket(_)) => Ok(StatusCode::NO_CONTENT),
        Err(err) => Err(err.into()),
    }
}

pub async fn delete_all(State(state): State<SharedState>) -> ApiResult<StatusCode> {
    info!("removing all tickets");
    state.auth.clear().await?;
    Ok(StatusCode::NO_CONTENT)
}
