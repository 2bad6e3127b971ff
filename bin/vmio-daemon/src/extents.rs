//! /images/{id}/extents handler

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde_json::Value;
use tracing::debug;

use vmio_auth::ticket::Op;
use vmio_common::extent::ExtentContext;
use vmio_common::{Clock, Error};

use crate::errors::ApiResult;
use crate::state::{SharedState, checkin, checkout};

pub async fn get(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let context: ExtentContext = query
        .get("context")
        .map_or("zero", String::as_str)
        .parse()?;

    let ticket = state.auth.authorize(&ticket_id, Op::Read)?;

    // The ticket must ask for dirty extents upfront, the backend is
    // configured for them at open time.
    if context == ExtentContext::Dirty && !ticket.dirty() {
        return Err(Error::NotFound("ticket does not support dirty extents".to_string()).into());
    }

    debug!(
        transfer = ticket.transfer_id(),
        context = context.as_str(),
        "EXTENTS"
    );

    let clock = Clock::new();
    let mut ctx = checkout(&state, &ticket).await?;
    let result = {
        let _timer = clock.run("extents");
        match context {
            ExtentContext::Zero => ctx
                .backend
                .zero_extents()
                .await
                .map(|extents| serde_json::json!(extents)),
            ExtentContext::Dirty => ctx
                .backend
                .dirty_extents()
                .await
                .map(|extents| serde_json::json!(extents)),
        }
    };
    checkin(&ticket, ctx, result.is_err()).await;
    debug!(transfer = ticket.transfer_id(), %clock, "EXTENTS done");

    Ok(Json(result?))
}
