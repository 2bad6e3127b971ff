//! Request routing

use axum::Router;
use axum::routing::{delete, get};

use crate::state::SharedState;
use crate::{checksum, extents, images, tickets};

/// Routes of the data services (remote TCP and local Unix socket).
pub fn data_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/images/{id}",
            get(images::get)
                .put(images::put)
                .patch(images::patch)
                .options(images::options),
        )
        .route("/images/{id}/extents", get(extents::get))
        .route("/images/{id}/checksum", get(checksum::get))
        .route(
            "/images/{id}/checksum/algorithms",
            get(checksum::algorithms),
        )
        .with_state(state)
}

/// Routes of the control service (Unix socket only).
pub fn control_router(state: SharedState) -> Router {
    Router::new()
        .route(
            "/tickets/{id}",
            get(tickets::get)
                .put(tickets::put)
                .patch(tickets::patch)
                .delete(tickets::delete),
        )
        .route("/tickets", delete(tickets::delete_all))
        .with_state(state)
}
