//! /images/{id}/checksum handlers
//!
//! Computes a block hash over the image. Zero extents and blocks that
//! read as zeroes reuse a precomputed digest, so sparse images hash
//! quickly.

use std::collections::HashMap;
use std::io::SeekFrom;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde_json::{Value, json};
use tracing::debug;

use vmio_auth::Ticket;
use vmio_auth::ticket::{Context, Op};
use vmio_common::blkhash::{self, Algorithm, Hash};
use vmio_common::extent::split;
use vmio_common::{AlignedBuffer, Clock, Error, Result};

use crate::errors::{ApiError, ApiResult};
use crate::state::{SharedState, checkin, checkout};

// Limit the block size to avoid abusing server resources.
const MIN_BLOCK_SIZE: u64 = blkhash::BLOCK_SIZE / 4;
const MAX_BLOCK_SIZE: u64 = blkhash::BLOCK_SIZE * 4;

pub async fn get(
    State(state): State<SharedState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let algorithm: Algorithm = query
        .get("algorithm")
        .map_or(Ok(blkhash::ALGORITHM), |name| name.parse())?;

    let block_size: u64 = match query.get("block_size") {
        None => blkhash::BLOCK_SIZE,
        Some(value) => value.parse().map_err(|_| {
            ApiError(Error::invalid_argument(format!(
                "invalid block size: {value:?}"
            )))
        })?,
    };
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::invalid_argument(format!(
            "block size out of allowed range: {MIN_BLOCK_SIZE}-{MAX_BLOCK_SIZE}"
        ))
        .into());
    }
    if block_size % 4096 != 0 {
        return Err(Error::invalid_argument("block size is not aligned to 4096").into());
    }

    let ticket = state.auth.authorize(&ticket_id, Op::Read)?;

    debug!(
        transfer = ticket.transfer_id(),
        algorithm = algorithm.as_str(),
        block_size,
        "CHECKSUM"
    );

    let clock = Clock::new();
    let mut ctx = checkout(&state, &ticket).await?;
    let result = checksum_op(&mut ctx, algorithm, block_size, &ticket, &clock).await;
    checkin(&ticket, ctx, result.is_err()).await;
    debug!(transfer = ticket.transfer_id(), %clock, "CHECKSUM done");

    Ok(Json(result?))
}

async fn checksum_op(
    ctx: &mut Context,
    algorithm: Algorithm,
    block_size: u64,
    ticket: &Ticket,
    clock: &Clock,
) -> Result<Value> {
    let backend = ctx.backend.as_mut();
    let extents = backend.zero_extents().await?;

    // The context buffer length depends on the backend configuration;
    // the hash needs exactly one block.
    let mut buf = AlignedBuffer::new(block_size as usize);
    let mut hash = Hash::new(algorithm);

    for block in split(&extents, block_size) {
        if ticket.canceled() {
            return Err(Error::Forbidden(format!(
                "ticket {} was canceled",
                ticket.uuid()
            )));
        }

        if block.zero {
            hash.zero(block.length);
            continue;
        }

        {
            let _timer = clock.run("read");
            backend.seek(SeekFrom::Start(block.start)).await?;
            read_block(backend, &mut buf, block.length as usize).await?;
        }

        let view = &buf.as_slice()[..block.length as usize];
        let _timer = clock.run("checksum");
        if blkhash::is_zero(view) {
            hash.zero(block.length);
        } else {
            hash.update(view);
        }
    }

    Ok(json!({
        "algorithm": algorithm.as_str(),
        "block_size": block_size,
        "checksum": hash.hexdigest(),
    }))
}

/// Read exactly `length` bytes into the start of `buf`. The image tail
/// may be shorter than the hash block, so reads are rounded up to the
/// backend block size to stay valid for direct I/O; the backend clips
/// them at end of file.
async fn read_block(
    backend: &mut dyn vmio_backend::Backend,
    buf: &mut AlignedBuffer,
    length: usize,
) -> Result<()> {
    let align = backend.block_size().max(1) as u64;
    let mut filled = 0;
    while filled < length {
        let want = vmio_common::units::round_up((length - filled) as u64, align)
            .min((buf.len() - filled) as u64) as usize;
        let n = backend
            .readinto(&mut buf.as_mut_slice()[filled..filled + want])
            .await?;
        if n == 0 {
            return Err(Error::PartialContent {
                requested: length as u64,
                available: filled as u64,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Server information, no authorization needed.
pub async fn algorithms() -> Json<Value> {
    Json(json!({"algorithms": Algorithm::names()}))
}
